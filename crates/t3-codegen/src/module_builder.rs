//! Per-method and per-module builders that sit between the AST-walking
//! [`crate::codegen::CodeGenerator`] and the raw [`t3_bytecode`] types.
//!
//! [`FunctionBuilder`] owns one method's local-slot table, its peephole
//! state, its operand-stack simulation, and the label bookkeeping loops and
//! branches need; [`ModuleBuilder`] owns the module-wide anchor table,
//! constant interner, and function/object registries everything else is
//! built against.

use rustc_hash::FxHashMap;

use t3_bytecode::{
    AnchorId, AnchorRegistry, AnchorTable, ByteStream, ConstValue, ConstantInterner,
    ExceptionTableEntry, Function, Label, MetaclassDep, MethodHeader, Module, ObjectDef, Opcode,
    StreamId,
};

use crate::jump_thread;
use crate::opstack::OpStack;
use crate::peephole::{FuseOutcome, Peephole};

/// Per-method state live only while one function/method body is being
/// generated; discarded at the method boundary (§3's lifecycle rule for
/// labels applies to all of this, not just labels).
pub struct FunctionBuilder {
    name: String,
    anchor: AnchorId,
    argc: u8,
    optional_argc: u8,
    varargs: bool,
    locals: FxHashMap<String, u16>,
    local_count: u16,
    stack: OpStack,
    peephole: Peephole,
    // Pre-instruction `(depth, peak)` snapshots, oldest first, one per
    // instruction the peephole could still treat as fusable -- bounded to
    // 2 because that's as far back as any fusion rule looks.
    stack_history: Vec<(i32, i32)>,
    exception_table: Vec<ExceptionTableEntry>,
    temp_count: u32,
}

impl FunctionBuilder {
    /// `anchor` must be the same [`AnchorId`] the caller registered for this
    /// function/method by name (or a fresh one for an anonymous function) --
    /// not one this constructor allocates itself, since forward references
    /// recorded against it before generation even starts (mutual recursion,
    /// §3) need to resolve to the exact identity [`Self::finish`] later
    /// defines.
    pub fn new(name: impl Into<String>, anchor: AnchorId) -> Self {
        FunctionBuilder {
            name: name.into(),
            anchor,
            argc: 0,
            optional_argc: 0,
            varargs: false,
            locals: FxHashMap::default(),
            local_count: 0,
            stack: OpStack::new(),
            peephole: Peephole::new(),
            stack_history: Vec::new(),
            exception_table: Vec::new(),
            temp_count: 0,
        }
    }

    /// Allocate a fresh local slot that no source name maps to, to hold a
    /// receiver/container/computed-result across the phased compound-
    /// assignment protocol (§4.6-4.7). Not reused across compilations of the
    /// same method -- one throwaway slot per use keeps this simple at the
    /// cost of a slightly larger local frame, as the real generator's own
    /// fixed-overhead helper locals do.
    pub fn declare_temp(&mut self) -> u16 {
        let name = format!("$t{}", self.temp_count);
        self.temp_count += 1;
        self.declare_local(name)
    }

    pub fn anchor(&self) -> AnchorId {
        self.anchor
    }

    pub fn set_argc(&mut self, argc: u8, optional_argc: u8, varargs: bool) {
        self.argc = argc;
        self.optional_argc = optional_argc;
        self.varargs = varargs;
    }

    /// Allocate the next free local slot for `name`, or return its existing
    /// one if already declared in this scope.
    pub fn declare_local(&mut self, name: impl Into<String>) -> u16 {
        let name = name.into();
        if let Some(&idx) = self.locals.get(&name) {
            return idx;
        }
        let idx = self.local_count;
        self.local_count += 1;
        self.locals.insert(name, idx);
        idx
    }

    pub fn local_slot(&self, name: &str) -> Option<u16> {
        self.locals.get(name).copied()
    }

    pub fn stack(&self) -> &OpStack {
        &self.stack
    }

    pub fn push_exception_entry(&mut self, entry: ExceptionTableEntry) {
        self.exception_table.push(entry);
    }

    /// Emit `opcode` with `operand` already encoded, through the peephole
    /// optimizer, updating the stack simulation to match whatever actually
    /// ended up in the stream -- not necessarily `opcode` itself, since
    /// fusion can erase it into an earlier instruction or drop it outright.
    /// `Disc1`'s effect depends on its own embedded operand, so it's
    /// special-cased in `apply_stack_effect` rather than trusted to
    /// `Opcode::stack_effect`.
    pub fn emit(&mut self, code: &mut t3_bytecode::ByteStream, opcode: Opcode, operand: &[u8]) {
        let before = self.stack.snapshot();
        match self.peephole.emit(code, opcode, operand) {
            FuseOutcome::Emitted { .. } => {
                self.apply_stack_effect(opcode, operand);
                self.push_stack_history(before);
            }
            FuseOutcome::Dropped => {
                // nothing landed in the stream; the stack is untouched.
            }
            FuseOutcome::Fused {
                replaced,
                opcode: fused,
                operand: fused_operand,
                ..
            } => {
                let restore_to = self.rollback_stack_history(replaced, before);
                self.stack.restore(restore_to);
                self.apply_stack_effect(fused, &fused_operand);
                self.push_stack_history(restore_to);
            }
        }
    }

    /// Emit an opcode whose push/pop counts depend on an argument count the
    /// caller already knows (the call/new family) and that `stack_effect`
    /// therefore can't report on its own. `fuse_lcl1_call` (§4.7) can still
    /// fold a preceding `GETLCL1` into this opcode -- e.g. `CALLPROPLCL1`
    /// has the same dynamic-argc shape as `CALLPROP` and so also can't be
    /// looked up via `stack_effect`, which is why the fused branch below
    /// adjusts `pops`/`pushes` itself rather than re-deriving them from the
    /// fused opcode.
    pub fn emit_dynamic(
        &mut self,
        code: &mut t3_bytecode::ByteStream,
        opcode: Opcode,
        operand: &[u8],
        pops: u16,
        pushes: u16,
    ) {
        let before = self.stack.snapshot();
        match self.peephole.emit(code, opcode, operand) {
            FuseOutcome::Emitted { .. } => {
                self.stack.apply(pops, pushes);
                self.push_stack_history(before);
            }
            FuseOutcome::Dropped => {}
            FuseOutcome::Fused { replaced, .. } => {
                // The erased instruction(s) folded their own effect into
                // `opcode`'s receiver/operand rather than the stack, but
                // `pops`/`pushes` were sized for the *unfused* call and
                // still describe the right net effect from `before` --
                // only the transient peak those erased instructions set is
                // wrong, since the bytes that would have reached it are
                // gone. Recompute from `restore_to` instead of trusting it.
                let restore_to = self.rollback_stack_history(replaced, before);
                // `before` already includes whatever the erased instructions
                // pushed/popped, so it's still the right baseline for the net
                // depth change -- only `peak` needs the pre-erasure baseline,
                // since the erased instructions' own transient high point no
                // longer exists in the final bytecode.
                let depth = before.0 - pops as i32 + pushes as i32;
                let peak = restore_to.1.max(depth);
                self.stack.restore((depth, peak));
                self.push_stack_history(restore_to);
            }
        }
    }

    /// Emit a jump opcode whose displacement isn't known yet -- the caller
    /// writes `placeholder` bytes and registers a fixup against the offset
    /// this returns. Routes through the peephole (§4.3) so a comparison
    /// opcode emitted right before this call is still eligible to fuse into
    /// a dedicated `J**` form (`GT;JF` -> `JLE`, etc.); `pops` is the jump's
    /// own pop count in the *unfused* case (the boolean the comparison
    /// already pushed), handled the same way `emit_dynamic` treats its
    /// caller-supplied counts as the unfused truth when fusion erases the
    /// instruction that produced them.
    pub fn emit_jump(
        &mut self,
        code: &mut t3_bytecode::ByteStream,
        opcode: Opcode,
        placeholder: &[u8],
        pops: u16,
    ) -> usize {
        let before = self.stack.snapshot();
        match self.peephole.emit(code, opcode, placeholder) {
            FuseOutcome::Emitted { at } => {
                self.stack.apply(pops, 0);
                self.push_stack_history(before);
                at + 1
            }
            FuseOutcome::Fused { replaced, at, .. } => {
                let restore_to = self.rollback_stack_history(replaced, before);
                let depth = before.0 - pops as i32;
                let peak = restore_to.1.max(depth);
                self.stack.restore((depth, peak));
                self.push_stack_history(restore_to);
                at + 1
            }
            FuseOutcome::Dropped => {
                unreachable!("a jump opcode is never a redundant-terminator candidate")
            }
        }
    }

    fn apply_stack_effect(&mut self, opcode: Opcode, operand: &[u8]) {
        if opcode == Opcode::Disc1 {
            let n = operand.first().copied().unwrap_or(0) as u16;
            self.stack.apply(n, 0);
            return;
        }
        match opcode.stack_effect() {
            Some((pops, pushes)) => self.stack.apply(pops, pushes),
            None => {
                // call/new family: caller must route through `emit_dynamic`.
            }
        }
    }

    /// Record the pre-instruction snapshot for the instruction just written,
    /// keeping only as many entries as the peephole can ever look back.
    fn push_stack_history(&mut self, before: (i32, i32)) {
        self.stack_history.push(before);
        if self.stack_history.len() > 2 {
            self.stack_history.remove(0);
        }
    }

    /// Pop `replaced` history entries and return the snapshot from just
    /// before the earliest one -- the state the stack needs to roll back to
    /// before re-applying the fused instruction's own effect. Falls back to
    /// `before` (the snapshot taken just before the opcode that triggered
    /// the fusion) if history is unexpectedly short; that can only happen
    /// if a future fusion rule reaches further back than any existing one.
    fn rollback_stack_history(&mut self, replaced: u8, before: (i32, i32)) -> (i32, i32) {
        let mut target = before;
        for _ in 0..replaced {
            match self.stack_history.pop() {
                Some(snapshot) => target = snapshot,
                None => break,
            }
        }
        target
    }

    /// Write `opcode`'s byte directly, bypassing the peephole optimizer
    /// entirely. Used for opcodes carrying a fixup operand whose position
    /// must be known and final the moment this call returns and that have
    /// no fusion rule of their own (`Call`, `PushFnPtr`, `PushStr`,
    /// `PushFloat`, `PushLst`). Jumps go through [`Self::emit_jump`]
    /// instead, since those *do* have fusion rules (§4.3) and still need a
    /// final fixup offset once fusion has had its say.
    pub fn emit_raw(&mut self, code: &mut ByteStream, opcode: Opcode) -> usize {
        self.peephole.clear();
        self.stack_history.clear();
        let at = code.current_offset();
        code.write_u8(opcode.to_u8());
        at
    }

    /// Record an opcode's stack effect without writing anything -- the
    /// companion to [`Self::emit_raw`] once the caller has written the
    /// opcode's own operand bytes directly.
    pub fn note_effect(&mut self, pops: u16, pushes: u16) {
        self.stack.apply(pops, pushes);
    }

    /// Clear peephole state at a label definition or source-line boundary,
    /// per §4.3.
    pub fn break_peephole_run(&mut self) {
        self.peephole.clear();
        self.stack_history.clear();
    }

    pub fn new_label(&self) -> Label {
        Label::new()
    }

    /// Finalize this method: record its start/length on the anchor,
    /// register its header and exception table, thread its jumps, and
    /// append it to `module.functions`.
    pub fn finish(
        self,
        code: &mut t3_bytecode::ByteStream,
        anchors: &mut AnchorTable,
        start: usize,
        diagnostics_have_errors: bool,
    ) -> Function {
        let len = code.current_offset() - start;
        anchors.set_length(self.anchor, len);
        jump_thread::thread_jumps(code, start, len, diagnostics_have_errors);

        let header = MethodHeader {
            argc: self.argc,
            varargs: self.varargs,
            optional_argc: self.optional_argc,
            local_count: self.local_count,
            max_stack: self.stack.peak().max(0) as u16,
            exc_table_rel_offset: 0,
            debug_rel_offset: 0,
        };
        Function {
            name: self.name,
            anchor: self.anchor,
            header,
            exception_table: self.exception_table,
        }
    }
}

/// Module-wide state: the anchor table, constant interner, and the
/// function/object name registries the generator consults while resolving
/// call and `new` targets.
pub struct ModuleBuilder {
    module: Module,
    interner: ConstantInterner,
    functions_by_name: AnchorRegistry,
    objects_by_name: AnchorRegistry,
    prop_ids: FxHashMap<String, u16>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        ModuleBuilder {
            module: Module::new(),
            interner: ConstantInterner::new(),
            functions_by_name: AnchorRegistry::new(),
            objects_by_name: AnchorRegistry::new(),
            prop_ids: FxHashMap::default(),
        }
    }

    /// Eagerly assign (or return the already-assigned) property id for
    /// `name`. Per the reference-kind taxonomy, `PropId` has no linker step
    /// in this single-translation-unit compiler, so ids are handed out on
    /// first sight rather than deferred through a fixup.
    pub fn prop_id(&mut self, name: &str) -> u16 {
        if let Some(&id) = self.prop_ids.get(name) {
            return id;
        }
        let id = self.prop_ids.len() as u16;
        self.prop_ids.insert(name.to_string(), id);
        id
    }

    pub fn anchors_mut(&mut self) -> &mut AnchorTable {
        &mut self.module.anchors
    }

    pub fn code_mut(&mut self) -> &mut t3_bytecode::ByteStream {
        &mut self.module.code
    }

    pub fn constants_mut(&mut self) -> &mut t3_bytecode::ByteStream {
        &mut self.module.constants
    }

    pub fn objects_data_mut(&mut self) -> &mut t3_bytecode::ByteStream {
        &mut self.module.objects_data
    }

    pub fn interner_mut(&mut self) -> &mut ConstantInterner {
        &mut self.interner
    }

    /// Intern `s` into the constant data stream, registering a fixup-ready
    /// anchor for it. A thin wrapper over [`ConstantInterner::intern_string`]
    /// that hides the three-way split borrow its signature would otherwise
    /// force on every call site.
    pub fn intern_string(&mut self, s: &str) -> AnchorId {
        self.interner
            .intern_string(&mut self.module.constants, &mut self.module.anchors, s)
    }

    /// Encode a compile-time-constant list literal into the constant pool.
    /// See [`Self::intern_string`] -- same rationale for hiding the split
    /// borrow.
    pub fn intern_list(&mut self, elements: &[ConstValue]) -> AnchorId {
        self.interner
            .intern_list(&mut self.module.constants, &mut self.module.anchors, elements)
    }

    /// Borrow the code stream and the anchor table at once, for call sites
    /// (chiefly [`FunctionBuilder::finish`]) that need both in the same call.
    pub fn code_and_anchors_mut(&mut self) -> (&mut ByteStream, &mut AnchorTable) {
        (&mut self.module.code, &mut self.module.anchors)
    }

    pub fn register_function(&mut self, name: &str, anchor: AnchorId) {
        self.functions_by_name.insert(name, anchor);
    }

    pub fn register_object(&mut self, name: &str, anchor: AnchorId) {
        self.objects_by_name.insert(name, anchor);
    }

    pub fn function_anchor(&self, name: &str) -> Option<AnchorId> {
        self.functions_by_name.get(name)
    }

    pub fn object_anchor(&self, name: &str) -> Option<AnchorId> {
        self.objects_by_name.get(name)
    }

    pub fn push_function(&mut self, function: Function) {
        self.module.functions.push(function);
    }

    pub fn push_object(&mut self, object: ObjectDef) {
        self.module.objects.push(object);
    }

    pub fn push_metaclass_dep(&mut self, dep: MetaclassDep) {
        if let Some(existing) = self
            .module
            .metaclasses
            .iter_mut()
            .find(|m| m.entry.name == dep.entry.name)
        {
            for prop in dep.prop_ids {
                if !existing.prop_ids.contains(&prop) {
                    existing.prop_ids.push(prop);
                }
            }
        } else {
            self.module.metaclasses.push(dep);
        }
    }

    pub fn set_entry_point(&mut self, anchor: AnchorId) {
        self.module.entry_point = Some(anchor);
    }

    pub fn into_module(self) -> Module {
        self.module
    }

    /// Walk every anchor's inbound fixups and patch the final addresses in,
    /// once every function and object body has been emitted.
    pub fn resolve(&mut self) -> Result<(), t3_bytecode::AnchorError> {
        let Module {
            anchors,
            code,
            constants,
            objects_data,
            ..
        } = &mut self.module;
        anchors.resolve(&mut t3_bytecode::Streams {
            code,
            constants,
            objects: objects_data,
        })
    }
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}
