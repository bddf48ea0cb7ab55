//! AST-to-bytecode code generation (§3, §4.6-§4.8).
//!
//! Two passes over the top-level statement list: [`CodeGenerator::generate`]
//! first pre-registers every function and object name against its own
//! anchor, so mutually-recursive functions and objects can reference each
//! other regardless of declaration order, then walks each body in turn.
//!
//! Everything emitted here is deliberately the naive, unfused form --
//! `GetLcl1`/op/`SetLcl1` rather than `AddToLcl`, `GT`/`JF` rather than
//! `JLE` -- and relies on [`crate::peephole::Peephole`] to recover the fused
//! forms after the fact. Plain opcodes route through
//! [`crate::module_builder::FunctionBuilder::emit`]; jumps route through
//! [`crate::module_builder::FunctionBuilder::emit_jump`] instead, since a
//! jump's displacement is a fixup the label machinery patches later, but
//! both still pass through the peephole, so `GT;JF` still fuses to `JLE`
//! (§4.3, §8). Opcodes carrying a fixup operand with no fusion rule of
//! their own (`Call`, `PushFnPtr`, `PushStr`, `PushFloat`, `PushLst`,
//! `New1`, `New2`) bypass the peephole entirely via `emit_raw`, since their
//! operand bytes must land at a stream offset that's stable the moment this
//! call returns.

use std::cell::RefCell;
use std::rc::Rc;

use t3_bytecode::{
    AnchorId, ConstValue, ExceptionTableEntry, FixupWidth, Function, Label, MetaclassDep,
    ObjectDef, Opcode, ReferenceKind, StreamId,
};

use crate::ast::{self, BinaryOp, CompoundOp, Expr, LogicalOp, MemberProp, Stmt, StrPart, UnaryOp};
use crate::diagnostics::{DiagKind, DiagnosticSink};
use crate::module_builder::{FunctionBuilder, ModuleBuilder};

type SharedLabel = Rc<RefCell<Label>>;

fn new_shared_label() -> SharedLabel {
    Rc::new(RefCell::new(Label::new()))
}

/// The break/continue targets active inside one loop body.
struct LoopLabels {
    break_label: SharedLabel,
    continue_label: SharedLabel,
}

/// An assignment target, classified by which opcode family stores into it.
enum Lvalue<'e> {
    Local(u16),
    SelfProp(u16),
    Member(&'e Expr, u16),
    Index(&'e Expr, &'e Expr),
}

/// Walks a parsed module and emits bytecode for it, accumulating non-fatal
/// diagnostics along the way rather than aborting at the first mistake.
pub struct CodeGenerator {
    mb: ModuleBuilder,
    diagnostics: DiagnosticSink,
    loops: Vec<LoopLabels>,
    in_method: bool,
    func_start: usize,
    anon_count: u32,
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGenerator {
    pub fn new() -> Self {
        CodeGenerator {
            mb: ModuleBuilder::new(),
            diagnostics: DiagnosticSink::new(),
            loops: Vec::new(),
            in_method: false,
            func_start: 0,
            anon_count: 0,
        }
    }

    /// Consume `self`, producing the finished module and every diagnostic
    /// raised while building it.
    pub fn generate(mut self, module: &ast::Module) -> (t3_bytecode::Module, DiagnosticSink) {
        self.register_top_level(module);
        for stmt in &module.statements {
            match stmt {
                Stmt::FunctionDecl(decl) => self.gen_top_level_function(decl),
                Stmt::ObjectDecl(decl) => self.gen_object(decl),
                _ => self.diagnostics.error(
                    DiagKind::ExprTooComplex,
                    "only function and object declarations are permitted at module scope",
                ),
            }
        }
        if let Err(err) = self.mb.resolve() {
            self.diagnostics
                .error(DiagKind::UndefinedLabel, format!("{err}"));
        }
        (self.mb.into_module(), self.diagnostics)
    }

    fn register_top_level(&mut self, module: &ast::Module) {
        for stmt in &module.statements {
            match stmt {
                Stmt::FunctionDecl(decl) => {
                    let anchor = self.mb.anchors_mut().create(StreamId::Code);
                    self.mb.register_function(&decl.name, anchor);
                }
                Stmt::ObjectDecl(decl) => {
                    let anchor = self.mb.anchors_mut().create(StreamId::Object);
                    self.mb.register_object(&decl.name, anchor);
                }
                _ => {}
            }
        }
    }

    // ---- low-level emission -----------------------------------------------

    fn emit(&mut self, fb: &mut FunctionBuilder, opcode: Opcode, operand: &[u8]) {
        let code = self.mb.code_mut();
        fb.emit(code, opcode, operand);
    }

    fn emit_dynamic(&mut self, fb: &mut FunctionBuilder, opcode: Opcode, operand: &[u8], pops: u16, pushes: u16) {
        let code = self.mb.code_mut();
        fb.emit_dynamic(code, opcode, operand, pops, pushes);
    }

    /// Writes through [`FunctionBuilder::emit_jump`] rather than
    /// `emit_raw`, so a comparison emitted right before this call can still
    /// fuse into a dedicated `J**` opcode (§4.3, §8 scenarios 2-3). The
    /// 2-byte placeholder may end up at an earlier stream offset than where
    /// this call started if fusion erased a preceding instruction -- the
    /// returned offset, not the pre-call one, is what the label's pending
    /// site must be registered against.
    fn emit_jump(&mut self, fb: &mut FunctionBuilder, opcode: Opcode, label: &mut Label, pops: u16) {
        let code = self.mb.code_mut();
        let site = fb.emit_jump(code, opcode, &[0, 0], pops);
        let code = self.mb.code_mut();
        label.register_reference_at(code, site);
    }

    fn define_label(&mut self, fb: &mut FunctionBuilder, label: &mut Label) {
        let code = self.mb.code_mut();
        label.define(code);
        fb.break_peephole_run();
    }

    fn emit_jump_shared(&mut self, fb: &mut FunctionBuilder, opcode: Opcode, label: &SharedLabel, pops: u16) {
        let code = self.mb.code_mut();
        let site = fb.emit_jump(code, opcode, &[0, 0], pops);
        let code = self.mb.code_mut();
        label.borrow_mut().register_reference_at(code, site);
    }

    fn define_shared(&mut self, fb: &mut FunctionBuilder, label: &SharedLabel) {
        let code = self.mb.code_mut();
        label.borrow_mut().define(code);
        fb.break_peephole_run();
    }

    /// `Call`'s code-address operand is a fixup, so it's written raw rather
    /// than through the peephole. The 4-byte address slot is followed
    /// directly by the 1-byte argument count, its fixed operand's last byte.
    fn emit_call(&mut self, fb: &mut FunctionBuilder, target: AnchorId, argc: u8) {
        let code = self.mb.code_mut();
        fb.emit_raw(code, Opcode::Call);
        let code = self.mb.code_mut();
        let slot = code.reserve_u32();
        code.write_u8(argc);
        self.mb
            .anchors_mut()
            .add_fixup(target, StreamId::Code, slot, FixupWidth::Four, ReferenceKind::CodeAddr);
        fb.note_effect(argc as u16, 0);
    }

    fn emit_push_fn_ptr(&mut self, fb: &mut FunctionBuilder, target: AnchorId) {
        let code = self.mb.code_mut();
        fb.emit_raw(code, Opcode::PushFnPtr);
        let code = self.mb.code_mut();
        let slot = code.reserve_u16();
        self.mb
            .anchors_mut()
            .add_fixup(target, StreamId::Code, slot, FixupWidth::Two, ReferenceKind::CodeAddr);
        fb.note_effect(0, 1);
    }

    /// `target_stream` on every fixup below names where the placeholder
    /// bytes physically live -- the code stream, since all three of these
    /// reserve their slot via `code_mut()` -- not what stream the anchor's
    /// own value resolves into.
    fn emit_push_str(&mut self, fb: &mut FunctionBuilder, s: &str) {
        let anchor = self.mb.intern_string(s);
        let code = self.mb.code_mut();
        fb.emit_raw(code, Opcode::PushStr);
        let code = self.mb.code_mut();
        let slot = code.reserve_u16();
        self.mb
            .anchors_mut()
            .add_fixup(anchor, StreamId::Code, slot, FixupWidth::Two, ReferenceKind::ConstAddr);
        fb.note_effect(0, 1);
    }

    fn emit_push_float(&mut self, fb: &mut FunctionBuilder, f: f64) {
        let anchor = self.mb.anchors_mut().create(StreamId::Const);
        let at = self.mb.constants_mut().current_offset();
        self.mb.anchors_mut().define(anchor, at).ok();
        self.mb.constants_mut().write_f64(f);
        self.mb.anchors_mut().set_length(anchor, 8);

        let code = self.mb.code_mut();
        fb.emit_raw(code, Opcode::PushFloat);
        let code = self.mb.code_mut();
        let slot = code.reserve_u32();
        self.mb
            .anchors_mut()
            .add_fixup(anchor, StreamId::Code, slot, FixupWidth::Four, ReferenceKind::ConstAddr);
        fb.note_effect(0, 1);
    }

    // ---- functions ----------------------------------------------------------

    fn gen_top_level_function(&mut self, decl: &ast::FunctionDecl) {
        let anchor = self.mb.function_anchor(&decl.name).expect("registered above");
        let function = self.gen_function_body(&decl.name, anchor, decl);
        if decl.name == "main" {
            self.mb.set_entry_point(anchor);
        }
        self.mb.push_function(function);
    }

    fn gen_function_body(&mut self, name: &str, anchor: AnchorId, decl: &ast::FunctionDecl) -> Function {
        let was_in_method = self.in_method;
        self.in_method = was_in_method || decl.is_constructor;
        let saved_func_start = self.func_start;

        let mut fb = FunctionBuilder::new(name, anchor);
        for param in &decl.params.fixed {
            fb.declare_local(param.clone());
        }
        for (param, _) in &decl.params.optional {
            fb.declare_local(param.clone());
        }
        if let Some(rest) = &decl.params.varargs {
            fb.declare_local(rest.clone());
        }
        fb.set_argc(
            decl.params.fixed.len() as u8,
            decl.params.optional.len() as u8,
            decl.params.varargs.is_some(),
        );

        let code_offset = self.mb.code_mut().current_offset();
        self.mb.anchors_mut().define(anchor, code_offset).ok();
        self.func_start = code_offset;

        for (param, default) in &decl.params.optional {
            let slot = fb.local_slot(param).expect("declared above");
            self.emit(&mut fb, Opcode::GetLcl1, &slot.to_le_bytes());
            let mut have_value = Label::new();
            self.emit_jump(&mut fb, Opcode::JNotNil, &mut have_value, 1);
            self.gen_expr(&mut fb, default);
            self.emit(&mut fb, Opcode::SetLcl1, &slot.to_le_bytes());
            self.define_label(&mut fb, &mut have_value);
        }

        for stmt in &decl.body {
            self.gen_stmt(&mut fb, stmt);
        }
        self.emit(&mut fb, Opcode::RetNil, &[]);

        let has_errors = self.diagnostics.has_errors();
        let func_start = self.func_start;
        let (code, anchors) = self.mb.code_and_anchors_mut();
        let function = fb.finish(code, anchors, func_start, has_errors);

        self.in_method = was_in_method;
        self.func_start = saved_func_start;
        function
    }

    fn gen_anon_func(&mut self, fb_outer: &mut FunctionBuilder, decl: &ast::FunctionDecl) {
        let name = format!("$anon{}", self.anon_count);
        self.anon_count += 1;
        let anchor = self.mb.anchors_mut().create(StreamId::Code);
        let function = self.gen_function_body(&name, anchor, decl);
        self.mb.push_function(function);
        // `decl.captures` (the enclosing scope's context-vector layout) is
        // not wired up: this always produces a plain function-pointer
        // value, never a closure over the defining scope's locals.
        self.emit_push_fn_ptr(fb_outer, anchor);
    }

    // ---- objects --------------------------------------------------------

    fn gen_object(&mut self, decl: &ast::ObjectDecl) {
        let anchor = self.mb.object_anchor(&decl.name).expect("registered above");

        let mut sc_anchors = Vec::new();
        for sc in &decl.superclasses {
            match self.mb.object_anchor(sc) {
                Some(a) => sc_anchors.push(a),
                None => self.diagnostics.error(
                    DiagKind::BadMetaForNew,
                    format!("superclass '{sc}' does not name a known object"),
                ),
            }
        }

        let prop_ids: Vec<u16> = decl.properties.iter().map(|(name, _)| self.mb.prop_id(name)).collect();
        self.mb.push_metaclass_dep(MetaclassDep {
            entry: t3_bytecode::DependencyEntry {
                name: decl.metaclass.clone(),
                version: 1,
            },
            prop_ids,
        });

        let data_start = self.mb.objects_data_mut().current_offset();
        self.mb.anchors_mut().define(anchor, data_start).ok();

        self.mb.objects_data_mut().write_u16(sc_anchors.len() as u16);
        for sc in &sc_anchors {
            let slot = self.mb.objects_data_mut().reserve_u32();
            self.mb
                .anchors_mut()
                .add_fixup(*sc, StreamId::Object, slot, FixupWidth::Four, ReferenceKind::ObjId);
        }

        self.mb.objects_data_mut().write_u16(decl.properties.len() as u16);
        for (name, value) in &decl.properties {
            let prop_id = self.mb.prop_id(name);
            self.mb.objects_data_mut().write_u16(prop_id);
            self.write_object_prop_value(value);
        }

        let data_len = self.mb.objects_data_mut().current_offset() - data_start;
        self.mb.anchors_mut().set_length(anchor, data_len);

        self.mb.push_object(ObjectDef {
            name: decl.name.clone(),
            metaclass: decl.metaclass.clone(),
            anchor,
            large_objects: data_len > u16::MAX as usize,
            transient: false,
        });
    }

    /// Encode a property initializer's value directly into the object's
    /// data region. Only compile-time constants are supported here -- an
    /// object's static property table has no bytecode to evaluate a general
    /// expression against.
    fn write_object_prop_value(&mut self, value: &Expr) {
        match value {
            Expr::Nil => self.mb.objects_data_mut().write_u8(0),
            Expr::Bool(true) => self.mb.objects_data_mut().write_u8(1),
            Expr::Bool(false) => self.mb.objects_data_mut().write_u8(0),
            Expr::Int(i) => {
                self.mb.objects_data_mut().write_u8(2);
                self.mb.objects_data_mut().write_i32(*i);
            }
            Expr::Float(f) => {
                self.mb.objects_data_mut().write_u8(3);
                self.mb.objects_data_mut().write_f64(*f);
            }
            Expr::Str(s) => {
                self.mb.objects_data_mut().write_u8(4);
                let anchor = self.mb.intern_string(s);
                let slot = self.mb.objects_data_mut().reserve_u32();
                self.mb
                    .anchors_mut()
                    .add_fixup(anchor, StreamId::Object, slot, FixupWidth::Four, ReferenceKind::ConstAddr);
            }
            _ => {
                self.diagnostics.error(
                    DiagKind::ExprTooComplex,
                    "object property initializers must be compile-time constants",
                );
                self.mb.objects_data_mut().write_u8(0);
            }
        }
    }

    // ---- statements -----------------------------------------------------

    /// §4.4's per-statement contract: whatever `stmt` does to the simulated
    /// operand stack, it must leave depth exactly where it found it. Checked
    /// here rather than trusted, since a violation means a generation bug
    /// that would otherwise only surface as a confusing `max_stack`/verifier
    /// mismatch several statements later.
    fn gen_stmt(&mut self, fb: &mut FunctionBuilder, stmt: &Stmt) {
        let entry_depth = fb.stack().depth();
        self.gen_stmt_inner(fb, stmt);
        if !fb.stack().balanced_since(entry_depth) {
            self.diagnostics.error(
                DiagKind::StackImbalance,
                format!(
                    "statement left the operand stack at depth {} instead of {entry_depth}",
                    fb.stack().depth()
                ),
            );
        }
    }

    fn gen_stmt_inner(&mut self, fb: &mut FunctionBuilder, stmt: &Stmt) {
        match stmt {
            Stmt::FunctionDecl(_) | Stmt::ObjectDecl(_) => {
                self.diagnostics.error(
                    DiagKind::ExprTooComplex,
                    "nested function and object declarations are not supported",
                );
            }
            Stmt::VarDecl { name, init } => {
                let slot = fb.declare_local(name.clone());
                match init {
                    Some(expr) => {
                        self.gen_expr(fb, expr);
                        self.emit(fb, Opcode::SetLcl1, &slot.to_le_bytes());
                    }
                    None => {
                        self.emit(fb, Opcode::PushNil, &[]);
                        self.emit(fb, Opcode::SetLcl1, &slot.to_le_bytes());
                    }
                }
            }
            Stmt::Expr(expr) => self.gen_expr_discard(fb, expr),
            Stmt::Say(parts) => self.gen_say(fb, parts),
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.gen_stmt(fb, s);
                }
            }
            Stmt::If { cond, then_branch, else_branch } => {
                self.gen_if(fb, cond, then_branch, else_branch.as_deref());
            }
            Stmt::While { cond, body } => self.gen_while(fb, cond, body),
            Stmt::For { init, cond, step, body } => {
                self.gen_for(fb, init.as_deref(), cond.as_ref(), step.as_ref(), body);
            }
            Stmt::Return(value) => match value {
                Some(expr) => {
                    self.gen_expr(fb, expr);
                    self.emit(fb, Opcode::RetVal, &[]);
                }
                None => self.emit(fb, Opcode::RetNil, &[]),
            },
            Stmt::Break => match self.loops.last() {
                Some(loop_labels) => {
                    let label = loop_labels.break_label.clone();
                    self.emit_jump_shared(fb, Opcode::Jmp, &label, 0);
                }
                None => self
                    .diagnostics
                    .error(DiagKind::ExprTooComplex, "break outside of a loop"),
            },
            Stmt::Continue => match self.loops.last() {
                Some(loop_labels) => {
                    let label = loop_labels.continue_label.clone();
                    self.emit_jump_shared(fb, Opcode::Jmp, &label, 0);
                }
                None => self
                    .diagnostics
                    .error(DiagKind::ExprTooComplex, "continue outside of a loop"),
            },
            Stmt::Throw(expr) => {
                self.gen_expr(fb, expr);
                self.emit(fb, Opcode::Throw, &[]);
            }
            Stmt::Try { body, catch, finally } => {
                let catch = catch.as_ref().map(|(name, body)| (name.as_str(), body.as_ref()));
                self.gen_try(fb, body, catch, finally.as_deref());
            }
        }
    }

    /// §4.8: each literal run becomes `PUSHSTR`+`SAY`, each `<<expr>>` run
    /// becomes its value expression followed by `SAYVAL`. Nothing is left
    /// on the stack between parts or after the last one.
    fn gen_say(&mut self, fb: &mut FunctionBuilder, parts: &[StrPart]) {
        for part in parts {
            match part {
                StrPart::Lit(s) => {
                    if s.is_empty() {
                        continue;
                    }
                    self.emit_push_str(fb, s);
                    self.emit(fb, Opcode::Say, &[]);
                }
                StrPart::Embed(expr) => {
                    self.gen_expr(fb, expr);
                    self.emit(fb, Opcode::SayVal, &[]);
                }
            }
        }
    }

    fn gen_if(&mut self, fb: &mut FunctionBuilder, cond: &Expr, then_branch: &Stmt, else_branch: Option<&Stmt>) {
        self.gen_expr(fb, cond);
        let mut else_label = Label::new();
        self.emit_jump(fb, Opcode::Jf, &mut else_label, 1);
        self.gen_stmt(fb, then_branch);
        match else_branch {
            Some(else_stmt) => {
                let mut end_label = Label::new();
                self.emit_jump(fb, Opcode::Jmp, &mut end_label, 0);
                self.define_label(fb, &mut else_label);
                self.gen_stmt(fb, else_stmt);
                self.define_label(fb, &mut end_label);
            }
            None => self.define_label(fb, &mut else_label),
        }
    }

    fn gen_while(&mut self, fb: &mut FunctionBuilder, cond: &Expr, body: &Stmt) {
        let start = new_shared_label();
        let end = new_shared_label();
        self.define_shared(fb, &start);
        self.gen_expr(fb, cond);
        self.emit_jump_shared(fb, Opcode::Jf, &end, 1);
        self.loops.push(LoopLabels {
            break_label: end.clone(),
            continue_label: start.clone(),
        });
        self.gen_stmt(fb, body);
        self.loops.pop();
        self.emit_jump_shared(fb, Opcode::Jmp, &start, 0);
        self.define_shared(fb, &end);
    }

    fn gen_for(
        &mut self,
        fb: &mut FunctionBuilder,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Expr>,
        body: &Stmt,
    ) {
        if let Some(init_stmt) = init {
            self.gen_stmt(fb, init_stmt);
        }
        let start = new_shared_label();
        let end = new_shared_label();
        let step_label = new_shared_label();
        self.define_shared(fb, &start);
        if let Some(c) = cond {
            self.gen_expr(fb, c);
            self.emit_jump_shared(fb, Opcode::Jf, &end, 1);
        }
        self.loops.push(LoopLabels {
            break_label: end.clone(),
            continue_label: step_label.clone(),
        });
        self.gen_stmt(fb, body);
        self.loops.pop();
        self.define_shared(fb, &step_label);
        if let Some(s) = step {
            self.gen_expr_discard(fb, s);
        }
        self.emit_jump_shared(fb, Opcode::Jmp, &start, 0);
        self.define_shared(fb, &end);
    }

    /// One generic catch-all handler: no typed exception matching, and a
    /// `finally` block runs only on the fall-through path, never on the
    /// exceptional one (a real two-entry finally needs a second landing pad
    /// this generator doesn't build).
    fn gen_try(&mut self, fb: &mut FunctionBuilder, body: &Stmt, catch: Option<(&str, &Stmt)>, finally: Option<&Stmt>) {
        let start_rel = (self.mb.code_mut().current_offset() - self.func_start) as u16;
        self.gen_stmt(fb, body);
        let end_rel = (self.mb.code_mut().current_offset() - self.func_start) as u16;

        if let Some((var_name, catch_body)) = catch {
            let mut after_catch = Label::new();
            self.emit_jump(fb, Opcode::Jmp, &mut after_catch, 0);
            let catch_rel = (self.mb.code_mut().current_offset() - self.func_start) as u16;
            fb.break_peephole_run();
            // the runtime leaves the thrown value on the stack before
            // transferring control to the catch handler -- a push the
            // simulator never sees emitted, so it has to be noted by hand
            // before the SetLcl1 that consumes it.
            fb.note_effect(0, 1);
            let slot = fb.declare_local(var_name.to_string());
            self.emit(fb, Opcode::SetLcl1, &slot.to_le_bytes());
            self.gen_stmt(fb, catch_body);
            self.define_label(fb, &mut after_catch);
            fb.push_exception_entry(ExceptionTableEntry {
                start_rel,
                end_rel,
                exc_obj_id: 0,
                catch_rel,
            });
        }

        if let Some(finally_body) = finally {
            self.gen_stmt(fb, finally_body);
        }
    }

    // ---- expressions ------------------------------------------------------

    fn gen_expr(&mut self, fb: &mut FunctionBuilder, expr: &Expr) {
        match expr {
            Expr::Int(i) => self.gen_int(fb, *i),
            Expr::Float(f) => self.emit_push_float(fb, *f),
            Expr::Str(s) => self.emit_push_str(fb, s),
            Expr::Bool(true) => self.emit(fb, Opcode::PushTrue, &[]),
            Expr::Bool(false) => self.emit(fb, Opcode::PushNil, &[]),
            Expr::Nil => self.emit(fb, Opcode::PushNil, &[]),
            Expr::List(elements) => self.gen_list(fb, elements),
            Expr::Ident(name) => self.gen_ident(fb, name),
            Expr::Binary { op, left, right } => {
                self.gen_expr(fb, left);
                self.gen_expr(fb, right);
                self.emit(fb, binop_opcode(*op), &[]);
            }
            Expr::Logical { op, left, right } => self.gen_logical(fb, *op, left, right),
            Expr::Unary { op, operand } => {
                self.gen_expr(fb, operand);
                let opcode = match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Not => Opcode::Not,
                };
                self.emit(fb, opcode, &[]);
            }
            Expr::Assign { target, op, value } => {
                self.gen_assign(fb, target, *op, value.as_deref(), true);
            }
            Expr::Call { callee, args, named_args } => {
                self.gen_call(fb, callee, args, named_args, true);
            }
            Expr::New { class, args, named_args, is_transient } => {
                self.gen_new(fb, class, args, named_args, *is_transient, true);
            }
            Expr::Member { target, prop } => self.gen_member_read(fb, target, prop),
            Expr::Index { target, index } => {
                self.gen_expr(fb, target);
                self.gen_expr(fb, index);
                self.emit(fb, Opcode::GetInd, &[]);
            }
            Expr::Ternary { cond, then_expr, else_expr } => self.gen_ternary(fb, cond, then_expr, else_expr),
            Expr::Inherited { through, args } => self.gen_inherited(fb, through, args, true),
            Expr::AnonFunc(decl) => self.gen_anon_func(fb, decl),
        }
    }

    /// Generate `expr` purely for its side effects.
    fn gen_expr_discard(&mut self, fb: &mut FunctionBuilder, expr: &Expr) {
        match expr {
            Expr::Assign { target, op, value } => {
                self.gen_assign(fb, target, *op, value.as_deref(), false);
            }
            Expr::Call { callee, args, named_args } => {
                self.gen_call(fb, callee, args, named_args, false);
            }
            Expr::New { class, args, named_args, is_transient } => {
                self.gen_new(fb, class, args, named_args, *is_transient, false);
            }
            Expr::Inherited { through, args } => self.gen_inherited(fb, through, args, false),
            _ => {
                self.gen_expr(fb, expr);
                self.emit(fb, Opcode::Disc, &[]);
            }
        }
    }

    fn gen_int(&mut self, fb: &mut FunctionBuilder, i: i32) {
        match i {
            0 => self.emit(fb, Opcode::Push0, &[]),
            1 => self.emit(fb, Opcode::Push1, &[]),
            -128..=127 => self.emit(fb, Opcode::PushInt8, &[(i as i8) as u8]),
            _ => self.emit(fb, Opcode::PushInt, &i.to_le_bytes()),
        }
    }

    fn gen_ident(&mut self, fb: &mut FunctionBuilder, name: &str) {
        if let Some(slot) = fb.local_slot(name) {
            self.emit(fb, Opcode::GetLcl1, &slot.to_le_bytes());
        } else if let Some(anchor) = self.mb.function_anchor(name) {
            self.emit_push_fn_ptr(fb, anchor);
        } else if self.in_method {
            let propid = self.mb.prop_id(name);
            self.emit(fb, Opcode::GetPropSelf, &(propid as u32).to_le_bytes());
        } else {
            self.diagnostics
                .error(DiagKind::SelfNotAvailable, format!("'{name}' is not defined here"));
            self.emit(fb, Opcode::PushNil, &[]);
        }
    }

    fn gen_list(&mut self, fb: &mut FunctionBuilder, elements: &[Expr]) {
        let mut values = Vec::with_capacity(elements.len());
        for e in elements {
            match self.const_value_of(e) {
                Some(v) => values.push(v),
                None => {
                    self.diagnostics.error(
                        DiagKind::ExprTooComplex,
                        "list literals with non-constant elements are not supported",
                    );
                    self.emit(fb, Opcode::PushNil, &[]);
                    return;
                }
            }
        }
        let anchor = self.mb.intern_list(&values);
        let code = self.mb.code_mut();
        fb.emit_raw(code, Opcode::PushLst);
        let code = self.mb.code_mut();
        let slot = code.reserve_u16();
        self.mb
            .anchors_mut()
            .add_fixup(anchor, StreamId::Code, slot, FixupWidth::Two, ReferenceKind::ConstAddr);
        fb.note_effect(0, 1);
    }

    fn const_value_of(&mut self, expr: &Expr) -> Option<ConstValue> {
        match expr {
            Expr::Nil => Some(ConstValue::Nil),
            Expr::Bool(true) => Some(ConstValue::True),
            Expr::Bool(false) => Some(ConstValue::Nil),
            Expr::Int(i) => Some(ConstValue::Int(*i)),
            Expr::Float(f) => Some(ConstValue::Float(*f)),
            Expr::Str(s) => Some(ConstValue::Str(self.mb.intern_string(s))),
            _ => None,
        }
    }

    fn gen_logical(&mut self, fb: &mut FunctionBuilder, op: LogicalOp, left: &Expr, right: &Expr) {
        self.gen_expr(fb, left);
        let mut end = Label::new();
        // JST/JSF dup, test, and (on the not-taken path) discard the dup
        // internally, so no manual Dup/Disc is needed around them.
        let opcode = match op {
            LogicalOp::And => Opcode::Jsf,
            LogicalOp::Or => Opcode::Jst,
        };
        self.emit_jump(fb, opcode, &mut end, 0);
        self.gen_expr(fb, right);
        self.define_label(fb, &mut end);
    }

    fn gen_ternary(&mut self, fb: &mut FunctionBuilder, cond: &Expr, then_expr: &Expr, else_expr: &Expr) {
        self.gen_expr(fb, cond);
        let mut else_label = Label::new();
        self.emit_jump(fb, Opcode::Jf, &mut else_label, 1);
        self.gen_expr(fb, then_expr);
        let mut end_label = Label::new();
        self.emit_jump(fb, Opcode::Jmp, &mut end_label, 0);
        self.define_label(fb, &mut else_label);
        self.gen_expr(fb, else_expr);
        self.define_label(fb, &mut end_label);
    }

    fn gen_member_read(&mut self, fb: &mut FunctionBuilder, target: &Expr, prop: &MemberProp) {
        match prop {
            MemberProp::Const(name) => {
                self.gen_expr(fb, target);
                let propid = self.mb.prop_id(name);
                self.emit(fb, Opcode::GetProp, &(propid as u32).to_le_bytes());
            }
            MemberProp::Expr(_) => {
                self.diagnostics
                    .error(DiagKind::ExprTooComplex, "dynamic property-name reads are not supported");
                self.gen_expr_discard(fb, target);
                self.emit(fb, Opcode::PushNil, &[]);
            }
        }
    }

    fn gen_inherited(&mut self, fb: &mut FunctionBuilder, through: &[String], args: &[Expr], want_value: bool) {
        if !self.in_method {
            self.diagnostics
                .error(DiagKind::SelfNotAvailable, "inherited is only valid inside a method");
        }
        let mut target_resolved = true;
        for name in through {
            if self.mb.object_anchor(name).is_none() {
                self.diagnostics.error(
                    DiagKind::MmInhUndefFunc,
                    format!("superclass '{name}' named in inherited<> is not a known object"),
                );
                target_resolved = false;
            }
        }
        if !args.is_empty() {
            // INHERITED always forwards the enclosing call's own arguments;
            // there is no instruction carrying an explicit argument list.
            self.diagnostics.error(
                DiagKind::ExprTooComplex,
                "inherited(...) with explicit arguments is not supported; arguments are forwarded from the enclosing call",
            );
            for a in args {
                self.gen_expr_discard(fb, a);
            }
        }
        if !target_resolved {
            if want_value {
                self.emit(fb, Opcode::PushNil, &[]);
            }
            return;
        }
        self.emit_dynamic(fb, Opcode::Inherited, &[], 0, 0);
        if want_value {
            self.emit(fb, Opcode::GetR0, &[]);
        }
    }

    // ---- calls and construction --------------------------------------------

    fn gen_call(&mut self, fb: &mut FunctionBuilder, callee: &Expr, args: &[Expr], named_args: &[(String, Expr)], want_value: bool) {
        if !named_args.is_empty() {
            self.diagnostics
                .error(DiagKind::ExprTooComplex, "named call arguments are not supported");
        }
        let argc = if args.len() > 255 {
            self.diagnostics
                .error(DiagKind::WrongArgc, "too many call arguments (max 255)");
            255u8
        } else {
            args.len() as u8
        };
        let args = &args[..argc as usize];

        let mut call_emitted = true;
        match callee {
            Expr::Ident(name) => {
                if let Some(anchor) = self.mb.function_anchor(name) {
                    for a in args {
                        self.gen_expr(fb, a);
                    }
                    self.emit_call(fb, anchor, argc);
                } else if let Some(slot) = fb.local_slot(name) {
                    self.emit(fb, Opcode::GetLcl1, &slot.to_le_bytes());
                    for a in args {
                        self.gen_expr(fb, a);
                    }
                    let operand = [0u8, 0, 0, 0, argc];
                    self.emit_dynamic(fb, Opcode::PtrCall, &operand, argc as u16 + 1, 0);
                } else if self.in_method {
                    let propid = self.mb.prop_id(name);
                    for a in args {
                        self.gen_expr(fb, a);
                    }
                    let pb = propid.to_le_bytes();
                    let operand = [pb[0], pb[1], 0, 0, argc];
                    self.emit_dynamic(fb, Opcode::CallPropSelf, &operand, argc as u16, 0);
                } else {
                    self.diagnostics.error(
                        DiagKind::SelfNotAvailable,
                        format!("'{name}' is not defined and self is not available"),
                    );
                    for a in args {
                        self.gen_expr_discard(fb, a);
                    }
                    call_emitted = false;
                }
            }
            Expr::Member { target, prop: MemberProp::Const(name) } => {
                self.gen_expr(fb, target);
                let propid = self.mb.prop_id(name);
                for a in args {
                    self.gen_expr(fb, a);
                }
                let pb = propid.to_le_bytes();
                let operand = [pb[0], pb[1], 0, 0, argc];
                self.emit_dynamic(fb, Opcode::CallProp, &operand, argc as u16 + 1, 0);
            }
            Expr::Member { target, prop: MemberProp::Expr(_) } => {
                self.diagnostics
                    .error(DiagKind::ExprTooComplex, "dynamic property-name calls are not supported");
                self.gen_expr_discard(fb, target);
                for a in args {
                    self.gen_expr_discard(fb, a);
                }
                call_emitted = false;
            }
            other => {
                self.gen_expr(fb, other);
                for a in args {
                    self.gen_expr(fb, a);
                }
                let operand = [0u8, 0, 0, 0, argc];
                self.emit_dynamic(fb, Opcode::PtrCall, &operand, argc as u16 + 1, 0);
            }
        }

        if call_emitted {
            if want_value {
                self.emit(fb, Opcode::GetR0, &[]);
            }
        } else if want_value {
            self.emit(fb, Opcode::PushNil, &[]);
        }
    }

    /// `New1`/`New2` address their class purely through an embedded `ObjId`
    /// fixup -- there is no pointer-indirect "new" in this opcode set -- so
    /// `class` must resolve to a compile-time-known object name.
    fn gen_new(
        &mut self,
        fb: &mut FunctionBuilder,
        class: &Expr,
        args: &[Expr],
        named_args: &[(String, Expr)],
        is_transient: bool,
        want_value: bool,
    ) {
        if !named_args.is_empty() {
            self.diagnostics
                .error(DiagKind::ExprTooComplex, "named constructor arguments are not supported");
        }
        let argc = if args.len() > 255 {
            self.diagnostics
                .error(DiagKind::TooManyCtorArgs, "too many constructor arguments (max 255)");
            255u8
        } else {
            args.len() as u8
        };
        let args = &args[..argc as usize];

        let class_anchor = match class {
            Expr::Ident(name) => match self.mb.object_anchor(name) {
                Some(a) => Some(a),
                None => {
                    self.diagnostics
                        .error(DiagKind::BadMetaForNew, format!("'{name}' does not name a known class"));
                    None
                }
            },
            _ => {
                self.diagnostics.error(
                    DiagKind::BadMetaForNew,
                    "new expression requires a compile-time-known class name",
                );
                None
            }
        };

        for a in args {
            self.gen_expr(fb, a);
        }

        match class_anchor {
            Some(anchor) => {
                let code = self.mb.code_mut();
                if is_transient {
                    fb.emit_raw(code, Opcode::New2);
                    let code = self.mb.code_mut();
                    let slot = code.reserve_u32();
                    code.write_u8(argc);
                    self.mb
                        .anchors_mut()
                        .add_fixup(anchor, StreamId::Code, slot, FixupWidth::Four, ReferenceKind::ObjId);
                } else {
                    fb.emit_raw(code, Opcode::New1);
                    let code = self.mb.code_mut();
                    let slot = code.reserve_u16();
                    code.write_u8(0);
                    code.write_u8(argc);
                    self.mb
                        .anchors_mut()
                        .add_fixup(anchor, StreamId::Code, slot, FixupWidth::Two, ReferenceKind::ObjId);
                }
                fb.note_effect(argc as u16, 1);
                if !want_value {
                    self.emit(fb, Opcode::Disc, &[]);
                }
            }
            None => {
                for _ in 0..argc {
                    self.emit(fb, Opcode::Disc, &[]);
                }
                if want_value {
                    self.emit(fb, Opcode::PushNil, &[]);
                }
            }
        }
    }

    // ---- assignment ---------------------------------------------------------

    fn classify_lvalue<'e>(&mut self, fb: &FunctionBuilder, target: &'e Expr) -> Option<Lvalue<'e>> {
        match target {
            Expr::Ident(name) => {
                if let Some(slot) = fb.local_slot(name) {
                    Some(Lvalue::Local(slot))
                } else if self.in_method {
                    Some(Lvalue::SelfProp(self.mb.prop_id(name)))
                } else {
                    self.diagnostics
                        .error(DiagKind::InvalidLvalue, format!("'{name}' is not assignable here"));
                    None
                }
            }
            Expr::Member { target, prop: MemberProp::Const(name) } => {
                Some(Lvalue::Member(target, self.mb.prop_id(name)))
            }
            Expr::Member { prop: MemberProp::Expr(_), .. } => {
                self.diagnostics
                    .error(DiagKind::InvalidLvalue, "dynamic property-name targets are not supported");
                None
            }
            Expr::Index { target, index } => Some(Lvalue::Index(target, index)),
            _ => {
                self.diagnostics.error(DiagKind::InvalidLvalue, "expression is not assignable");
                None
            }
        }
    }

    fn gen_assign(&mut self, fb: &mut FunctionBuilder, target: &Expr, op: CompoundOp, value: Option<&Expr>, want_value: bool) {
        match self.classify_lvalue(fb, target) {
            Some(Lvalue::Local(slot)) => self.gen_assign_local(fb, slot, op, value, want_value),
            Some(Lvalue::SelfProp(propid)) => self.gen_assign_self_prop(fb, propid, op, value, want_value),
            Some(Lvalue::Member(target_expr, propid)) => {
                self.gen_assign_member(fb, target_expr, propid, op, value, want_value);
            }
            Some(Lvalue::Index(container, index)) => {
                self.gen_assign_index(fb, container, index, op, value, want_value);
            }
            None => {
                if let Some(v) = value {
                    self.gen_expr_discard(fb, v);
                }
                if want_value {
                    self.emit(fb, Opcode::PushNil, &[]);
                }
            }
        }
    }

    fn unsupported_compound(&mut self, fb: &mut FunctionBuilder, value: Option<&Expr>, want_value: bool) {
        self.diagnostics
            .error(DiagKind::ExprTooComplex, "this compound-assignment operator is not supported");
        if let Some(v) = value {
            self.gen_expr_discard(fb, v);
        }
        if want_value {
            self.emit(fb, Opcode::PushNil, &[]);
        }
    }

    fn gen_assign_local(&mut self, fb: &mut FunctionBuilder, slot: u16, op: CompoundOp, value: Option<&Expr>, want_value: bool) {
        let slot_bytes = slot.to_le_bytes();
        match op {
            CompoundOp::Simple => {
                self.gen_expr(fb, value.expect("simple assignment always carries a value"));
                if want_value {
                    self.emit(fb, Opcode::Dup, &[]);
                }
                self.emit(fb, Opcode::SetLcl1, &slot_bytes);
            }
            // §4.7's fused local-compound forms: the target local is both
            // read and written in place, so there is never a value to `Dup`
            // through -- a post-read/post-write `GetLcl1` stands in for the
            // value a `want_value` caller needs instead.
            CompoundOp::PreInc | CompoundOp::PreDec => {
                self.emit(fb, if op == CompoundOp::PreInc { Opcode::IncLcl } else { Opcode::DecLcl }, &slot_bytes);
                if want_value {
                    self.emit(fb, Opcode::GetLcl1, &slot_bytes);
                }
            }
            CompoundOp::PostInc | CompoundOp::PostDec => {
                if want_value {
                    self.emit(fb, Opcode::GetLcl1, &slot_bytes);
                }
                self.emit(fb, if op == CompoundOp::PostInc { Opcode::IncLcl } else { Opcode::DecLcl }, &slot_bytes);
            }
            CompoundOp::Add | CompoundOp::Sub => {
                let value = value.expect("compound assignment always carries a value");
                if let Some(amount) = const_int_amount(value, op == CompoundOp::Sub) {
                    self.emit_add_ilcl(fb, slot, amount);
                } else {
                    self.gen_expr(fb, value);
                    let fused = if op == CompoundOp::Add { Opcode::AddToLcl } else { Opcode::SubFromLcl };
                    self.emit(fb, fused, &slot_bytes);
                }
                if want_value {
                    self.emit(fb, Opcode::GetLcl1, &slot_bytes);
                }
            }
            CompoundOp::Idx => self.unsupported_compound(fb, value, want_value),
            _ => {
                self.emit(fb, Opcode::GetLcl1, &slot_bytes);
                self.gen_expr(fb, value.expect("compound assignment always carries a value"));
                self.emit(fb, compound_opcode(op).expect("handled above"), &[]);
                if want_value {
                    self.emit(fb, Opcode::Dup, &[]);
                }
                self.emit(fb, Opcode::SetLcl1, &slot_bytes);
            }
        }
    }

    /// Emit `ADDILCL1`/`ADDILCL4` for `local += amount`, picking the
    /// narrower encoding whenever `amount` fits an `i8`.
    fn emit_add_ilcl(&mut self, fb: &mut FunctionBuilder, slot: u16, amount: i32) {
        let slot_bytes = slot.to_le_bytes();
        if let Ok(i8_amount) = i8::try_from(amount) {
            let mut operand = slot_bytes.to_vec();
            operand.push(i8_amount as u8);
            self.emit(fb, Opcode::AddILcl1, &operand);
        } else {
            let mut operand = slot_bytes.to_vec();
            operand.extend_from_slice(&amount.to_le_bytes());
            self.emit(fb, Opcode::AddILcl4, &operand);
        }
    }

    fn gen_assign_self_prop(&mut self, fb: &mut FunctionBuilder, propid: u16, op: CompoundOp, value: Option<&Expr>, want_value: bool) {
        let propid_bytes = (propid as u32).to_le_bytes();
        match op {
            CompoundOp::Simple => {
                self.gen_expr(fb, value.expect("simple assignment always carries a value"));
                if want_value {
                    self.emit(fb, Opcode::Dup, &[]);
                }
                self.emit(fb, Opcode::SetPropSelf, &propid_bytes);
            }
            CompoundOp::PreInc | CompoundOp::PreDec => {
                self.emit(fb, Opcode::GetPropSelf, &propid_bytes);
                self.emit(fb, Opcode::Push1, &[]);
                self.emit(fb, if op == CompoundOp::PreInc { Opcode::Add } else { Opcode::Sub }, &[]);
                if want_value {
                    self.emit(fb, Opcode::Dup, &[]);
                }
                self.emit(fb, Opcode::SetPropSelf, &propid_bytes);
            }
            CompoundOp::PostInc | CompoundOp::PostDec => {
                self.emit(fb, Opcode::GetPropSelf, &propid_bytes);
                if want_value {
                    self.emit(fb, Opcode::Dup, &[]);
                }
                self.emit(fb, Opcode::Push1, &[]);
                self.emit(fb, if op == CompoundOp::PostInc { Opcode::Add } else { Opcode::Sub }, &[]);
                self.emit(fb, Opcode::SetPropSelf, &propid_bytes);
            }
            CompoundOp::Idx => self.unsupported_compound(fb, value, want_value),
            _ => {
                self.emit(fb, Opcode::GetPropSelf, &propid_bytes);
                self.gen_expr(fb, value.expect("compound assignment always carries a value"));
                self.emit(fb, compound_opcode(op).expect("handled above"), &[]);
                if want_value {
                    self.emit(fb, Opcode::Dup, &[]);
                }
                self.emit(fb, Opcode::SetPropSelf, &propid_bytes);
            }
        }
    }

    /// Compound assignment to `target.prop` has no 2-element stack rotate
    /// available (only `Dup`/`Swap`/`Disc`), so the receiver and any staged
    /// result are spilled to synthetic temp locals instead (§4.6-4.7).
    fn gen_assign_member(&mut self, fb: &mut FunctionBuilder, target: &Expr, propid: u16, op: CompoundOp, value: Option<&Expr>, want_value: bool) {
        self.gen_expr(fb, target);
        let ttemp = fb.declare_temp();
        self.emit(fb, Opcode::SetLcl1, &ttemp.to_le_bytes());
        let propid_bytes = (propid as u32).to_le_bytes();

        match op {
            CompoundOp::Simple => {
                self.gen_expr(fb, value.expect("simple assignment always carries a value"));
                let vtemp = fb.declare_temp();
                self.emit(fb, Opcode::SetLcl1, &vtemp.to_le_bytes());
                if want_value {
                    self.emit(fb, Opcode::GetLcl1, &vtemp.to_le_bytes());
                }
                self.emit(fb, Opcode::GetLcl1, &ttemp.to_le_bytes());
                self.emit(fb, Opcode::GetLcl1, &vtemp.to_le_bytes());
                self.emit(fb, Opcode::SetProp, &propid_bytes);
            }
            CompoundOp::PreInc | CompoundOp::PreDec | CompoundOp::PostInc | CompoundOp::PostDec => {
                self.emit(fb, Opcode::GetLcl1, &ttemp.to_le_bytes());
                self.emit(fb, Opcode::GetProp, &propid_bytes);
                let otemp = fb.declare_temp();
                self.emit(fb, Opcode::SetLcl1, &otemp.to_le_bytes());
                self.emit(fb, Opcode::GetLcl1, &otemp.to_le_bytes());
                self.emit(fb, Opcode::Push1, &[]);
                let is_inc = matches!(op, CompoundOp::PreInc | CompoundOp::PostInc);
                self.emit(fb, if is_inc { Opcode::Add } else { Opcode::Sub }, &[]);
                let ntemp = fb.declare_temp();
                self.emit(fb, Opcode::SetLcl1, &ntemp.to_le_bytes());
                let is_post = matches!(op, CompoundOp::PostInc | CompoundOp::PostDec);
                if want_value {
                    let staged = if is_post { otemp } else { ntemp };
                    self.emit(fb, Opcode::GetLcl1, &staged.to_le_bytes());
                }
                self.emit(fb, Opcode::GetLcl1, &ttemp.to_le_bytes());
                self.emit(fb, Opcode::GetLcl1, &ntemp.to_le_bytes());
                self.emit(fb, Opcode::SetProp, &propid_bytes);
            }
            CompoundOp::Idx => self.unsupported_compound(fb, value, want_value),
            _ => {
                self.emit(fb, Opcode::GetLcl1, &ttemp.to_le_bytes());
                self.emit(fb, Opcode::GetProp, &propid_bytes);
                self.gen_expr(fb, value.expect("compound assignment always carries a value"));
                self.emit(fb, compound_opcode(op).expect("handled above"), &[]);
                let ntemp = fb.declare_temp();
                self.emit(fb, Opcode::SetLcl1, &ntemp.to_le_bytes());
                if want_value {
                    self.emit(fb, Opcode::GetLcl1, &ntemp.to_le_bytes());
                }
                self.emit(fb, Opcode::GetLcl1, &ttemp.to_le_bytes());
                self.emit(fb, Opcode::GetLcl1, &ntemp.to_le_bytes());
                self.emit(fb, Opcode::SetProp, &propid_bytes);
            }
        }
    }

    fn gen_assign_index(&mut self, fb: &mut FunctionBuilder, container: &Expr, index: &Expr, op: CompoundOp, value: Option<&Expr>, want_value: bool) {
        self.gen_expr(fb, container);
        let ctemp = fb.declare_temp();
        self.emit(fb, Opcode::SetLcl1, &ctemp.to_le_bytes());
        self.gen_expr(fb, index);
        let itemp = fb.declare_temp();
        self.emit(fb, Opcode::SetLcl1, &itemp.to_le_bytes());

        match op {
            CompoundOp::Simple => {
                self.gen_expr(fb, value.expect("simple assignment always carries a value"));
                let vtemp = fb.declare_temp();
                self.emit(fb, Opcode::SetLcl1, &vtemp.to_le_bytes());
                if want_value {
                    self.emit(fb, Opcode::GetLcl1, &vtemp.to_le_bytes());
                }
                self.emit(fb, Opcode::GetLcl1, &ctemp.to_le_bytes());
                self.emit(fb, Opcode::GetLcl1, &itemp.to_le_bytes());
                self.emit(fb, Opcode::GetLcl1, &vtemp.to_le_bytes());
                self.emit(fb, Opcode::SetInd, &[]);
            }
            CompoundOp::PreInc | CompoundOp::PreDec | CompoundOp::PostInc | CompoundOp::PostDec => {
                self.emit(fb, Opcode::GetLcl1, &ctemp.to_le_bytes());
                self.emit(fb, Opcode::GetLcl1, &itemp.to_le_bytes());
                self.emit(fb, Opcode::GetInd, &[]);
                let otemp = fb.declare_temp();
                self.emit(fb, Opcode::SetLcl1, &otemp.to_le_bytes());
                self.emit(fb, Opcode::GetLcl1, &otemp.to_le_bytes());
                self.emit(fb, Opcode::Push1, &[]);
                let is_inc = matches!(op, CompoundOp::PreInc | CompoundOp::PostInc);
                self.emit(fb, if is_inc { Opcode::Add } else { Opcode::Sub }, &[]);
                let ntemp = fb.declare_temp();
                self.emit(fb, Opcode::SetLcl1, &ntemp.to_le_bytes());
                let is_post = matches!(op, CompoundOp::PostInc | CompoundOp::PostDec);
                if want_value {
                    let staged = if is_post { otemp } else { ntemp };
                    self.emit(fb, Opcode::GetLcl1, &staged.to_le_bytes());
                }
                self.emit(fb, Opcode::GetLcl1, &ctemp.to_le_bytes());
                self.emit(fb, Opcode::GetLcl1, &itemp.to_le_bytes());
                self.emit(fb, Opcode::GetLcl1, &ntemp.to_le_bytes());
                self.emit(fb, Opcode::SetInd, &[]);
            }
            CompoundOp::Idx => self.unsupported_compound(fb, value, want_value),
            _ => {
                self.emit(fb, Opcode::GetLcl1, &ctemp.to_le_bytes());
                self.emit(fb, Opcode::GetLcl1, &itemp.to_le_bytes());
                self.emit(fb, Opcode::GetInd, &[]);
                self.gen_expr(fb, value.expect("compound assignment always carries a value"));
                self.emit(fb, compound_opcode(op).expect("handled above"), &[]);
                let ntemp = fb.declare_temp();
                self.emit(fb, Opcode::SetLcl1, &ntemp.to_le_bytes());
                if want_value {
                    self.emit(fb, Opcode::GetLcl1, &ntemp.to_le_bytes());
                }
                self.emit(fb, Opcode::GetLcl1, &ctemp.to_le_bytes());
                self.emit(fb, Opcode::GetLcl1, &itemp.to_le_bytes());
                self.emit(fb, Opcode::GetLcl1, &ntemp.to_le_bytes());
                self.emit(fb, Opcode::SetInd, &[]);
            }
        }
    }
}

fn binop_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Mod => Opcode::Mod,
        BinaryOp::BAnd => Opcode::BAnd,
        BinaryOp::BOr => Opcode::BOr,
        BinaryOp::Xor => Opcode::Xor,
        BinaryOp::Shl => Opcode::Shl,
        BinaryOp::AShr => Opcode::AShr,
        BinaryOp::LShr => Opcode::LShr,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
    }
}

/// The compile-time-constant amount a `+=`/`-=` target local would be
/// adjusted by, if `value` is a plain integer literal -- the case §4.7
/// reserves for `ADDILCL1`/`ADDILCL4` rather than the general `ADDTOLCL`/
/// `SUBFROMLCL` runtime-value form. `negate` flips the sign for `-=`.
fn const_int_amount(value: &Expr, negate: bool) -> Option<i32> {
    match value {
        Expr::Int(n) => Some(if negate { n.wrapping_neg() } else { *n }),
        _ => None,
    }
}

fn compound_opcode(op: CompoundOp) -> Option<Opcode> {
    match op {
        CompoundOp::Add => Some(Opcode::Add),
        CompoundOp::Sub => Some(Opcode::Sub),
        CompoundOp::Mul => Some(Opcode::Mul),
        CompoundOp::Div => Some(Opcode::Div),
        CompoundOp::Mod => Some(Opcode::Mod),
        CompoundOp::BAnd => Some(Opcode::BAnd),
        CompoundOp::BOr => Some(Opcode::BOr),
        CompoundOp::BXor => Some(Opcode::Xor),
        CompoundOp::Shl => Some(Opcode::Shl),
        CompoundOp::AShr => Some(Opcode::AShr),
        CompoundOp::LShr => Some(Opcode::LShr),
        _ => None,
    }
}
