//! T3 VM opcode set.
//!
//! Opcodes are single bytes, grouped into ranges by category so a dump of raw
//! code can be eyeballed by range alone. Most opcodes have a fixed operand
//! size; [`Opcode::fixed_operand_len`] returns it where it applies. The three
//! variable-length opcodes (`PushStrI`, `Switch`, `NamedArgTab`) return `None`
//! there and must be measured from their own embedded length operand by the
//! caller (the jump threader does this while scanning a method body).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // --- stack manipulation: 0x00-0x0f ---
    Nop = 0x00,
    Dup = 0x01,
    Disc = 0x02,
    /// Discard N values; N is an embedded u8 operand (peephole-fused form of
    /// repeated `Disc`).
    Disc1 = 0x03,
    Swap = 0x04,

    // --- constant pushes: 0x10-0x2f ---
    PushNil = 0x10,
    PushTrue = 0x11,
    Push0 = 0x12,
    Push1 = 0x13,
    PushInt8 = 0x14,
    PushInt = 0x15,
    PushFloat = 0x16,
    /// Reference to an interned data-stream string/list constant (resolved by fixup).
    PushStr = 0x17,
    /// Inline string literal: embedded u16 length + raw bytes follow the opcode.
    PushStrI = 0x18,
    PushLst = 0x19,
    PushSelf = 0x1a,
    PushParLst = 0x1b,
    PushFnPtr = 0x1c,

    // --- locals: 0x30-0x4f ---
    // Every opcode in this range addresses its local by the same UINT2 slot
    // index `GetLcl1`/`SetLcl1` use. `IncLcl`/`DecLcl` mutate in place by
    // exactly one; `AddILcl1`/`AddILcl4` add a compile-time-constant `i8`/
    // `i32` immediate (the local slot plus that immediate, 3 and 6 bytes
    // respectively); `AddToLcl`/`SubFromLcl` add/subtract a value already
    // sitting on top of the stack (popped, not embedded). None of these push
    // a result -- a caller wanting the new value follows up with `GetLcl1`.
    GetLcl1 = 0x30,
    GetLcl2 = 0x31,
    SetLcl1 = 0x32,
    SetLcl2 = 0x33,
    NilLcl1 = 0x34,
    NilLcl2 = 0x35,
    ZeroLcl1 = 0x36,
    ZeroLcl2 = 0x37,
    OneLcl1 = 0x38,
    OneLcl2 = 0x39,
    AddILcl1 = 0x3a,
    AddILcl4 = 0x3b,
    IncLcl = 0x3c,
    DecLcl = 0x3d,
    AddToLcl = 0x3e,
    SubFromLcl = 0x3f,

    // --- arithmetic / comparison / logic: 0x50-0x6f ---
    Add = 0x50,
    Sub = 0x51,
    Mul = 0x52,
    Div = 0x53,
    Mod = 0x54,
    Neg = 0x55,
    BAnd = 0x56,
    BOr = 0x57,
    Xor = 0x58,
    Shl = 0x59,
    AShr = 0x5a,
    LShr = 0x5b,
    Not = 0x5c,
    Boolize = 0x5d,
    Eq = 0x5e,
    Ne = 0x5f,
    Lt = 0x60,
    Le = 0x61,
    Gt = 0x62,
    Ge = 0x63,

    // --- combined local/property and local/index fusions: 0x70-0x7f ---
    GetPropLcl1 = 0x70,
    CallPropLcl1 = 0x71,
    IdxLcl1Int8 = 0x72,
    SetIndLcl1I8 = 0x73,

    // --- unconditional/conditional jumps: 0x80-0x9f ---
    Jmp = 0x80,
    Jt = 0x81,
    Jf = 0x82,
    Je = 0x83,
    Jne = 0x84,
    /// Fused compare-and-branch: pops both operands and jumps if `a < b`,
    /// without ever pushing a boolean (peephole fusion of a comparison
    /// immediately followed by a conditional jump on its result).
    Jlt = 0x85,
    Jle = 0x86,
    Jgt = 0x87,
    Jge = 0x88,
    /// Save-on-true: duplicate, jump if true, else discard and fall through.
    Jst = 0x89,
    /// Save-on-false: duplicate, jump if false, else discard and fall through.
    Jsf = 0x8a,
    Jnil = 0x8b,
    JNotNil = 0x8c,
    /// Test the R0 return-value register (not the stack) and branch.
    Jr0t = 0x8d,
    Jr0f = 0x8e,
    Switch = 0x8f,

    // --- returns / throw: 0xa0-0xaf ---
    Ret = 0xa0,
    RetVal = 0xa1,
    RetNil = 0xa2,
    RetTrue = 0xa3,
    Throw = 0xa4,
    GetR0 = 0xa5,

    // --- calls / property access / new: 0xb0-0xcf ---
    // Naming convention shared by this whole block: a plain name addresses
    // its target through a value already sitting on the operand stack;
    // `Obj*` bakes a known object reference into the operand instead; `Ptr*`
    // calls through a value on the stack whose property/function isn't
    // known until runtime; `*Self` implies the current `self`; `*Lcl1`
    // folds in a local slot read (peephole fusion). Only the stack-addressed
    // and pointer forms pop their target; the others address it for free.
    Call = 0xb0,
    PtrCall = 0xb1,
    GetProp = 0xb2,
    CallProp = 0xb3,
    ObjGetProp = 0xb4,
    ObjCallProp = 0xb5,
    PtrCallProp = 0xb6,
    GetPropSelf = 0xb7,
    CallPropSelf = 0xb8,
    SetProp = 0xb9,
    SetPropSelf = 0xba,
    ObjSetProp = 0xbb,
    PtrSetProp = 0xbc,
    New1 = 0xbd,
    New2 = 0xbe,
    Inherited = 0xbf,
    NamedArgPtr = 0xc0,
    /// Named-argument table referenced by `NamedArgPtr`: embedded u16 length + entries.
    NamedArgTab = 0xc1,

    // --- indexing / say: 0xd0-0xdf ---
    GetInd = 0xd0,
    SetInd = 0xd1,
    IdxInt8 = 0xd2,
    Say = 0xd3,
    SayVal = 0xd4,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match byte {
            0x00 => Nop,
            0x01 => Dup,
            0x02 => Disc,
            0x03 => Disc1,
            0x04 => Swap,
            0x10 => PushNil,
            0x11 => PushTrue,
            0x12 => Push0,
            0x13 => Push1,
            0x14 => PushInt8,
            0x15 => PushInt,
            0x16 => PushFloat,
            0x17 => PushStr,
            0x18 => PushStrI,
            0x19 => PushLst,
            0x1a => PushSelf,
            0x1b => PushParLst,
            0x1c => PushFnPtr,
            0x30 => GetLcl1,
            0x31 => GetLcl2,
            0x32 => SetLcl1,
            0x33 => SetLcl2,
            0x34 => NilLcl1,
            0x35 => NilLcl2,
            0x36 => ZeroLcl1,
            0x37 => ZeroLcl2,
            0x38 => OneLcl1,
            0x39 => OneLcl2,
            0x3a => AddILcl1,
            0x3b => AddILcl4,
            0x3c => IncLcl,
            0x3d => DecLcl,
            0x3e => AddToLcl,
            0x3f => SubFromLcl,
            0x50 => Add,
            0x51 => Sub,
            0x52 => Mul,
            0x53 => Div,
            0x54 => Mod,
            0x55 => Neg,
            0x56 => BAnd,
            0x57 => BOr,
            0x58 => Xor,
            0x59 => Shl,
            0x5a => AShr,
            0x5b => LShr,
            0x5c => Not,
            0x5d => Boolize,
            0x5e => Eq,
            0x5f => Ne,
            0x60 => Lt,
            0x61 => Le,
            0x62 => Gt,
            0x63 => Ge,
            0x70 => GetPropLcl1,
            0x71 => CallPropLcl1,
            0x72 => IdxLcl1Int8,
            0x73 => SetIndLcl1I8,
            0x80 => Jmp,
            0x81 => Jt,
            0x82 => Jf,
            0x83 => Je,
            0x84 => Jne,
            0x85 => Jlt,
            0x86 => Jle,
            0x87 => Jgt,
            0x88 => Jge,
            0x89 => Jst,
            0x8a => Jsf,
            0x8b => Jnil,
            0x8c => JNotNil,
            0x8d => Jr0t,
            0x8e => Jr0f,
            0x8f => Switch,
            0xa0 => Ret,
            0xa1 => RetVal,
            0xa2 => RetNil,
            0xa3 => RetTrue,
            0xa4 => Throw,
            0xa5 => GetR0,
            0xb0 => Call,
            0xb1 => PtrCall,
            0xb2 => GetProp,
            0xb3 => CallProp,
            0xb4 => ObjGetProp,
            0xb5 => ObjCallProp,
            0xb6 => PtrCallProp,
            0xb7 => GetPropSelf,
            0xb8 => CallPropSelf,
            0xb9 => SetProp,
            0xba => SetPropSelf,
            0xbb => ObjSetProp,
            0xbc => PtrSetProp,
            0xbd => New1,
            0xbe => New2,
            0xbf => Inherited,
            0xc0 => NamedArgPtr,
            0xc1 => NamedArgTab,
            0xd0 => GetInd,
            0xd1 => SetInd,
            0xd2 => IdxInt8,
            0xd3 => Say,
            0xd4 => SayVal,
            _ => return None,
        })
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Nop => "NOP",
            Dup => "DUP",
            Disc => "DISC",
            Disc1 => "DISC1",
            Swap => "SWAP",
            PushNil => "PUSHNIL",
            PushTrue => "PUSHTRUE",
            Push0 => "PUSH_0",
            Push1 => "PUSH_1",
            PushInt8 => "PUSHINT8",
            PushInt => "PUSHINT",
            PushFloat => "PUSHFLT",
            PushStr => "PUSHSTR",
            PushStrI => "PUSHSTRI",
            PushLst => "PUSHLST",
            PushSelf => "PUSHSELF",
            PushParLst => "PUSHPARLST",
            PushFnPtr => "PUSHFNPTR",
            GetLcl1 => "GETLCL1",
            GetLcl2 => "GETLCL2",
            SetLcl1 => "SETLCL1",
            SetLcl2 => "SETLCL2",
            NilLcl1 => "NILLCL1",
            NilLcl2 => "NILLCL2",
            ZeroLcl1 => "ZEROLCL1",
            ZeroLcl2 => "ZEROLCL2",
            OneLcl1 => "ONELCL1",
            OneLcl2 => "ONELCL2",
            AddILcl1 => "ADDILCL1",
            AddILcl4 => "ADDILCL4",
            IncLcl => "INCLCL",
            DecLcl => "DECLCL",
            AddToLcl => "ADDTOLCL",
            SubFromLcl => "SUBFROMLCL",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            Neg => "NEG",
            BAnd => "BAND",
            BOr => "BOR",
            Xor => "XOR",
            Shl => "SHL",
            AShr => "ASHR",
            LShr => "LSHR",
            Not => "NOT",
            Boolize => "BOOLIZE",
            Eq => "EQ",
            Ne => "NE",
            Lt => "LT",
            Le => "LE",
            Gt => "GT",
            Ge => "GE",
            GetPropLcl1 => "GETPROPLCL1",
            CallPropLcl1 => "CALLPROPLCL1",
            IdxLcl1Int8 => "IDXLCL1INT8",
            SetIndLcl1I8 => "SETINDLCL1I8",
            Jmp => "JMP",
            Jt => "JT",
            Jf => "JF",
            Je => "JE",
            Jne => "JNE",
            Jlt => "JLT",
            Jle => "JLE",
            Jgt => "JGT",
            Jge => "JGE",
            Jst => "JST",
            Jsf => "JSF",
            Jnil => "JNIL",
            JNotNil => "JNOTNIL",
            Jr0t => "JR0T",
            Jr0f => "JR0F",
            Switch => "SWITCH",
            Ret => "RET",
            RetVal => "RETVAL",
            RetNil => "RETNIL",
            RetTrue => "RETTRUE",
            Throw => "THROW",
            GetR0 => "GETR0",
            Call => "CALL",
            PtrCall => "PTRCALL",
            GetProp => "GETPROP",
            CallProp => "CALLPROP",
            ObjGetProp => "OBJGETPROP",
            ObjCallProp => "OBJCALLPROP",
            PtrCallProp => "PTRCALLPROP",
            GetPropSelf => "GETPROPSELF",
            CallPropSelf => "CALLPROPSELF",
            SetProp => "SETPROP",
            SetPropSelf => "SETPROPSELF",
            ObjSetProp => "OBJSETPROP",
            PtrSetProp => "PTRSETPROP",
            New1 => "NEW1",
            New2 => "NEW2",
            Inherited => "INHERITED",
            NamedArgPtr => "NAMEDARGPTR",
            NamedArgTab => "NAMEDARGTAB",
            GetInd => "GETIND",
            SetInd => "SETIND",
            IdxInt8 => "IDXINT8",
            Say => "SAY",
            SayVal => "SAYVAL",
        }
    }

    /// Byte length of this opcode's operand, not counting the opcode byte
    /// itself. `None` for the variable-length opcodes, whose length must be
    /// read from their own embedded length field.
    pub fn fixed_operand_len(self) -> Option<usize> {
        use Opcode::*;
        Some(match self {
            Nop | Dup | Disc | Swap | PushNil | PushTrue | Push0 | Push1 | PushSelf
            | PushParLst | Add | Sub | Mul | Div | Mod | Neg | BAnd | BOr | Xor | Shl | AShr
            | LShr | Not | Boolize | Eq | Ne | Lt | Le | Gt | Ge | Ret | RetVal | RetNil
            | RetTrue | Throw | GetR0 | GetInd | SetInd | Say | SayVal | Inherited => 0,

            Disc1 | PushInt8 | IdxInt8 => 1,

            GetLcl1 | SetLcl1 | NilLcl1 | ZeroLcl1 | OneLcl1 | GetLcl2 | SetLcl2 | NilLcl2
            | ZeroLcl2 | OneLcl2 | IncLcl | DecLcl | AddToLcl | SubFromLcl | PushStr | PushLst
            | PushFnPtr | Jmp | Jt | Jf | Je | Jne | Jlt | Jle | Jgt | Jge | Jst | Jsf | Jnil
            | JNotNil | Jr0t | Jr0f | NamedArgPtr => 2,

            GetPropLcl1 | IdxLcl1Int8 | SetIndLcl1I8 | AddILcl1 => 3,

            PushInt | PushFloat | GetProp | ObjGetProp | GetPropSelf | SetProp | SetPropSelf
            | ObjSetProp | PtrSetProp | New1 | CallPropLcl1 => 4,

            CallProp | ObjCallProp | PtrCallProp | CallPropSelf | New2 | Call | PtrCall => 5,

            AddILcl4 => 6,

            PushStrI | Switch | NamedArgTab => return None,
        })
    }

    pub fn is_jump(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Jmp | Jt | Jf | Je | Jne | Jlt | Jle | Jgt | Jge | Jst | Jsf | Jnil | JNotNil | Jr0t
                | Jr0f
        )
    }

    pub fn is_unconditional_jump(self) -> bool {
        matches!(self, Opcode::Jmp)
    }

    pub fn is_call(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Call | PtrCall
                | CallProp
                | ObjCallProp
                | PtrCallProp
                | CallPropSelf
                | CallPropLcl1
                | Inherited
        )
    }

    pub fn is_return(self) -> bool {
        use Opcode::*;
        matches!(self, Ret | RetVal | RetNil | RetTrue)
    }

    /// True for any opcode that unconditionally ends control flow at this
    /// point (returns, throw, unconditional jump) -- code after one of these
    /// is unreachable until the next label.
    pub fn is_terminator(self) -> bool {
        self.is_return() || matches!(self, Opcode::Throw | Opcode::Jmp)
    }

    /// Net operand-stack effect `(pops, pushes)` for opcodes with a
    /// statically known effect. Opcodes whose effect depends on an embedded
    /// argument count (`Call`, `PtrCall`, the `CallProp*` family, `New1`,
    /// `New2`) are handled by the caller, which has the argc in hand.
    pub fn stack_effect(self) -> Option<(u16, u16)> {
        use Opcode::*;
        Some(match self {
            Nop => (0, 0),
            Dup => (0, 1),
            Disc => (1, 0),
            Disc1 => (0, 0), // pop count is the embedded operand; caller adjusts
            Swap => (0, 0),
            PushNil | PushTrue | Push0 | Push1 | PushInt8 | PushInt | PushFloat | PushStr
            | PushStrI | PushLst | PushSelf | PushParLst | PushFnPtr => (0, 1),
            GetLcl1 | GetLcl2 => (0, 1),
            SetLcl1 | SetLcl2 => (1, 0),
            NilLcl1 | NilLcl2 | ZeroLcl1 | ZeroLcl2 | OneLcl1 | OneLcl2 => (0, 0),
            AddILcl1 | AddILcl4 | IncLcl | DecLcl => (0, 0),
            // these add/subtract a value the caller already pushed, rather
            // than an embedded immediate, so unlike their `*ILcl*` siblings
            // they do pop one operand.
            AddToLcl | SubFromLcl => (1, 0),
            Add | Sub | Mul | Div | Mod | BAnd | BOr | Xor | Shl | AShr | LShr | Eq | Ne | Lt
            | Le | Gt | Ge => (2, 1),
            Neg | Not | Boolize => (1, 1),
            GetPropLcl1 => (0, 1),
            IdxLcl1Int8 => (0, 1),
            SetIndLcl1I8 => (1, 0),
            Jmp => (0, 0),
            Jt | Jf | Je | Jne | Jnil | JNotNil => (1, 0),
            // fused compare-and-branch forms: each pops the two operands a
            // separate compare opcode would have, without ever materializing
            // the boolean result on the stack.
            Jlt | Jle | Jgt | Jge => (2, 0),
            // test the R0 return-value register directly; the stack is
            // untouched.
            Jr0t | Jr0f => (0, 0),
            Jst | Jsf => (0, 0),
            Switch => (1, 0),
            Ret | RetNil | RetTrue => (0, 0),
            RetVal => (1, 0),
            Throw => (1, 0),
            GetR0 => (0, 1),
            // generic, stack-addressed forms: the target object was pushed
            // by a prior instruction and this opcode consumes it.
            GetProp => (1, 1),
            SetProp | PtrSetProp => (2, 0),
            // "Obj*"/"*Self" forms address their target without the stack:
            // an embedded object reference, or self, respectively.
            ObjGetProp | GetPropSelf => (0, 1),
            SetPropSelf | ObjSetProp => (1, 0),
            GetInd => (2, 1),
            SetInd => (3, 0),
            IdxInt8 => (1, 1),
            // displays and discards whatever a prior instruction pushed
            // (a literal string for SAY, an evaluated expression for SAYVAL).
            Say | SayVal => (1, 0),
            NamedArgPtr => (0, 0),
            Call | PtrCall | CallProp | ObjCallProp | PtrCallProp | CallPropSelf
            | CallPropLcl1 | New1 | New2 | Inherited | NamedArgTab => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_opcodes() {
        for byte in 0u8..=255 {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op.to_u8(), byte, "opcode {:?} roundtrip", op);
                assert!(!op.name().is_empty());
            }
        }
    }

    #[test]
    fn jump_opcodes_agree_with_is_jump() {
        assert!(Opcode::Jmp.is_jump());
        assert!(Opcode::Je.is_jump());
        assert!(!Opcode::Add.is_jump());
    }

    #[test]
    fn terminators_include_returns_throw_and_unconditional_jump() {
        assert!(Opcode::RetNil.is_terminator());
        assert!(Opcode::Throw.is_terminator());
        assert!(Opcode::Jmp.is_terminator());
        assert!(!Opcode::Jt.is_terminator());
        assert!(!Opcode::Add.is_terminator());
    }

    #[test]
    fn fixed_operand_lengths_known_for_non_variable_opcodes() {
        assert_eq!(Opcode::Nop.fixed_operand_len(), Some(0));
        assert_eq!(Opcode::GetLcl1.fixed_operand_len(), Some(2));
        assert_eq!(Opcode::PushStrI.fixed_operand_len(), None);
        assert_eq!(Opcode::Switch.fixed_operand_len(), None);
        assert_eq!(Opcode::NamedArgTab.fixed_operand_len(), None);
    }

    #[test]
    fn binary_arithmetic_pops_two_pushes_one() {
        assert_eq!(Opcode::Add.stack_effect(), Some((2, 1)));
        assert_eq!(Opcode::Eq.stack_effect(), Some((2, 1)));
    }

    #[test]
    fn call_family_has_dynamic_effect() {
        assert_eq!(Opcode::Call.stack_effect(), None);
        assert_eq!(Opcode::New1.stack_effect(), None);
    }

    #[test]
    fn fused_compare_and_branch_pops_both_operands() {
        assert_eq!(Opcode::Jlt.stack_effect(), Some((2, 0)));
        assert_eq!(Opcode::Jge.stack_effect(), Some((2, 0)));
    }

    #[test]
    fn r0_test_jumps_touch_no_stack() {
        assert_eq!(Opcode::Jr0t.stack_effect(), Some((0, 0)));
        assert_eq!(Opcode::Jr0f.stack_effect(), Some((0, 0)));
    }

    #[test]
    fn generic_stack_addressed_prop_access_pops_its_target() {
        // GETPROP/SETPROP/PTRSETPROP address an object that a prior
        // instruction left on the stack, so they must consume it -- leaving
        // it behind would leak a value on every chained member access.
        assert_eq!(Opcode::GetProp.stack_effect(), Some((1, 1)));
        assert_eq!(Opcode::SetProp.stack_effect(), Some((2, 0)));
        assert_eq!(Opcode::PtrSetProp.stack_effect(), Some((2, 0)));
    }

    #[test]
    fn local_compound_opcodes_address_by_the_same_uint2_slot_as_getlcl1() {
        assert_eq!(Opcode::IncLcl.fixed_operand_len(), Some(2));
        assert_eq!(Opcode::DecLcl.fixed_operand_len(), Some(2));
        assert_eq!(Opcode::AddILcl1.fixed_operand_len(), Some(3));
        assert_eq!(Opcode::AddILcl4.fixed_operand_len(), Some(6));
        assert_eq!(Opcode::AddToLcl.fixed_operand_len(), Some(2));
        assert_eq!(Opcode::SubFromLcl.fixed_operand_len(), Some(2));
    }

    #[test]
    fn addtolcl_and_subfromlcl_pop_the_stack_value_they_fold_in() {
        assert_eq!(Opcode::AddToLcl.stack_effect(), Some((1, 0)));
        assert_eq!(Opcode::SubFromLcl.stack_effect(), Some((1, 0)));
        assert_eq!(Opcode::AddILcl1.stack_effect(), Some((0, 0)));
        assert_eq!(Opcode::IncLcl.stack_effect(), Some((0, 0)));
    }

    #[test]
    fn self_and_embedded_object_prop_access_needs_no_stack_target() {
        assert_eq!(Opcode::GetPropSelf.stack_effect(), Some((0, 1)));
        assert_eq!(Opcode::SetPropSelf.stack_effect(), Some((1, 0)));
        assert_eq!(Opcode::ObjGetProp.stack_effect(), Some((0, 1)));
        assert_eq!(Opcode::ObjSetProp.stack_effect(), Some((1, 0)));
    }
}
