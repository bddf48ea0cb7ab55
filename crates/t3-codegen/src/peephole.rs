//! Peephole optimizer (§3, §4.3).
//!
//! Remembers the last and second-last instruction written into a code
//! stream and fuses specific adjacent sequences into a single, more compact
//! instruction. This is per-method state: the generator constructs one
//! `Peephole` per code body and calls [`Peephole::clear`] at every label
//! definition (control may enter there from elsewhere) and at the start of
//! every source-line record, so line boundaries and branch targets never get
//! silently merged across.
//!
//! Every opcode this module fuses into is looked up by its declared
//! `fixed_operand_len` in `t3_bytecode::opcode`, so the fused encodings below
//! are picked to fit those already-committed widths: `*Lcl1` fused forms
//! keep the local index as the same `u16` `GetLcl1` itself uses, which
//! leaves only a single spare byte for a property id or index key in the
//! 3-4 byte fused operand -- so `GetPropLcl1`/`CallPropLcl1` only fire when
//! the referenced property id fits in a `u8`; wider ids fall back to the
//! unfused two-instruction form. Constant-store fusions (`NilLcl1`/
//! `ZeroLcl1`/`OneLcl1`) only catch the `want_value == false` shape -- a
//! `Dup` wedged in between to hand the stored value back to a caller breaks
//! the two-instruction adjacency this pass looks for.

use t3_bytecode::{ByteStream, Opcode};

#[derive(Debug, Clone)]
struct Emitted {
    opcode: Opcode,
    at: usize,
    operand: Vec<u8>,
}

/// What [`Peephole::emit`] actually did with the requested opcode, so the
/// caller can keep its own bookkeeping (the operand-stack simulation) in
/// sync with the bytes that really ended up in the stream rather than the
/// bytes that were asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FuseOutcome {
    /// Written as its own instruction; nothing fused. `at` is the stream
    /// offset of the opcode byte, so a caller that needs to register a
    /// fixup against the operand bytes (a jump's displacement) can find
    /// them at `at + 1` without re-deriving the write position itself.
    Emitted { at: usize },
    /// A redundant terminator was absorbed into the one before it; nothing
    /// was written at all.
    Dropped,
    /// The last `replaced` previously-emitted instructions were erased and
    /// replaced by this one instruction instead, at stream offset `at`.
    Fused {
        replaced: u8,
        opcode: Opcode,
        operand: Vec<u8>,
        at: usize,
    },
}

#[derive(Debug, Default)]
pub struct Peephole {
    last: Option<Emitted>,
    second_last: Option<Emitted>,
}

impl Peephole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear remembered state. Called on label definition and at the start
    /// of every source-line record (§4.3).
    pub fn clear(&mut self) {
        self.last = None;
        self.second_last = None;
    }

    /// Emit `opcode` (with `operand` already encoded) into `code`, applying
    /// fusion rules against whatever was emitted immediately before it.
    /// Reports what actually landed in the stream -- a caller tracking
    /// per-opcode stack effects must apply the returned outcome, not the
    /// opcode it asked for, since fusion can replace or drop instructions.
    pub fn emit(&mut self, code: &mut ByteStream, opcode: Opcode, operand: &[u8]) -> FuseOutcome {
        if self.try_drop_redundant_terminator(&opcode) {
            return FuseOutcome::Dropped;
        }
        if let Some((at, fused_opcode, fused_operand)) = self.try_fuse_three(opcode) {
            code.truncate(at);
            code.write_u8(fused_opcode.to_u8());
            code.write_bytes(&fused_operand);
            self.second_last = None;
            self.last = Some(Emitted {
                opcode: fused_opcode,
                at,
                operand: fused_operand.clone(),
            });
            return FuseOutcome::Fused {
                replaced: 2,
                opcode: fused_opcode,
                operand: fused_operand,
                at,
            };
        }
        if let Some((at, fused_opcode, fused_operand)) = self.try_fuse_two(opcode, operand) {
            code.truncate(at);
            code.write_u8(fused_opcode.to_u8());
            code.write_bytes(&fused_operand);
            // the fused instruction replaces `last`, not `second_last`'s
            // predecessor; `second_last` (if any) still precedes it.
            self.second_last = None;
            self.last = Some(Emitted {
                opcode: fused_opcode,
                at,
                operand: fused_operand.clone(),
            });
            return FuseOutcome::Fused {
                replaced: 1,
                opcode: fused_opcode,
                operand: fused_operand,
                at,
            };
        }

        let at = code.current_offset();
        code.write_u8(opcode.to_u8());
        code.write_bytes(operand);
        self.second_last = self.last.take();
        self.last = Some(Emitted {
            opcode,
            at,
            operand: operand.to_vec(),
        });
        FuseOutcome::Emitted { at }
    }

    /// Returns are absorbing: code after an unconditional terminator is
    /// unreachable until the next label, so a second RET*/THROW emitted
    /// right after one is simply dropped.
    fn try_drop_redundant_terminator(&self, opcode: &Opcode) -> bool {
        use Opcode::*;
        let Some(last) = &self.last else {
            return false;
        };
        let last_absorbs = matches!(last.opcode, Ret | RetVal | RetNil | RetTrue | Throw | Jmp);
        let new_is_redundant = matches!(opcode, Ret | RetVal | RetNil | RetTrue | Throw);
        last_absorbs && new_is_redundant
    }

    fn try_fuse_two(
        &self,
        opcode: Opcode,
        operand: &[u8],
    ) -> Option<(usize, Opcode, Vec<u8>)> {
        use Opcode::*;
        let last = self.last.as_ref()?;

        match (last.opcode, opcode) {
            // compare + conditional jump -> single fused compare-and-branch.
            // The fused opcode is always one of the dedicated `J**` jump
            // mnemonics (2-byte displacement operand), never the bare
            // compare opcode of the same relation -- `GT`/`LE`/etc. push a
            // boolean and take no operand at all, so writing one of those
            // here instead of `JGT`/`JLE`/etc. would leave the jump's
            // displacement bytes floating as a bogus extra instruction.
            (Gt, Jf) => Some(swap_branch(last, Jle, operand)),
            (Ge, Jf) => Some(swap_branch(last, Jlt, operand)),
            (Lt, Jf) => Some(swap_branch(last, Jge, operand)),
            (Le, Jf) => Some(swap_branch(last, Jgt, operand)),
            (Eq, Jf) => Some(swap_branch(last, Jne, operand)),
            (Ne, Jf) => Some(swap_branch(last, Je, operand)),
            (Gt, Jt) => Some(swap_branch(last, Jgt, operand)),
            (Ge, Jt) => Some(swap_branch(last, Jge, operand)),
            (Lt, Jt) => Some(swap_branch(last, Jlt, operand)),
            (Le, Jt) => Some(swap_branch(last, Jle, operand)),
            (Eq, Jt) => Some(swap_branch(last, Je, operand)),
            (Ne, Jt) => Some(swap_branch(last, Jne, operand)),

            // double negation -> boolean coercion
            (Not, Not) => Some((last.at, Boolize, Vec::new())),

            // constant-nil push + equality jump -> direct nil test
            (PushNil, Je) => Some(swap_branch(last, Jnil, operand)),
            (PushNil, Jne) => Some(swap_branch(last, JNotNil, operand)),

            // return-value combining. `PUSH_1` joins `PUSHTRUE` here (§8
            // scenario 1): this opcode set treats the literal `1` returned
            // from a function the same as a literal `true`, so both collapse
            // to the same single-byte terminator.
            (PushTrue, RetVal) => Some((last.at, RetTrue, Vec::new())),
            (Push1, RetVal) => Some((last.at, RetTrue, Vec::new())),
            (PushNil, RetVal) => Some((last.at, RetNil, Vec::new())),
            (GetR0, RetVal) => Some((last.at, Ret, Vec::new())),

            // discard coalescing
            (Disc, Disc) => Some((last.at, Disc1, vec![2])),
            (Disc1, Disc) if last.operand[0] < 255 => {
                Some((last.at, Disc1, vec![last.operand[0] + 1]))
            }

            // constant-local-store fusions (§4.7's "conditional assignment
            // optimizations"): storing a freshly pushed nil/0/1 straight into
            // a local, with nothing left on the stack for the caller to read.
            (PushNil, SetLcl1) => Some((last.at, NilLcl1, operand.to_vec())),
            (Push0, SetLcl1) => Some((last.at, ZeroLcl1, operand.to_vec())),
            (Push1, SetLcl1) => Some((last.at, OneLcl1, operand.to_vec())),

            // local + property/index fusions
            (GetLcl1, GetProp) => {
                fuse_lcl1_with_u8_tail(last, GetPropLcl1, prop_id_of(operand))
            }
            (GetLcl1, CallProp) => fuse_lcl1_call(last, CallPropLcl1, operand),
            (GetLcl1, IdxInt8) => {
                fuse_lcl1_with_u8_tail(last, IdxLcl1Int8, operand.first().copied())
            }

            _ => None,
        }
    }

    /// Three-instruction fusion: `GETLCL1 n ; PUSH_0/PUSH_1/PUSHINT8 k ;
    /// SETIND` -> `SETINDLCL1I8 n k`.
    fn try_fuse_three(&self, opcode: Opcode) -> Option<(usize, Opcode, Vec<u8>)> {
        use Opcode::*;
        if opcode != SetInd {
            return None;
        }
        let last = self.last.as_ref()?;
        let second_last = self.second_last.as_ref()?;
        if second_last.opcode != GetLcl1 {
            return None;
        }
        let key: i8 = match last.opcode {
            Push0 => 0,
            Push1 => 1,
            PushInt8 => last.operand.first().copied()? as i8,
            _ => return None,
        };
        let mut fused = second_last.operand.clone();
        fused.push(key as u8);
        Some((second_last.at, SetIndLcl1I8, fused))
    }
}

/// Build a fused compare-and-branch instruction: keep the jump's own
/// operand (the 2-byte label displacement) and drop the compare's (empty).
fn swap_branch(last: &Emitted, fused: Opcode, jump_operand: &[u8]) -> (usize, Opcode, Vec<u8>) {
    let _ = last;
    (last.at, fused, jump_operand.to_vec())
}

/// Property id out of a `GETPROP`-style 4-byte operand (little-endian
/// `u32`), if it's small enough to carry in the 1-byte slot a fused
/// `*Lcl1` form has room for.
fn prop_id_of(operand: &[u8]) -> Option<u8> {
    if operand.len() != 4 {
        return None;
    }
    let id = u32::from_le_bytes([operand[0], operand[1], operand[2], operand[3]]);
    u8::try_from(id).ok()
}

fn fuse_lcl1_with_u8_tail(
    last: &Emitted,
    fused: Opcode,
    tail: Option<u8>,
) -> Option<(usize, Opcode, Vec<u8>)> {
    let tail = tail?;
    let mut operand = last.operand.clone();
    operand.push(tail);
    Some((last.at, fused, operand))
}

fn fuse_lcl1_call(
    last: &Emitted,
    fused: Opcode,
    call_operand: &[u8],
) -> Option<(usize, Opcode, Vec<u8>)> {
    // CALLPROP operand is `u32 prop_id | u8 argc`; the fused form only has
    // room for a 1-byte prop id plus the argc byte.
    if call_operand.len() != 5 {
        return None;
    }
    let prop_id = u32::from_le_bytes([call_operand[0], call_operand[1], call_operand[2], call_operand[3]]);
    let prop_id: u8 = u8::try_from(prop_id).ok()?;
    let argc = call_operand[4];
    let mut operand = last.operand.clone();
    operand.push(prop_id);
    operand.push(argc);
    Some((last.at, fused, operand))
}

#[cfg(test)]
mod tests {
    use super::*;
    use t3_bytecode::ByteStream;

    fn write_u16(v: u16) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    fn write_u32(v: u32) -> Vec<u8> {
        v.to_le_bytes().to_vec()
    }

    #[test]
    fn push_true_retval_fuses_to_rettrue() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::PushTrue, &[]);
        ph.emit(&mut code, Opcode::RetVal, &[]);
        assert_eq!(code.as_bytes(), &[Opcode::RetTrue.to_u8()]);
    }

    #[test]
    fn push_nil_retval_fuses_to_retnil() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::PushNil, &[]);
        ph.emit(&mut code, Opcode::RetVal, &[]);
        assert_eq!(code.as_bytes(), &[Opcode::RetNil.to_u8()]);
    }

    #[test]
    fn getr0_retval_fuses_to_ret() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::GetR0, &[]);
        ph.emit(&mut code, Opcode::RetVal, &[]);
        assert_eq!(code.as_bytes(), &[Opcode::Ret.to_u8()]);
    }

    #[test]
    fn redundant_return_after_terminator_is_dropped() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::RetNil, &[]);
        ph.emit(&mut code, Opcode::RetNil, &[]);
        assert_eq!(code.as_bytes(), &[Opcode::RetNil.to_u8()]);
    }

    #[test]
    fn gt_jf_fuses_to_jle() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::Gt, &[]);
        ph.emit(&mut code, Opcode::Jf, &write_u16(0));
        let bytes = code.as_bytes();
        assert_eq!(bytes[0], Opcode::Jle.to_u8());
        assert_eq!(bytes.len(), 3);
    }

    #[test]
    fn le_jf_fuses_to_jgt() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::Le, &[]);
        ph.emit(&mut code, Opcode::Jf, &write_u16(0));
        assert_eq!(code.as_bytes()[0], Opcode::Jgt.to_u8());
    }

    #[test]
    fn not_not_fuses_to_boolize() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::Not, &[]);
        ph.emit(&mut code, Opcode::Not, &[]);
        assert_eq!(code.as_bytes(), &[Opcode::Boolize.to_u8()]);
    }

    #[test]
    fn push_nil_je_fuses_to_jnil() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::PushNil, &[]);
        ph.emit(&mut code, Opcode::Je, &write_u16(7));
        let bytes = code.as_bytes();
        assert_eq!(bytes[0], Opcode::Jnil.to_u8());
    }

    #[test]
    fn push_nil_setlcl1_fuses_to_nillcl1() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::PushNil, &[]);
        ph.emit(&mut code, Opcode::SetLcl1, &write_u16(2));
        let bytes = code.as_bytes();
        assert_eq!(bytes[0], Opcode::NilLcl1.to_u8());
        assert_eq!(&bytes[1..3], &write_u16(2)[..]);
        assert_eq!(bytes.len(), 3);
    }

    #[test]
    fn push_1_setlcl1_fuses_to_onelcl1() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::Push1, &[]);
        ph.emit(&mut code, Opcode::SetLcl1, &write_u16(0));
        assert_eq!(code.as_bytes()[0], Opcode::OneLcl1.to_u8());
    }

    #[test]
    fn disc_disc_fuses_to_disc1_two() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::Disc, &[]);
        ph.emit(&mut code, Opcode::Disc, &[]);
        assert_eq!(code.as_bytes(), &[Opcode::Disc1.to_u8(), 2]);
    }

    #[test]
    fn disc1_disc_increments_count() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::Disc, &[]);
        ph.emit(&mut code, Opcode::Disc, &[]);
        ph.emit(&mut code, Opcode::Disc, &[]);
        assert_eq!(code.as_bytes(), &[Opcode::Disc1.to_u8(), 3]);
    }

    #[test]
    fn getlcl1_getprop_fuses_when_prop_id_fits_in_a_byte() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::GetLcl1, &write_u16(3));
        ph.emit(&mut code, Opcode::GetProp, &write_u32(9));
        let bytes = code.as_bytes();
        assert_eq!(bytes[0], Opcode::GetPropLcl1.to_u8());
        assert_eq!(&bytes[1..3], &write_u16(3)[..]);
        assert_eq!(bytes[3], 9);
    }

    #[test]
    fn getlcl1_getprop_does_not_fuse_when_prop_id_overflows_a_byte() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::GetLcl1, &write_u16(3));
        ph.emit(&mut code, Opcode::GetProp, &write_u32(300));
        let bytes = code.as_bytes();
        // unfused: both instructions present in full
        assert_eq!(bytes[0], Opcode::GetLcl1.to_u8());
        assert_eq!(bytes[3], Opcode::GetProp.to_u8());
    }

    #[test]
    fn getlcl1_push_setind_fuses_to_setindlcl1i8() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::GetLcl1, &write_u16(1));
        ph.emit(&mut code, Opcode::Push1, &[]);
        ph.emit(&mut code, Opcode::SetInd, &[]);
        let bytes = code.as_bytes();
        assert_eq!(bytes[0], Opcode::SetIndLcl1I8.to_u8());
        assert_eq!(&bytes[1..3], &write_u16(1)[..]);
        assert_eq!(bytes[3], 1);
    }

    #[test]
    fn clear_prevents_fusion_across_a_label() {
        let mut code = ByteStream::new();
        let mut ph = Peephole::new();
        ph.emit(&mut code, Opcode::PushTrue, &[]);
        ph.clear();
        ph.emit(&mut code, Opcode::RetVal, &[]);
        let bytes = code.as_bytes();
        assert_eq!(bytes[0], Opcode::PushTrue.to_u8());
        assert_eq!(bytes[1], Opcode::RetVal.to_u8());
    }
}
