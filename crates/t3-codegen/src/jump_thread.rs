//! Jump threading (§3, §4.5).
//!
//! A post-emission pass over one already-generated method body: every
//! `JMP`-to-`JMP` chain collapses to a single hop to the final target, and an
//! unconditional `JMP` that lands on a `RET`/`RETVAL`/`RETNIL`/`RETTRUE`/
//! `THROW` is replaced in place by a copy of that terminator, saving the
//! extra hop at run time. Conditional jumps that land on a `JMP` get
//! re-targeted the same way, but are never replaced by the terminator itself
//! -- collapsing a conditional branch into an unconditional return would
//! change which paths actually return.
//!
//! This only ever rewrites an instruction's opcode byte and/or its
//! displacement operand, never its length: a `JMP` occupies 3 bytes and a
//! bare terminator occupies 1, so replacing one pads the remaining 2 bytes
//! with `NOP` rather than shifting everything after it, which would
//! invalidate every other jump target and anchor offset already recorded
//! against the stream.
//!
//! `JST`/`JSF` (save-on-true/false) get one further rewrite: if the
//! jump-taken path lands on a `JT`/`JF` of the same polarity, the value
//! `JST`/`JSF` kept on the stack is about to be tested again by that
//! `JT`/`JF` and will always agree with the test that just put it there --
//! so the pair compresses to a single `JT`/`JF` aimed at the inner jump's
//! own target, dropping the now-redundant duplicate-and-test. `JST`/`JSF`
//! and `JT`/`JF` all occupy the same 3 bytes, so this only ever touches the
//! opcode byte and the displacement, same as every other rewrite here.
//! Opposite polarity (`JST` landing on `JF`, or vice versa) is left alone:
//! the two tests disagree on a false/true value, so the combined behavior
//! depends on whatever instruction follows the inner jump, not just its
//! target.
//!
//! Disabled outright once the generator has recorded any error: threading
//! malformed code tends to produce a confusing second failure on top of the
//! real one.

use t3_bytecode::{ByteStream, Opcode};

const MAX_HOPS: u32 = 20;

/// Thread every jump in `code[func_start..func_start + func_len]`. `code`
/// must already contain a complete, well-formed method body in that range
/// (fixups resolved, every jump target on an instruction boundary).
pub fn thread_jumps(code: &mut ByteStream, func_start: usize, func_len: usize, has_errors: bool) {
    if has_errors {
        return;
    }
    let sites: Vec<usize> = jump_sites(code, func_start, func_len);
    for site in sites {
        let opcode = Opcode::from_u8(code.get_u8_at(site)).expect("site is a decoded jump");
        let original_target = jump_target(code, site);
        let final_target = chase(code, original_target, func_start, func_len);
        if final_target != original_target {
            retarget(code, site, final_target);
        }
        if opcode.is_unconditional_jump() {
            if let Some(terminator) = terminator_at(code, final_target, func_start, func_len) {
                code.patch_at(site, &[terminator.to_u8(), Opcode::Nop.to_u8(), Opcode::Nop.to_u8()]);
            }
        } else if let Some(plain) = same_polarity_plain_jump(code, opcode, final_target, func_start, func_len) {
            let inner_target = chase(code, jump_target(code, final_target), func_start, func_len);
            code.patch_at(site, &[plain.to_u8()]);
            retarget(code, site, inner_target);
        }
    }
}

/// If `opcode` is `JST`/`JSF` and the instruction at `target` is `JT`/`JF`
/// of matching polarity, the plain conditional jump the pair compresses
/// into (§4.5's last bullet).
fn same_polarity_plain_jump(
    code: &ByteStream,
    opcode: Opcode,
    target: usize,
    func_start: usize,
    func_len: usize,
) -> Option<Opcode> {
    if target < func_start || target >= func_start + func_len {
        return None;
    }
    let target_opcode = Opcode::from_u8(code.get_u8_at(target))?;
    match (opcode, target_opcode) {
        (Opcode::Jst, Opcode::Jt) => Some(Opcode::Jt),
        (Opcode::Jsf, Opcode::Jf) => Some(Opcode::Jf),
        _ => None,
    }
}

/// Offsets (relative to the whole stream) of every jump instruction inside
/// the function's byte range.
fn jump_sites(code: &ByteStream, func_start: usize, func_len: usize) -> Vec<usize> {
    let mut sites = Vec::new();
    let mut pos = func_start;
    let end = func_start + func_len;
    while pos < end {
        let opcode = Opcode::from_u8(code.get_u8_at(pos)).expect("well-formed method body");
        let operand_len = operand_len_at(code, opcode, pos + 1);
        if opcode.is_jump() {
            sites.push(pos);
        }
        pos += 1 + operand_len;
    }
    sites
}

/// Absolute offset a jump at `site` currently targets.
fn jump_target(code: &ByteStream, site: usize) -> usize {
    let disp_at = site + 1;
    let disp = code.read_i16_at(disp_at);
    let next_instr = site + 1 + 2;
    (next_instr as isize + disp as isize) as usize
}

/// Rewrite the displacement at `site` so the jump lands on `target`.
fn retarget(code: &mut ByteStream, site: usize, target: usize) {
    let disp_at = site + 1;
    let next_instr = site + 1 + 2;
    let disp = target as isize - next_instr as isize;
    code.patch_i16_at(disp_at, disp as i16);
}

/// Follow a chain of unconditional `JMP`s starting at `target`, up to
/// [`MAX_HOPS`], returning the final landing offset. A cycle (an
/// unreachable infinite loop of jumps, which a sane generator never
/// produces but a malformed one might) stops at the hop limit rather than
/// spinning.
fn chase(code: &ByteStream, mut target: usize, func_start: usize, func_len: usize) -> usize {
    let end = func_start + func_len;
    for _ in 0..MAX_HOPS {
        if target < func_start || target >= end {
            break;
        }
        let Some(opcode) = Opcode::from_u8(code.get_u8_at(target)) else {
            break;
        };
        if !opcode.is_unconditional_jump() {
            break;
        }
        let next = jump_target(code, target);
        if next == target {
            break;
        }
        target = next;
    }
    target
}

/// The terminator opcode at `offset`, if one sits there and threading into
/// it would stay inside this function's own body.
fn terminator_at(code: &ByteStream, offset: usize, func_start: usize, func_len: usize) -> Option<Opcode> {
    if offset < func_start || offset >= func_start + func_len {
        return None;
    }
    let opcode = Opcode::from_u8(code.get_u8_at(offset))?;
    if opcode.is_return() || opcode == Opcode::Throw {
        Some(opcode)
    } else {
        None
    }
}

fn operand_len_at(code: &ByteStream, opcode: Opcode, operand_start: usize) -> usize {
    match opcode.fixed_operand_len() {
        Some(len) => len,
        None => match opcode {
            Opcode::PushStrI => 2 + code.read_u16_at(operand_start) as usize,
            Opcode::NamedArgTab => 2 + code.read_u16_at(operand_start) as usize * 2,
            Opcode::Switch => 2 + code.read_u16_at(operand_start) as usize * 7 + 2,
            _ => unreachable!("fixed_operand_len already handled every other opcode"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_jmp(code: &mut ByteStream, disp: i16) -> usize {
        let at = code.current_offset();
        code.write_u8(Opcode::Jmp.to_u8());
        code.write_i16(disp);
        at
    }

    #[test]
    fn jmp_chain_collapses_to_the_final_target() {
        let mut code = ByteStream::new();
        // [0] JMP -> [3]   (targets the second jmp)
        // [3] JMP -> [6]   (targets retnil)
        // [6] RETNIL
        let first = write_jmp(&mut code, 0); // patched below
        let second = write_jmp(&mut code, 0);
        let retnil_at = code.current_offset();
        code.write_u8(Opcode::RetNil.to_u8());

        retarget(&mut code, first, second);
        retarget(&mut code, second, retnil_at);

        let len = code.current_offset();
        thread_jumps(&mut code, 0, len, false);

        // both jumps land on a terminator once threaded, so both get
        // replaced by a direct copy of it, padded back out to 3 bytes with
        // NOPs rather than shifting the stream.
        assert_eq!(code.get_u8_at(first), Opcode::RetNil.to_u8());
        assert_eq!(code.get_u8_at(first + 1), Opcode::Nop.to_u8());
        assert_eq!(code.get_u8_at(first + 2), Opcode::Nop.to_u8());
        assert_eq!(code.get_u8_at(second), Opcode::RetNil.to_u8());
        assert_eq!(code.get_u8_at(second + 1), Opcode::Nop.to_u8());
        assert_eq!(code.get_u8_at(second + 2), Opcode::Nop.to_u8());
    }

    #[test]
    fn conditional_jump_threads_through_but_is_not_replaced() {
        let mut code = ByteStream::new();
        let jt_at = code.current_offset();
        code.write_u8(Opcode::Jt.to_u8());
        code.write_i16(0);
        let jmp_at = code.current_offset();
        code.write_u8(Opcode::Jmp.to_u8());
        code.write_i16(0);
        let ret_at = code.current_offset();
        code.write_u8(Opcode::Ret.to_u8());

        retarget(&mut code, jt_at, jmp_at);
        retarget(&mut code, jmp_at, ret_at);

        let len = code.current_offset();
        thread_jumps(&mut code, 0, len, false);

        // still a JT, just retargeted straight at the return
        assert_eq!(code.get_u8_at(jt_at), Opcode::Jt.to_u8());
        assert_eq!(jump_target(&code, jt_at), ret_at);
    }

    #[test]
    fn jst_landing_on_a_same_polarity_jt_compresses_to_a_single_jt() {
        let mut code = ByteStream::new();
        // [0] JST -> [3]
        // [3] JT -> [6]
        // [6] RETTRUE
        let jst_at = code.current_offset();
        code.write_u8(Opcode::Jst.to_u8());
        code.write_i16(0);
        let jt_at = code.current_offset();
        code.write_u8(Opcode::Jt.to_u8());
        code.write_i16(0);
        let rettrue_at = code.current_offset();
        code.write_u8(Opcode::RetTrue.to_u8());

        retarget(&mut code, jst_at, jt_at);
        retarget(&mut code, jt_at, rettrue_at);

        let len = code.current_offset();
        thread_jumps(&mut code, 0, len, false);

        assert_eq!(code.get_u8_at(jst_at), Opcode::Jt.to_u8());
        assert_eq!(jump_target(&code, jst_at), rettrue_at);
    }

    #[test]
    fn jst_landing_on_opposite_polarity_jf_is_left_alone() {
        let mut code = ByteStream::new();
        let jst_at = code.current_offset();
        code.write_u8(Opcode::Jst.to_u8());
        code.write_i16(0);
        let jf_at = code.current_offset();
        code.write_u8(Opcode::Jf.to_u8());
        code.write_i16(0);
        let ret_at = code.current_offset();
        code.write_u8(Opcode::Ret.to_u8());

        retarget(&mut code, jst_at, jf_at);
        retarget(&mut code, jf_at, ret_at);

        let len = code.current_offset();
        thread_jumps(&mut code, 0, len, false);

        assert_eq!(code.get_u8_at(jst_at), Opcode::Jst.to_u8());
        assert_eq!(jump_target(&code, jst_at), jf_at);
    }

    #[test]
    fn disabled_when_errors_present() {
        let mut code = ByteStream::new();
        let jmp_at = write_jmp(&mut code, 0);
        let ret_at = code.current_offset();
        code.write_u8(Opcode::Ret.to_u8());
        retarget(&mut code, jmp_at, ret_at);

        let len = code.current_offset();
        thread_jumps(&mut code, 0, len, true);

        assert_eq!(code.get_u8_at(jmp_at), Opcode::Jmp.to_u8());
    }

    #[test]
    fn cycle_is_bounded_by_the_hop_limit() {
        let mut code = ByteStream::new();
        let a = write_jmp(&mut code, 0);
        let b = write_jmp(&mut code, 0);
        retarget(&mut code, a, b);
        retarget(&mut code, b, a);

        let len = code.current_offset();
        // must terminate rather than loop forever
        thread_jumps(&mut code, 0, len, false);
    }
}
