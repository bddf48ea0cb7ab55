//! Post-generation sanity checks for a finalized [`Module`].
//!
//! None of this runs on the hot path -- it exists so a bug in the code
//! generator shows up as a precise, local error here instead of as a
//! mystifying crash deep in the VM. Three independent properties are
//! checked: every fixup resolves to a defined anchor (§2/§3's closure
//! invariant), every function's operand stack stays within bounds and never
//! underflows, and every function ends in a terminator instruction.

use thiserror::Error;

use crate::anchor::{AnchorError, AnchorTable};
use crate::module::{Function, Module};
use crate::opcode::Opcode;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("invalid opcode {opcode:#04x} at offset {offset} in function {function}")]
    InvalidOpcode {
        function: String,
        opcode: u8,
        offset: usize,
    },

    #[error("stack underflow at offset {offset} in function {function}")]
    StackUnderflow { function: String, offset: usize },

    #[error("stack depth {depth} at offset {offset} in function {function} exceeds the {max} limit")]
    StackOverflow {
        function: String,
        offset: usize,
        depth: i32,
        max: i32,
    },

    #[error("jump at offset {offset} in function {function} targets {target}, not an instruction boundary")]
    InvalidJumpTarget {
        function: String,
        offset: usize,
        target: usize,
    },

    #[error("function {0} falls off the end of its code without a terminator")]
    FallOffEnd(String),

    #[error("function {0} has no recorded code length (anchor never closed by the generator)")]
    MissingExtent(String),

    #[error(transparent)]
    UnclosedFixup(#[from] AnchorError),
}

/// Upper bound on simulated operand-stack depth; a function whose abstract
/// interpretation exceeds this is almost certainly miscompiled rather than
/// legitimately deep.
pub const MAX_STACK_DEPTH: i32 = 4096;

pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    module.anchors.check_closure()?;
    for function in &module.functions {
        verify_function(function, &module.anchors, module.code.as_bytes())?;
    }
    Ok(())
}

fn verify_function(
    function: &Function,
    anchors: &AnchorTable,
    code: &[u8],
) -> Result<(), VerifyError> {
    let start = anchors
        .start_offset(function.anchor)
        .ok_or_else(|| VerifyError::MissingExtent(function.name.clone()))?;
    let len = anchors
        .length(function.anchor)
        .ok_or_else(|| VerifyError::MissingExtent(function.name.clone()))?;
    let body = &code[start..start + len];

    if body.is_empty() {
        return Ok(());
    }

    let instructions = parse_instructions(&function.name, body)?;
    verify_jump_targets(&function.name, &instructions)?;
    verify_stack_depth(&function.name, &instructions, function.header.argc as u16)?;

    let last = instructions.last().expect("checked non-empty above");
    if !last.opcode.is_terminator() {
        return Err(VerifyError::FallOffEnd(function.name.clone()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Instruction {
    /// Offset of the opcode byte itself, relative to the function body.
    offset: usize,
    opcode: Opcode,
    operands: Vec<u8>,
}

fn parse_instructions(function: &str, body: &[u8]) -> Result<Vec<Instruction>, VerifyError> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < body.len() {
        let offset = pos;
        let byte = body[pos];
        let opcode = Opcode::from_u8(byte).ok_or(VerifyError::InvalidOpcode {
            function: function.to_string(),
            opcode: byte,
            offset,
        })?;
        pos += 1;

        let operand_len = match opcode.fixed_operand_len() {
            Some(len) => len,
            None => variable_operand_len(opcode, body, pos),
        };
        let operands = body[pos..pos + operand_len].to_vec();
        pos += operand_len;

        out.push(Instruction {
            offset,
            opcode,
            operands,
        });
    }
    Ok(out)
}

/// Length, in bytes, of the operand that follows the embedded count field
/// for the three variable-length opcodes.
fn variable_operand_len(opcode: Opcode, body: &[u8], operand_start: usize) -> usize {
    match opcode {
        Opcode::PushStrI => {
            let n = u16::from_le_bytes([body[operand_start], body[operand_start + 1]]) as usize;
            2 + n
        }
        Opcode::NamedArgTab => {
            let n = u16::from_le_bytes([body[operand_start], body[operand_start + 1]]) as usize;
            2 + n * 2
        }
        Opcode::Switch => {
            let n = u16::from_le_bytes([body[operand_start], body[operand_start + 1]]) as usize;
            // each case is a 1-byte dataholder tag + 4-byte value + 2-byte
            // branch displacement; a trailing 2-byte default displacement
            // follows the case table.
            2 + n * 7 + 2
        }
        _ => unreachable!("fixed_operand_len already handled every other opcode"),
    }
}

fn verify_jump_targets(function: &str, instructions: &[Instruction]) -> Result<(), VerifyError> {
    let boundaries: std::collections::HashSet<usize> =
        instructions.iter().map(|i| i.offset).collect();
    for instr in instructions {
        if !instr.opcode.is_jump() {
            continue;
        }
        let disp = i16::from_le_bytes([instr.operands[0], instr.operands[1]]);
        let site = instr.offset + 1; // the 2-byte displacement follows the opcode byte
        let target = (site as isize + 2 + disp as isize) as usize;
        if !boundaries.contains(&target) {
            return Err(VerifyError::InvalidJumpTarget {
                function: function.to_string(),
                offset: instr.offset,
                target,
            });
        }
    }
    Ok(())
}

fn verify_stack_depth(
    function: &str,
    instructions: &[Instruction],
    caller_argc: u16,
) -> Result<(), VerifyError> {
    let mut depth: i32 = 0;
    for instr in instructions {
        let (pops, pushes) = match instr.opcode.stack_effect() {
            Some(effect) => effect,
            None => dynamic_effect(instr.opcode, &instr.operands, caller_argc),
        };
        if depth < pops as i32 {
            return Err(VerifyError::StackUnderflow {
                function: function.to_string(),
                offset: instr.offset,
            });
        }
        depth -= pops as i32;
        depth += pushes as i32;
        if depth > MAX_STACK_DEPTH {
            return Err(VerifyError::StackOverflow {
                function: function.to_string(),
                offset: instr.offset,
                depth,
                max: MAX_STACK_DEPTH,
            });
        }
    }
    Ok(())
}

/// Stack effect for the opcodes whose operand count depends on an embedded
/// argument count, per the method-call fixed-operand layout ([`Opcode`]):
/// the argument count is always the last byte of the fixed operand, except
/// `INHERITED`, which carries no operand at all and passes through the
/// current frame's own argument count unchanged.
///
/// `PtrCall` pops the callee value a prior instruction pushed; `CallProp`
/// and `PtrCallProp` likewise pop a stack-addressed target object.
/// `Call` (resolved via a fixup), `CallPropSelf`/`CallPropLcl1` (`self` or
/// a fused local) and `ObjCallProp` (an embedded object reference) all
/// address their target without an extra stack value, so they only pop
/// their arguments.
fn dynamic_effect(opcode: Opcode, operands: &[u8], caller_argc: u16) -> (u16, u16) {
    use Opcode::*;
    match opcode {
        Inherited => (caller_argc, 1),
        Call | CallPropSelf | CallPropLcl1 | ObjCallProp => {
            (*operands.last().expect("call opcode has an operand") as u16, 0)
        }
        PtrCall | CallProp | PtrCallProp => (
            *operands.last().expect("call opcode has an operand") as u16 + 1,
            0,
        ),
        New1 | New2 => (*operands.last().expect("new opcode has an operand") as u16, 1),
        _ => unreachable!("stack_effect() already handled every statically-known opcode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::StreamId;
    use crate::module::MethodHeader;
    use crate::stream::ByteStream;

    fn make_function(name: &str, code: &mut ByteStream, anchors: &mut AnchorTable, body: impl FnOnce(&mut ByteStream)) -> Function {
        let anchor = anchors.create(StreamId::Code);
        anchors.define(anchor, code.current_offset()).unwrap();
        let start = code.current_offset();
        body(code);
        anchors.set_length(anchor, code.current_offset() - start);
        Function {
            name: name.to_string(),
            anchor,
            header: MethodHeader {
                argc: 0,
                ..Default::default()
            },
            exception_table: Vec::new(),
        }
    }

    #[test]
    fn empty_module_verifies() {
        let module = Module::new();
        assert!(verify_module(&module).is_ok());
    }

    #[test]
    fn simple_function_balances_and_terminates() {
        let mut module = Module::new();
        let func = make_function("main", &mut module.code, &mut module.anchors, |c| {
            c.write_u8(Opcode::Push1.to_u8());
            c.write_u8(Opcode::RetVal.to_u8());
        });
        module.functions.push(func);
        assert!(verify_module(&module).is_ok());
    }

    #[test]
    fn invalid_opcode_is_rejected() {
        let mut module = Module::new();
        let func = make_function("main", &mut module.code, &mut module.anchors, |c| {
            c.write_u8(0xFF);
        });
        module.functions.push(func);
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::InvalidOpcode { .. })
        ));
    }

    #[test]
    fn stack_underflow_is_caught() {
        let mut module = Module::new();
        let func = make_function("main", &mut module.code, &mut module.anchors, |c| {
            c.write_u8(Opcode::Add.to_u8());
            c.write_u8(Opcode::RetVal.to_u8());
        });
        module.functions.push(func);
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::StackUnderflow { .. })
        ));
    }

    #[test]
    fn falling_off_the_end_without_a_terminator_is_caught() {
        let mut module = Module::new();
        let func = make_function("main", &mut module.code, &mut module.anchors, |c| {
            c.write_u8(Opcode::Push1.to_u8());
            c.write_u8(Opcode::Disc.to_u8());
        });
        module.functions.push(func);
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::FallOffEnd(_))
        ));
    }

    #[test]
    fn jump_to_the_middle_of_another_instruction_is_rejected() {
        let mut module = Module::new();
        let func = make_function("main", &mut module.code, &mut module.anchors, |c| {
            // JMP with a displacement landing one byte short of RETNIL.
            c.write_u8(Opcode::Jmp.to_u8());
            c.write_i16(-1);
            c.write_u8(Opcode::RetNil.to_u8());
        });
        module.functions.push(func);
        assert!(matches!(
            verify_module(&module),
            Err(VerifyError::InvalidJumpTarget { .. })
        ));
    }

    #[test]
    fn forward_jump_to_a_valid_boundary_verifies() {
        let mut module = Module::new();
        let func = make_function("main", &mut module.code, &mut module.anchors, |c| {
            c.write_u8(Opcode::Jmp.to_u8());
            let site = c.current_offset();
            c.write_i16(0); // filled in below
            let target_placeholder = c.current_offset();
            c.write_u8(Opcode::RetNil.to_u8());
            let disp = (target_placeholder as isize - (site as isize + 2)) as i16;
            c.patch_i16_at(site, disp);
        });
        module.functions.push(func);
        assert!(verify_module(&module).is_ok());
    }

    #[test]
    fn inherited_reuses_the_enclosing_frames_argc() {
        let mut module = Module::new();
        let anchor = module.anchors.create(StreamId::Code);
        module
            .anchors
            .define(anchor, module.code.current_offset())
            .unwrap();
        let start = module.code.current_offset();
        module.code.write_u8(Opcode::Inherited.to_u8());
        module.code.write_u8(Opcode::RetVal.to_u8());
        module
            .anchors
            .set_length(anchor, module.code.current_offset() - start);
        module.functions.push(Function {
            name: "main".to_string(),
            anchor,
            header: MethodHeader {
                argc: 2,
                ..Default::default()
            },
            exception_table: Vec::new(),
        });
        assert!(verify_module(&module).is_ok());
    }

    #[test]
    fn ptrcall_pops_its_callee_value_off_the_stack() {
        // PUSHFNPTR leaves the callee value on the stack; PTRCALL must pop
        // it in addition to its one argument, or the stack never balances.
        let mut module = Module::new();
        let func = make_function("main", &mut module.code, &mut module.anchors, |c| {
            c.write_u8(Opcode::PushFnPtr.to_u8());
            c.write_u16(0);
            c.write_u8(Opcode::Push1.to_u8());
            c.write_u8(Opcode::PtrCall.to_u8());
            c.write_bytes(&[0, 0, 0, 0, 1]); // argc = 1
            c.write_u8(Opcode::RetNil.to_u8());
        });
        module.functions.push(func);
        assert!(verify_module(&module).is_ok());
    }

    #[test]
    fn unresolved_fixup_fails_closure_before_per_function_checks() {
        let mut module = Module::new();
        let dangling = module.anchors.create(StreamId::Code);
        let site = module.code.reserve_u32();
        module.anchors.add_fixup(
            dangling,
            StreamId::Code,
            site,
            crate::anchor::FixupWidth::Four,
            crate::anchor::ReferenceKind::CodeAddr,
        );
        let err = verify_module(&module).unwrap_err();
        assert!(matches!(err, VerifyError::UnclosedFixup(_)));
    }
}
