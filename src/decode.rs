//! Decoding of the code region into a list of instructions.

use crate::error::DecodeError;
use crate::opcode::Opcode;
use core::fmt;

/// One decoded instruction.
///
/// Everything but the two flags is fixed by the decoder; the flags are filled
/// in by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// The operation.
    pub op: Opcode,
    /// The immediate operand, or zero for opcodes without one.
    ///
    /// For a `jump` directly preceded by a `const` this holds the constant,
    /// i.e. the static jump target.
    pub operand: i32,
    /// Operand-stack depth in bytes before this instruction executes.
    pub depth: i32,
    /// This instruction may be the target of a jump.
    pub jump_used: bool,
    /// This `jump` has a computed target, or this `enter` opens a procedure
    /// containing such a jump.
    pub computed_jump: bool,
}

impl Instruction {
    /// Create an instruction which has not been decoded from an image, for
    /// example to feed into an image builder.
    pub fn new(op: Opcode, operand: i32) -> Instruction {
        Instruction {
            op,
            operand,
            depth: 0,
            jump_used: false,
            computed_jump: false,
        }
    }

    /// Append the binary encoding of this instruction to `sink`.
    pub fn encode(&self, sink: &mut Vec<u8>) {
        sink.push(self.op as u8);
        match self.op.operand_width() {
            0 => {}
            1 => sink.push(self.operand as u8),
            _ => sink.extend_from_slice(&self.operand.to_le_bytes()),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op.operand_width() {
            0 if self.op == Opcode::Jump && self.operand != 0 => {
                write!(f, "{} ; -> {}", self.op, self.operand)
            }
            0 => write!(f, "{}", self.op),
            _ => write!(f, "{} {}", self.op, self.operand),
        }
    }
}

/// Decode `count` instructions from `code`.
///
/// The whole code region must be consumed by exactly `count` instructions.
pub fn decode(code: &[u8], count: usize) -> Result<Vec<Instruction>, DecodeError> {
    let mut instructions: Vec<Instruction> = Vec::with_capacity(count);
    let mut offset = 0;
    let mut depth = 0;

    for index in 0..count {
        let truncated = DecodeError::Truncated { index, offset };
        let byte = *code.get(offset).ok_or(truncated)?;
        let op = Opcode::new(byte).ok_or(DecodeError::BadOpcode {
            index,
            offset,
            opcode: byte,
        })?;
        let start = offset + 1;
        let width = op.operand_width();
        let bytes = code.get(start..start + width).ok_or(truncated)?;
        let mut operand = match *bytes {
            [] => 0,
            [b] => i32::from(b),
            [b0, b1, b2, b3] => i32::from_le_bytes([b0, b1, b2, b3]),
            _ => unreachable!("operand widths are 0, 1 or 4"),
        };
        offset = start + width;

        // Fold `const X; jump` into a jump with a static target. The constant
        // stays in place so that execution is unaffected.
        if op == Opcode::Jump {
            if let Some(prev) = instructions.last() {
                if prev.op == Opcode::Const {
                    operand = prev.operand;
                }
            }
        }

        instructions.push(Instruction {
            op,
            operand,
            depth,
            jump_used: false,
            computed_jump: false,
        });
        depth += op.stack_delta();
    }

    if offset != code.len() {
        return Err(DecodeError::TrailingCode {
            extra: code.len() - offset,
        });
    }
    log::debug!("decoded {count} instructions, final depth {depth}");
    Ok(instructions)
}

/// Is the `jump` at `index` a static jump, i.e. directly preceded by a
/// `const` whose value it carries?
pub(crate) fn is_static_jump(instructions: &[Instruction], index: usize) -> bool {
    index > 0 && instructions[index].op == Opcode::Jump && instructions[index - 1].op == Opcode::Const
}
