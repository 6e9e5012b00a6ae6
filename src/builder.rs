//! Programmatic assembly of module images.

use crate::decode::Instruction;
use crate::header::{HEADER_SIZE_V1, HEADER_SIZE_V2, MAGIC_V1, MAGIC_V2};
use crate::opcode::Opcode;

/// Assembles instructions and data into a module image.
///
/// ```
/// use qvm::{ImageBuilder, Opcode::*};
///
/// let mut b = ImageBuilder::new();
/// b.ops(&[(Enter, 8), (Const, 42), (Leave, 8), (Push, 0), (Leave, 8)]);
/// let image: Vec<u8> = b.build();
/// ```
///
/// Images with a jump-table target list are emitted in the version 2 format,
/// all others in version 1.
#[derive(Debug, Default, Clone)]
pub struct ImageBuilder {
    code: Vec<u8>,
    instruction_count: u32,
    data: Vec<u8>,
    lit: Vec<u8>,
    bss: u32,
    jump_targets: Option<Vec<i32>>,
}

impl ImageBuilder {
    /// An empty image.
    pub fn new() -> ImageBuilder {
        ImageBuilder::default()
    }

    /// Index the next instruction will get.
    pub fn next_index(&self) -> i32 {
        self.instruction_count as i32
    }

    /// Append one instruction.
    pub fn op(&mut self, op: Opcode, operand: i32) -> &mut Self {
        Instruction::new(op, operand).encode(&mut self.code);
        self.instruction_count += 1;
        self
    }

    /// Append instructions.
    pub fn ops(&mut self, ops: &[(Opcode, i32)]) -> &mut Self {
        for &(op, operand) in ops {
            self.op(op, operand);
        }
        self
    }

    /// Append words to the initialized data region.
    pub fn data_words(&mut self, words: &[u32]) -> &mut Self {
        for w in words {
            self.data.extend_from_slice(&w.to_le_bytes());
        }
        self
    }

    /// Append bytes to the literal region.
    pub fn lit(&mut self, bytes: &[u8]) -> &mut Self {
        self.lit.extend_from_slice(bytes);
        self
    }

    /// Reserve `len` more zeroed bytes after the literals.
    pub fn bss(&mut self, len: u32) -> &mut Self {
        self.bss += len;
        self
    }

    /// Add computed-jump targets, switching to the version 2 format.
    pub fn jump_targets(&mut self, targets: &[i32]) -> &mut Self {
        self.jump_targets
            .get_or_insert_with(Vec::new)
            .extend_from_slice(targets);
        self
    }

    /// Serialize the image.
    pub fn build(&self) -> Vec<u8> {
        let (magic, header_size) = match self.jump_targets {
            None => (MAGIC_V1, HEADER_SIZE_V1),
            Some(_) => (MAGIC_V2, HEADER_SIZE_V2),
        };
        let code_offset = header_size as u32;
        let code_length = self.code.len() as u32;
        let mut words = vec![
            magic,
            self.instruction_count,
            code_offset,
            code_length,
            code_offset + code_length,
            self.data.len() as u32,
            self.lit.len() as u32,
            self.bss,
        ];
        if let Some(targets) = &self.jump_targets {
            words.push(4 * targets.len() as u32);
        }

        let mut image = Vec::new();
        for w in words {
            image.extend_from_slice(&w.to_le_bytes());
        }
        image.extend_from_slice(&self.code);
        image.extend_from_slice(&self.data);
        image.extend_from_slice(&self.lit);
        for t in self.jump_targets.iter().flatten() {
            image.extend_from_slice(&t.to_le_bytes());
        }
        image
    }
}
