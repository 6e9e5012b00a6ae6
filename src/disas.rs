//! Textual listing of a loaded module.

use crate::header::Version;
use crate::module::Module;
use core::fmt::Write;

/// Renders the instructions of a [`Module`] as text.
///
/// Each line shows the instruction index, optionally the operand-stack depth
/// in front of the instruction, a `>` for jump targets, and the instruction
/// itself. Procedures are introduced by a label line carrying their frame
/// size.
pub struct Disassembler<'a> {
    module: &'a Module,
    depths: bool,
    header: bool,
}

impl<'a> Disassembler<'a> {
    /// A disassembler for `module` with the default options.
    pub fn new(module: &'a Module) -> Self {
        Disassembler {
            module,
            depths: true,
            header: true,
        }
    }

    /// Whether to print operand-stack depths.
    pub fn depths(&mut self, depths: bool) -> &mut Self {
        self.depths = depths;
        self
    }

    /// Whether to print a summary of the image header first.
    pub fn header(&mut self, header: bool) -> &mut Self {
        self.header = header;
        self
    }

    /// Produce the listing.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        self.write(&mut out).expect("writing to a string cannot fail");
        out
    }

    fn write(&self, out: &mut String) -> core::fmt::Result {
        let module = self.module;
        if self.header {
            let h = module.header();
            let version = match h.version {
                Version::V1 => 1,
                Version::V2 => 2,
            };
            writeln!(
                out,
                "; module `{}`: version {version}, {} instructions, {} procedures",
                module.name(),
                module.instructions().len(),
                module.procedures().len(),
            )?;
            writeln!(
                out,
                "; data {} bytes, literals {} bytes, bss {} bytes",
                h.data_length, h.lit_length, h.bss_length
            )?;
            if let Some(targets) = module.jump_table() {
                writeln!(out, "; {} jump table targets", targets.len())?;
            }
        }

        let mut procs = module.procedures().iter().peekable();
        for (i, inst) in module.instructions().iter().enumerate() {
            if let Some(proc) = procs.next_if(|p| p.start == i) {
                let computed = if proc.computed_jump { ", computed jumps" } else { "" };
                writeln!(out, "\nproc_{i}: ; frame {}{computed}", proc.frame_size)?;
            }
            let marker = if inst.jump_used { '>' } else { ' ' };
            if self.depths {
                writeln!(out, "{i:>8} {:>4} {marker} {inst}", inst.depth)?;
            } else {
                writeln!(out, "{i:>8} {marker} {inst}")?;
            }
        }
        Ok(())
    }
}
