use crate::decode::{Instruction, decode};
use crate::error::LoadError;
use crate::header::{Header, Version};
use crate::verify::{Procedure, verify};
use std::path::Path;

/// A validated, verified, ready-to-run module.
///
/// A `Module` is immutable once loaded and is shared (behind an `Arc`) by
/// every [`Vm`](crate::Vm) instantiated from it. Construction fails unless the
/// header, the code stream and the static verifier all accept the image, so
/// holding a `Module` means holding code that is safe to hand to the
/// interpreter.
#[derive(Debug)]
pub struct Module {
    name: String,
    header: Header,
    instructions: Vec<Instruction>,
    data: Vec<u8>,
    jump_table: Option<Vec<i32>>,
    procedures: Vec<Procedure>,
}

impl Module {
    /// Load a module from an in-memory image.
    pub fn from_bytes(name: impl Into<String>, image: &[u8]) -> Result<Module, LoadError> {
        let name = name.into();
        let header = Header::parse(image)?;
        log::debug!("{name}: {header:?}");

        let mut instructions = decode(header.code(image), header.instruction_count as usize)?;
        let jump_table = match header.version {
            Version::V1 => None,
            Version::V2 => Some(
                header
                    .jump_table(image)
                    .chunks_exact(4)
                    .map(|w| i32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                    .collect::<Vec<_>>(),
            ),
        };
        let procedures = verify(
            &mut instructions,
            header.static_data_length(),
            jump_table.as_deref(),
        )?;

        log::debug!(
            "{name}: loaded {} instructions, {} procedures, {} bytes of static data",
            instructions.len(),
            procedures.len(),
            header.static_data_length(),
        );
        Ok(Module {
            name,
            header,
            instructions,
            data: header.data(image).to_vec(),
            jump_table,
            procedures,
        })
    }

    /// Load a module from an image file, named after the file stem.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Module, LoadError> {
        let path = path.as_ref();
        let image = std::fs::read(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Module::from_bytes(name, &image)
    }

    /// The module's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The image header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The decoded and verified instructions.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Initialized data followed by literals, as stored in the image.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The compiler-supplied jump-table target list of version 2 images.
    pub fn jump_table(&self) -> Option<&[i32]> {
        self.jump_table.as_deref()
    }

    /// Procedures in code order.
    pub fn procedures(&self) -> &[Procedure] {
        &self.procedures
    }

    /// The procedure whose `enter` is at `start`.
    pub fn procedure_at(&self, start: usize) -> Option<&Procedure> {
        let i = self.procedures.binary_search_by_key(&start, |p| p.start).ok()?;
        Some(&self.procedures[i])
    }

    /// The procedure containing instruction `index`.
    pub fn procedure_containing(&self, index: usize) -> Option<&Procedure> {
        let i = self.procedures.partition_point(|p| p.start <= index);
        let proc = self.procedures.get(i.checked_sub(1)?)?;
        proc.range().contains(&index).then_some(proc)
    }

    /// Size of data, literals and bss together.
    pub fn static_data_length(&self) -> u32 {
        self.header.static_data_length()
    }
}
