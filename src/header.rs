//! Parsing and validation of the module image header.
//!
//! An image is laid out as:
//!
//! ```text
//! +--------+------+------+----------+-------------------+
//! | header | code | data | literals | jump table (v2)   |
//! +--------+------+------+----------+-------------------+
//! ```
//!
//! All header words are little-endian `i32`s. The bss region is not stored in
//! the file; only its size is.

use crate::error::HeaderError;

/// Magic number of version 1 images.
pub const MAGIC_V1: u32 = 0x1272_1444;
/// Magic number of version 2 images, which carry a jump-table target list.
pub const MAGIC_V2: u32 = 0x1272_1445;

/// Size of a version 1 header in bytes.
pub const HEADER_SIZE_V1: usize = 8 * 4;
/// Size of a version 2 header in bytes.
pub const HEADER_SIZE_V2: usize = 9 * 4;

/// Largest static data size (data + literals + bss) an image may declare.
pub const MAX_DATA_SIZE: u32 = 1 << 28;

/// The image format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// No jump-table target list.
    V1,
    /// Jump-table target list after the literal region.
    V2,
}

/// A validated image header.
///
/// Construction through [`Header::parse`] guarantees that every region lies
/// within the image and that the regions exactly cover the image after the
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Image format version.
    pub version: Version,
    /// Number of instructions in the code region.
    pub instruction_count: u32,
    /// Byte offset of the code region.
    pub code_offset: u32,
    /// Byte length of the code region.
    pub code_length: u32,
    /// Byte offset of the initialized data region.
    pub data_offset: u32,
    /// Byte length of the initialized data region, a multiple of four.
    pub data_length: u32,
    /// Byte length of the literal region following the data.
    pub lit_length: u32,
    /// Byte length of the zero-filled region following the literals.
    pub bss_length: u32,
    /// Byte length of the jump-table target list, zero for v1 images.
    pub jtrg_length: u32,
}

impl Header {
    /// Parse and validate the header of `image`.
    pub fn parse(image: &[u8]) -> Result<Header, HeaderError> {
        let word = |i: usize| -> Option<i32> {
            let bytes = image.get(i * 4..i * 4 + 4)?;
            Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        };
        if image.len() < HEADER_SIZE_V1 {
            return Err(HeaderError::Truncated);
        }
        let file_len = i64::try_from(image.len()).map_err(|_| HeaderError::Truncated)?;

        let magic = word(0).ok_or(HeaderError::Truncated)? as u32;
        let (version, header_size) = match magic {
            MAGIC_V1 => (Version::V1, HEADER_SIZE_V1),
            MAGIC_V2 => (Version::V2, HEADER_SIZE_V2),
            other => return Err(HeaderError::BadMagic(other)),
        };
        if image.len() < header_size {
            return Err(HeaderError::Truncated);
        }
        let field = |i: usize| i64::from(word(i).unwrap_or(0));

        let instruction_count = field(1);
        let code_offset = field(2);
        let code_length = field(3);
        let data_offset = field(4);
        let data_length = field(5);
        let lit_length = field(6);
        let bss_length = field(7);
        let jtrg_length = match version {
            Version::V1 => 0,
            Version::V2 => field(8),
        };

        if instruction_count < 0 {
            return Err(HeaderError::BadInstructionCount);
        }
        if code_offset < header_size as i64 || code_offset > file_len {
            return Err(HeaderError::BadCodeOffset);
        }
        if code_length < 0 || code_offset + code_length > file_len {
            return Err(HeaderError::BadCodeLength);
        }
        // Every instruction is at least one byte.
        if instruction_count > code_length {
            return Err(HeaderError::BadInstructionCount);
        }
        if data_offset != code_offset + code_length {
            return Err(HeaderError::BadDataOffset);
        }
        if data_length < 0 || data_length % 4 != 0 || data_offset + data_length > file_len {
            return Err(HeaderError::BadDataLength);
        }
        let lit_end = data_offset + data_length + lit_length;
        if lit_length < 0 || lit_end > file_len {
            return Err(HeaderError::BadLitLength);
        }
        match version {
            Version::V1 => {
                if lit_end != file_len {
                    return Err(HeaderError::BadLitLength);
                }
            }
            Version::V2 => {
                if jtrg_length < 0 || jtrg_length % 4 != 0 || lit_end + jtrg_length != file_len {
                    return Err(HeaderError::BadJumpTableLength);
                }
            }
        }
        if bss_length < 0 || data_length + lit_length + bss_length > i64::from(MAX_DATA_SIZE) {
            return Err(HeaderError::BadBssLength);
        }

        // All values are now known to be non-negative and bounded by the
        // file length (or `MAX_DATA_SIZE`), so the narrowing casts are exact.
        Ok(Header {
            version,
            instruction_count: instruction_count as u32,
            code_offset: code_offset as u32,
            code_length: code_length as u32,
            data_offset: data_offset as u32,
            data_length: data_length as u32,
            lit_length: lit_length as u32,
            bss_length: bss_length as u32,
            jtrg_length: jtrg_length as u32,
        })
    }

    /// Size in bytes of this header in the image.
    pub fn size(&self) -> usize {
        match self.version {
            Version::V1 => HEADER_SIZE_V1,
            Version::V2 => HEADER_SIZE_V2,
        }
    }

    /// The code bytes of `image`.
    pub fn code<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        let start = self.code_offset as usize;
        &image[start..start + self.code_length as usize]
    }

    /// The initialized data and literal bytes of `image`, in that order.
    pub fn data<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        let start = self.data_offset as usize;
        &image[start..start + (self.data_length + self.lit_length) as usize]
    }

    /// The raw jump-table target list of `image`.
    pub fn jump_table<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        let start = (self.data_offset + self.data_length + self.lit_length) as usize;
        &image[start..start + self.jtrg_length as usize]
    }

    /// Length of all static data: initialized data, literals and bss.
    pub fn static_data_length(&self) -> u32 {
        self.data_length + self.lit_length + self.bss_length
    }
}
