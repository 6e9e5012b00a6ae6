//! Error types for loading modules and for running them.
//!
//! Loading a module can fail in three stages, each with its own error type:
//! the header ([`HeaderError`]), the code stream ([`DecodeError`]) and the
//! static verifier ([`VerifyError`]). [`LoadError`] wraps all of them. None of
//! these are recoverable: a module which fails to load is never callable.
//!
//! Errors raised while a module is running are returned as [`anyhow::Error`]s.
//! When the module itself misbehaved
//! the root cause is a [`Trap`]; when a host syscall handler failed it is
//! whatever error the handler returned.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A malformed image header.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// The file is shorter than the header, or a region runs past its end.
    #[error("image is truncated")]
    Truncated,
    /// The magic number is not a known image version.
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),
    /// The instruction count is negative.
    #[error("bad instruction count")]
    BadInstructionCount,
    /// The code region starts outside the file.
    #[error("bad code offset")]
    BadCodeOffset,
    /// The code region ends outside the file.
    #[error("bad code length")]
    BadCodeLength,
    /// The data region does not immediately follow the code region.
    #[error("bad data offset")]
    BadDataOffset,
    /// The data region is negative, not word sized or runs past the file.
    #[error("bad data length")]
    BadDataLength,
    /// The literal region is negative or does not end where the file does.
    #[error("bad literal length")]
    BadLitLength,
    /// The bss size is negative or too large to address.
    #[error("bad bss length")]
    BadBssLength,
    /// The jump-table target list is malformed.
    #[error("bad jump table length")]
    BadJumpTableLength,
}

/// A malformed code stream.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// An opcode byte outside the instruction set.
    #[error("bad opcode {opcode:#04x} at instruction {index} (byte offset {offset})")]
    BadOpcode {
        /// Index of the offending instruction.
        index: usize,
        /// Byte offset within the code region.
        offset: usize,
        /// The raw opcode byte.
        opcode: u8,
    },
    /// An operand or opcode runs past the end of the code region.
    #[error("code truncated at instruction {index} (byte offset {offset})")]
    Truncated {
        /// Index of the offending instruction.
        index: usize,
        /// Byte offset within the code region.
        offset: usize,
    },
    /// The code region holds bytes past the last declared instruction.
    #[error("{extra} trailing bytes after the last instruction")]
    TrailingCode {
        /// Number of unused bytes.
        extra: usize,
    },
}

/// The reason a module was rejected by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[expect(missing_docs, reason = "described by their `Display` messages")]
pub enum VerifyErrorKind {
    StackUnderflow,
    StackOverflow,
    MissingProcEnd,
    BadEntryFrame,
    BadReturnFrame,
    BadOpStackAtReturn,
    BadOpStackAtJump,
    BadOpStackAtCall,
    JumpOutOfRange,
    BadJumpTarget,
    SelfLoop,
    BadCallTarget,
    ExplicitEntryCall,
    BadArgAddress,
    MissingProcFrame,
    BadLocalAddress,
    BadLoadAddress,
    MissingFinalReturn,
}

impl fmt::Display for VerifyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::StackUnderflow => "operand stack underflow",
            Self::StackOverflow => "operand stack overflow",
            Self::MissingProcEnd => "missing procedure end",
            Self::BadEntryFrame => "bad entry frame",
            Self::BadReturnFrame => "bad return frame",
            Self::BadOpStackAtReturn => "bad operand stack at return",
            Self::BadOpStackAtJump => "bad operand stack at jump",
            Self::BadOpStackAtCall => "bad operand stack at call",
            Self::JumpOutOfRange => "jump target out of range",
            Self::BadJumpTarget => "bad jump target",
            Self::SelfLoop => "jump to itself",
            Self::BadCallTarget => "bad call target",
            Self::ExplicitEntryCall => "explicit call to the entry point",
            Self::BadArgAddress => "bad argument address",
            Self::MissingProcFrame => "instruction outside of a procedure frame",
            Self::BadLocalAddress => "bad local address",
            Self::BadLoadAddress => "bad load address",
            Self::MissingFinalReturn => "missing final return",
        };
        f.write_str(msg)
    }
}

/// A verification failure and the instruction it was detected at.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{kind} at instruction {index}")]
pub struct VerifyError {
    /// Index of the offending instruction.
    pub index: usize,
    /// What was wrong with it.
    pub kind: VerifyErrorKind,
}

impl VerifyError {
    pub(crate) fn new(index: usize, kind: VerifyErrorKind) -> Self {
        VerifyError { index, kind }
    }
}

/// Any failure to turn an image into a runnable module.
#[derive(Error, Debug)]
pub enum LoadError {
    /// The image could not be read.
    #[error("failed to read module image `{}`", path.display())]
    Io {
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// The header is malformed.
    #[error("invalid module header")]
    Header(#[from] HeaderError),
    /// The code region is malformed.
    #[error("invalid module code")]
    Decode(#[from] DecodeError),
    /// The code failed verification.
    #[error("module failed verification")]
    Verify(#[from] VerifyError),
}

/// A runtime fault raised by module code.
///
/// Traps stop the running call and are returned to the host as the root
/// cause of an [`anyhow::Error`]. The module stays loaded and may be called
/// again.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Trap {
    /// An `undef` instruction was executed.
    #[error("undefined instruction executed")]
    UndefinedInstruction,
    /// The program stack ran into the static data.
    #[error("program stack overflow")]
    StackOverflow,
    /// Too many nested procedure calls.
    #[error("call stack exhausted")]
    CallStackExhausted,
    /// A computed call did not land on the start of a procedure.
    #[error("bad call target")]
    BadCallTarget,
    /// A computed jump did not land on a jump target of the current procedure.
    #[error("bad jump target")]
    BadJumpTarget,
    /// Integer division or remainder by zero.
    #[error("integer divide by zero")]
    IntegerDivisionByZero,
    /// The module called a syscall the host did not define.
    #[error("unknown syscall {0}")]
    UnknownSyscall(u32),
}

/// Where in a module a trap happened.
///
/// Attached as context to the errors of failed calls.
#[derive(Debug, Clone)]
pub struct TrapSite {
    /// Name of the module.
    pub module: String,
    /// Index of the instruction which trapped, when known.
    pub pc: Option<usize>,
    /// Start instructions of the procedures on the call stack, outermost first.
    pub frames: Vec<i32>,
}

impl fmt::Display for TrapSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module `{}`", self.module)?;
        if let Some(pc) = self.pc {
            write!(f, " trapped at instruction {pc}")?;
        }
        if !self.frames.is_empty() {
            f.write_str("\ncall stack:")?;
            for (i, frame) in self.frames.iter().rev().enumerate() {
                write!(f, "\n  {i:>3}: procedure @{frame}")?;
            }
        }
        Ok(())
    }
}

/// A host access to module memory which fell outside the sandbox.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("out of bounds memory access of {len} bytes at {addr:#x}")]
pub struct MemoryAccessError {
    /// The module address.
    pub addr: u32,
    /// The access length.
    pub len: u32,
}
