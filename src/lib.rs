//! A runtime for QVM bytecode modules.
//!
//! QVM modules are compiled game logic, loaded into a host engine and run in
//! a sandbox: a module can only touch its own memory arena and reach the host
//! through numbered syscalls. Loading a module validates its header, decodes
//! its instructions and verifies them before anything runs. An instance then
//! runs either on the interpreter or, with the `cranelift` feature, as native
//! code.
//!
//! ```no_run
//! use qvm::{Config, Module, Syscalls, Vm};
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let module = Arc::new(Module::from_file("vm/game.qvm")?);
//! let mut syscalls = Syscalls::<()>::new();
//! syscalls.define(0, "print", 1, |caller, args| {
//!     let memory = caller.memory();
//!     let text = memory.c_str(args[0])?;
//!     print!("{}", String::from_utf8_lossy(text));
//!     Ok(0)
//! })?;
//! let mut vm = Vm::new(&Config::new(), module, Arc::new(syscalls), ());
//! vm.call(&[0])?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

mod builder;
mod config;
mod decode;
mod disas;
mod error;
mod header;
mod interp;
#[cfg(feature = "cranelift")]
mod jit;
mod memory;
mod module;
mod opcode;
mod registry;
mod syscall;
mod verify;
mod vm;

pub use crate::builder::ImageBuilder;
pub use crate::config::{Config, MAX_CALL_DEPTH, Strategy};
pub use crate::decode::{Instruction, decode};
pub use crate::disas::Disassembler;
pub use crate::error::{
    DecodeError, HeaderError, LoadError, MemoryAccessError, Trap, TrapSite, VerifyError,
    VerifyErrorKind,
};
pub use crate::header::{
    HEADER_SIZE_V1, HEADER_SIZE_V2, Header, MAGIC_V1, MAGIC_V2, MAX_DATA_SIZE, Version,
};
pub use crate::memory::{Memory, MemoryView, SandboxAddr};
pub use crate::module::Module;
pub use crate::opcode::Opcode;
pub use crate::registry::{DirectoryLoader, FileLoader, Registry};
pub use crate::syscall::{CallTrace, Caller, MAX_SYSCALL_ARGS, Syscalls};
pub use crate::verify::{
    MAX_OPSTACK_SLOTS, MAX_PROC_ARGS, PROGRAM_STACK_SIZE, Procedure, verify,
};
pub use crate::vm::{MAX_VMMAIN_ARGS, Vm};
