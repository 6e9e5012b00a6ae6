//! The boundary between module code and the host.
//!
//! A module calls out to the host by calling a negative instruction index:
//! `call -1 - id` invokes the host function registered under `id` in the
//! instance's [`Syscalls`] table. Arguments are the words the module stored
//! into its outgoing argument slots with `arg`; each syscall takes a fixed
//! number of them. The handler's return value replaces the call target on
//! the module's operand stack.
//!
//! Handlers receive a [`Caller`], which gives access to host data, to module
//! memory and to the instance itself, so a handler may call back into the
//! module that called it.

use crate::error::Trap;
use crate::memory::MemoryView;
use crate::vm::Vm;
use anyhow::{Result, bail};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Maximum number of arguments a syscall can take.
pub const MAX_SYSCALL_ARGS: usize = 16;

type SyscallFn<T> = dyn Fn(&mut Caller<'_, T>, &[i32]) -> Result<i32> + Send + Sync;

struct Syscall<T> {
    name: String,
    arity: usize,
    func: Arc<SyscallFn<T>>,
}

/// A table of host functions callable from modules, keyed by syscall id.
///
/// A table is built once and shared by any number of instances.
pub struct Syscalls<T> {
    table: HashMap<u32, Syscall<T>>,
}

impl<T> Default for Syscalls<T> {
    fn default() -> Self {
        Syscalls {
            table: HashMap::new(),
        }
    }
}

impl<T> fmt::Debug for Syscalls<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids = self.table.keys().collect::<Vec<_>>();
        ids.sort();
        let mut list = f.debug_map();
        for id in ids {
            let s = &self.table[id];
            list.entry(id, &format_args!("{}/{}", s.name, s.arity));
        }
        list.finish()
    }
}

impl<T> Syscalls<T> {
    /// An empty table.
    pub fn new() -> Self {
        Syscalls::default()
    }

    /// Register `func` as syscall `id`, taking `arity` arguments.
    ///
    /// Fails if `id` is already defined or `arity` exceeds
    /// [`MAX_SYSCALL_ARGS`].
    pub fn define(
        &mut self,
        id: u32,
        name: &str,
        arity: usize,
        func: impl Fn(&mut Caller<'_, T>, &[i32]) -> Result<i32> + Send + Sync + 'static,
    ) -> Result<&mut Self> {
        if arity > MAX_SYSCALL_ARGS {
            bail!("syscall `{name}` takes {arity} arguments, at most {MAX_SYSCALL_ARGS} are supported");
        }
        if let Some(existing) = self.table.get(&id) {
            bail!("syscall {id} is already defined as `{}`", existing.name);
        }
        self.table.insert(
            id,
            Syscall {
                name: name.to_string(),
                arity,
                func: Arc::new(func),
            },
        );
        Ok(self)
    }

    fn get(&self, id: u32) -> Option<&Syscall<T>> {
        self.table.get(&id)
    }

    /// The name syscall `id` was registered under.
    pub fn name(&self, id: u32) -> Option<&str> {
        self.get(id).map(|s| s.name.as_str())
    }

    /// The number of arguments syscall `id` takes.
    pub fn arity(&self, id: u32) -> Option<usize> {
        self.get(id).map(|s| s.arity)
    }
}

/// Invoke syscall `id` for a module whose current frame starts at `ps`.
///
/// The caller has already published its stack pointer in the instance so that
/// the handler can re-enter the module below the current frame.
pub(crate) fn dispatch<T>(vm: &mut Vm<T>, id: u32, ps: i32) -> Result<i32> {
    let Some(syscall) = vm.syscalls().get(id) else {
        return Err(Trap::UnknownSyscall(id).into());
    };
    let func = syscall.func.clone();
    let arity = syscall.arity;

    let mut args = [0; MAX_SYSCALL_ARGS];
    for (i, arg) in args[..arity].iter_mut().enumerate() {
        *arg = vm.memory().load4(ps + 8 + 4 * i as i32);
    }
    log::trace!(
        "syscall {id} `{}` {:?}",
        vm.syscalls().name(id).unwrap_or("?"),
        &args[..arity]
    );

    func(&mut Caller { vm }, &args[..arity])
}

/// The context a syscall handler runs in.
pub struct Caller<'a, T> {
    vm: &'a mut Vm<T>,
}

impl<T> Caller<'_, T> {
    /// The host data of the calling instance.
    pub fn data(&self) -> &T {
        self.vm.data()
    }

    /// The host data of the calling instance, mutably.
    pub fn data_mut(&mut self) -> &mut T {
        self.vm.data_mut()
    }

    /// The memory of the calling instance.
    ///
    /// Views are only valid for the duration of the syscall; module addresses
    /// must be translated again on every call.
    pub fn memory(&mut self) -> MemoryView<'_> {
        self.vm.memory_view()
    }

    /// Name of the calling module.
    pub fn module_name(&self) -> &str {
        self.vm.name()
    }

    /// The call stack of the calling instance.
    pub fn stack_trace(&self) -> &CallTrace {
        self.vm.stack_trace()
    }

    /// Re-enter the calling instance at its entry point with `args`.
    ///
    /// The instance's stack pointer and call depth are restored once the
    /// nested call returns, whether or not it succeeds.
    pub fn call(&mut self, args: &[i32]) -> Result<i32> {
        self.vm.call(args)
    }
}

/// A bounded record of the procedures on an instance's call stack.
///
/// The depth is always tracked exactly; procedure entries beyond the
/// capacity are not recorded.
#[derive(Debug, Clone)]
pub struct CallTrace {
    entries: Vec<i32>,
    capacity: usize,
    depth: usize,
    previous_depth: usize,
}

impl CallTrace {
    /// An empty trace recording at most `capacity` entries.
    pub fn new(capacity: usize) -> CallTrace {
        CallTrace {
            entries: Vec::with_capacity(capacity),
            capacity,
            depth: 0,
            previous_depth: 0,
        }
    }

    pub(crate) fn push(&mut self, procedure: i32) {
        if self.entries.len() < self.capacity {
            self.entries.push(procedure);
        }
        self.previous_depth = self.depth;
        self.depth += 1;
    }

    pub(crate) fn pop(&mut self) {
        self.truncate(self.depth.saturating_sub(1));
    }

    pub(crate) fn truncate(&mut self, depth: usize) {
        if depth < self.depth {
            self.previous_depth = self.depth;
            self.depth = depth;
            self.entries.truncate(depth);
        }
    }

    /// The current call depth, including unrecorded calls.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The call depth before the most recent call or return.
    pub fn previous_depth(&self) -> usize {
        self.previous_depth
    }

    /// The maximum number of recorded entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Start instructions of the recorded procedures, outermost first.
    pub fn entries(&self) -> &[i32] {
        &self.entries
    }
}
