use crate::config::Config;
use crate::error::{Trap, TrapSite};
use crate::memory::{HostAccess, Memory, MemoryView};
use crate::module::Module;
use crate::syscall::{CallTrace, Syscalls};
use crate::verify::{MAX_OPSTACK_SLOTS, PROGRAM_STACK_SIZE};
use anyhow::{Result, bail};
use std::sync::Arc;

/// Maximum number of arguments passed to a module's entry point.
pub const MAX_VMMAIN_ARGS: usize = 13;

/// Size of the frame built below the program stack pointer for a call into
/// the module: return marker, syscall id slot and the arguments.
const ENTRY_FRAME_SIZE: i32 = 8 + 4 * MAX_VMMAIN_ARGS as i32;

enum Backend {
    Interpreted,
    #[cfg(feature = "cranelift")]
    Compiled(Arc<crate::jit::CompiledModule>),
}

/// A running instance of a [`Module`].
///
/// Each instance owns its own memory, and host data `T` that syscall handlers
/// can reach through their [`Caller`](crate::Caller). Instances are
/// single-threaded; calls into an instance run to completion.
pub struct Vm<T> {
    module: Arc<Module>,
    memory: Memory,
    syscalls: Arc<Syscalls<T>>,
    backend: Backend,

    program_stack: i32,
    stack_bottom: i32,
    call_level: usize,
    trace: CallTrace,
    max_call_depth: usize,

    opstack: Box<[i32]>,
    opstack_top: usize,
    breakpoints: u64,

    data: T,
}

impl<T> Vm<T> {
    /// Instantiate `module`, with `syscalls` available to it.
    ///
    /// If `config` asks for native code and compilation fails, the instance
    /// interprets the module instead.
    pub fn new(config: &Config, module: Arc<Module>, syscalls: Arc<Syscalls<T>>, data: T) -> Vm<T> {
        let memory = Memory::new(&module);
        let size = memory.size() as i32;
        let backend = if config.wants_compiler() {
            compile(&module)
        } else {
            Backend::Interpreted
        };

        // Every frame on the call stack uses at most `MAX_OPSTACK_SLOTS`.
        let slots = (config.get_max_call_depth() + 1) * MAX_OPSTACK_SLOTS as usize;

        Vm {
            memory,
            syscalls,
            backend,
            program_stack: size,
            stack_bottom: size - PROGRAM_STACK_SIZE,
            call_level: 0,
            trace: CallTrace::new(config.get_call_trace_capacity()),
            max_call_depth: config.get_max_call_depth(),
            opstack: vec![0; slots].into_boxed_slice(),
            opstack_top: 0,
            breakpoints: 0,
            data,
            module,
        }
    }

    /// Call the module's entry point with up to [`MAX_VMMAIN_ARGS`] arguments.
    ///
    /// Missing arguments are zero. By convention the first argument selects
    /// what the module should do.
    ///
    /// A misbehaving module fails the call with a [`Trap`] as the error's root
    /// cause; failing syscall handlers fail it with their own error. Either
    /// way the instance stays usable.
    pub fn call(&mut self, args: &[i32]) -> Result<i32> {
        if args.len() > MAX_VMMAIN_ARGS {
            bail!(
                "{} arguments passed to `{}`, at most {MAX_VMMAIN_ARGS} are supported",
                args.len(),
                self.module.name()
            );
        }
        let saved_stack = self.program_stack;
        let saved_depth = self.trace.depth();
        let saved_top = self.opstack_top;
        self.call_level += 1;

        let result = self.run(args).map_err(|e| {
            if e.downcast_ref::<TrapSite>().is_some() {
                e
            } else {
                let site = self.trap_site(None);
                e.context(site)
            }
        });

        self.call_level -= 1;
        self.opstack_top = saved_top;
        self.trace.truncate(saved_depth);
        self.program_stack = saved_stack;
        result
    }

    fn run(&mut self, args: &[i32]) -> Result<i32> {
        #[cfg(feature = "cranelift")]
        if let Backend::Compiled(code) = &self.backend {
            let code = code.clone();
            return code.call(self, args);
        }
        crate::interp::call(self, args)
    }

    /// Build the entry frame for a call with `args` below the current stack
    /// pointer, returning the frame's address.
    pub(crate) fn push_entry_frame(&mut self, args: &[i32]) -> Result<i32, Trap> {
        let ps = self.program_stack - ENTRY_FRAME_SIZE;
        if ps < self.stack_bottom {
            return Err(Trap::StackOverflow);
        }
        self.memory.store4(ps, -1);
        self.memory.store4(ps + 4, 0);
        for i in 0..MAX_VMMAIN_ARGS {
            let arg = args.get(i).copied().unwrap_or(0);
            self.memory.store4(ps + 8 + 4 * i as i32, arg);
        }
        Ok(ps)
    }

    /// Record a call to the procedure at `target`.
    pub(crate) fn enter_call(&mut self, target: i32) -> Result<(), Trap> {
        if self.trace.depth() >= self.max_call_depth {
            return Err(Trap::CallStackExhausted);
        }
        self.trace.push(target);
        Ok(())
    }

    pub(crate) fn leave_call(&mut self) {
        self.trace.pop();
    }

    pub(crate) fn trap_site(&self, pc: Option<usize>) -> TrapSite {
        TrapSite {
            module: self.module.name().to_string(),
            pc,
            frames: self.trace.entries().to_vec(),
        }
    }

    pub(crate) fn set_program_stack(&mut self, ps: i32) {
        self.program_stack = ps;
    }

    pub(crate) fn stack_bottom(&self) -> i32 {
        self.stack_bottom
    }

    pub(crate) fn opstack_mut(&mut self) -> &mut [i32] {
        &mut self.opstack
    }

    pub(crate) fn opstack_top(&self) -> usize {
        self.opstack_top
    }

    pub(crate) fn set_opstack_top(&mut self, top: usize) {
        self.opstack_top = top;
    }

    pub(crate) fn hit_breakpoint(&mut self) {
        self.breakpoints += 1;
    }

    pub(crate) fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// The syscall table this instance was created with.
    pub fn syscalls(&self) -> &Arc<Syscalls<T>> {
        &self.syscalls
    }

    pub(crate) fn memory_view(&mut self) -> MemoryView<'_> {
        let access = if self.is_compiled() {
            HostAccess::Checked
        } else {
            HostAccess::Masked
        };
        MemoryView::new(&mut self.memory, access)
    }

    /// The module this instance runs.
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Name of the module.
    pub fn name(&self) -> &str {
        self.module.name()
    }

    /// The instance's memory.
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Whether the module runs as native code.
    pub fn is_compiled(&self) -> bool {
        !matches!(self.backend, Backend::Interpreted)
    }

    /// The recorded call stack.
    ///
    /// Outside of a call this is empty; during a syscall it shows the
    /// procedures leading up to it.
    pub fn stack_trace(&self) -> &CallTrace {
        &self.trace
    }

    /// Number of calls into this instance currently in progress.
    pub fn call_level(&self) -> usize {
        self.call_level
    }

    /// The current program stack pointer.
    pub fn program_stack(&self) -> i32 {
        self.program_stack
    }

    /// Number of `break` instructions executed so far.
    pub fn breakpoints(&self) -> u64 {
        self.breakpoints
    }

    /// The host data.
    pub fn data(&self) -> &T {
        &self.data
    }

    /// The host data, mutably.
    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    /// Tear down the instance, returning its host data.
    pub fn into_data(self) -> T {
        self.data
    }
}

#[cfg(feature = "cranelift")]
fn compile(module: &Module) -> Backend {
    match crate::jit::CompiledModule::new(module) {
        Ok(code) => {
            log::debug!("{}: compiled to native code", module.name());
            Backend::Compiled(Arc::new(code))
        }
        Err(e) => {
            log::warn!("{}: native compilation failed, interpreting: {e:#}", module.name());
            Backend::Interpreted
        }
    }
}

#[cfg(not(feature = "cranelift"))]
fn compile(_module: &Module) -> Backend {
    Backend::Interpreted
}

impl<T> std::fmt::Debug for Vm<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("module", &self.module.name())
            .field("compiled", &self.is_compiled())
            .field("program_stack", &self.program_stack)
            .field("call_level", &self.call_level)
            .finish_non_exhaustive()
    }
}
