//! Native code for verified modules, generated with Cranelift.
//!
//! Every procedure becomes one native function taking the call context and
//! its caller's stack pointer and returning the procedure's result. The
//! verifier's static operand-stack depths let each operand live in an SSA
//! value, so the operand stack is never materialized. Calls of any kind go
//! back into the host through [`call_target`], which keeps the call trace and
//! depth limit in step with the interpreter and dispatches syscalls.
//!
//! Traps do not unwind native frames. The trapping function records a trap
//! code in the context and returns; every caller checks the context after
//! each call and returns in turn.
//!
//! Memory accesses are masked and aligned exactly like
//! [`SandboxAddr`](crate::SandboxAddr) does, with the arena mask baked into
//! the code as a constant.

use crate::decode::Instruction;
use crate::error::{Trap, TrapSite};
use crate::memory::arena_size;
use crate::module::Module;
use crate::opcode::Opcode;
use crate::syscall;
use crate::verify::Procedure;
use crate::vm::Vm;
use anyhow::{Context as _, Result, anyhow, bail};
use core::mem::offset_of;
use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{
    AbiParam, Block, Endianness, InstBuilder, MemFlags, SigRef, Signature, Type, Value, types,
};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Switch};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Module as _, default_libcall_names};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

type ProcFn = unsafe extern "C" fn(*mut JitContext, i32) -> i32;
type CallFn = unsafe extern "C" fn(*mut JitContext, i32, i32) -> i32;
type CopyFn = unsafe extern "C" fn(*mut JitContext, i32, i32, i32);

/// Traps raised by generated code, by code `1 + index`.
const TRAPS: [Trap; 4] = [
    Trap::UndefinedInstruction,
    Trap::StackOverflow,
    Trap::BadJumpTarget,
    Trap::IntegerDivisionByZero,
];

fn trap_code(trap: Trap) -> u32 {
    let index = TRAPS.iter().position(|t| *t == trap).unwrap_or(0);
    index as u32 + 1
}

/// `JitContext::trapped` when the failure is in `JitContext::error` or
/// `JitContext::panic`.
const PENDING: u32 = u32::MAX;

/// State shared between generated code and the host for one call into an
/// instance.
#[repr(C)]
struct JitContext {
    // Read and written by generated code.
    memory: *mut u8,
    call: CallFn,
    block_copy: CopyFn,
    stack_bottom: i32,
    trapped: u32,

    // Host side only.
    vm: *mut (),
    code: *const CompiledModule,
    error: Option<anyhow::Error>,
    panic: Option<Box<dyn Any + Send>>,
    site: Option<TrapSite>,
}

impl JitContext {
    fn fail(&mut self, error: anyhow::Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self.trapped = PENDING;
    }
}

/// The native code of one module.
pub(crate) struct CompiledModule {
    jit: Option<JITModule>,
    /// Entry points by the instruction index of the procedure's `enter`.
    procedures: Vec<Option<ProcFn>>,
}

impl CompiledModule {
    /// Compile every procedure of `module`.
    pub(crate) fn new(module: &Module) -> Result<CompiledModule> {
        let mut flags = settings::builder();
        flags.set("opt_level", "speed")?;
        flags.set("use_colocated_libcalls", "false")?;
        flags.set("is_pic", "false")?;
        let isa = cranelift_native::builder()
            .map_err(|msg| anyhow!("host machine is not supported: {msg}"))?
            .finish(settings::Flags::new(flags))?;
        let mut jit = JITModule::new(JITBuilder::with_isa(isa, default_libcall_names()));

        let ptr = jit.target_config().pointer_type();
        let call_conv = jit.isa().default_call_conv();
        let mut proc_sig = Signature::new(call_conv);
        proc_sig.params.push(AbiParam::new(ptr));
        proc_sig.params.push(AbiParam::new(types::I32));
        proc_sig.returns.push(AbiParam::new(types::I32));

        let mut call_sig = Signature::new(call_conv);
        call_sig.params.push(AbiParam::new(ptr));
        call_sig.params.push(AbiParam::new(types::I32));
        call_sig.params.push(AbiParam::new(types::I32));
        call_sig.returns.push(AbiParam::new(types::I32));

        let mut copy_sig = Signature::new(call_conv);
        copy_sig.params.push(AbiParam::new(ptr));
        for _ in 0..3 {
            copy_sig.params.push(AbiParam::new(types::I32));
        }

        let mask = arena_size(module) - 1;
        let mut ctx = jit.make_context();
        let mut fctx = FunctionBuilderContext::new();
        let mut defined = Vec::with_capacity(module.procedures().len());

        for proc in module.procedures() {
            let id = jit.declare_anonymous_function(&proc_sig)?;
            ctx.func.signature = proc_sig.clone();
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fctx);
            let call_sig = builder.import_signature(call_sig.clone());
            let copy_sig = builder.import_signature(copy_sig.clone());
            Translator::new(builder, module.instructions(), proc, ptr, mask, call_sig, copy_sig)
                .translate()
                .with_context(|| format!("failed to translate procedure {}", proc.start))?;
            jit.define_function(id, &mut ctx)
                .with_context(|| format!("failed to compile procedure {}", proc.start))?;
            jit.clear_context(&mut ctx);
            defined.push((proc.start, id));
        }
        jit.finalize_definitions()?;

        let mut procedures = vec![None; module.instructions().len()];
        for (start, id) in defined {
            let code = jit.get_finalized_function(id);
            // SAFETY: `code` was compiled with `proc_sig`, which is the native
            // signature of `ProcFn`.
            procedures[start] = Some(unsafe { core::mem::transmute::<*const u8, ProcFn>(code) });
        }
        log::trace!("{}: compiled {} procedures", module.name(), module.procedures().len());

        Ok(CompiledModule {
            jit: Some(jit),
            procedures,
        })
    }

    fn procedure(&self, target: i32) -> Option<ProcFn> {
        let index = usize::try_from(target).ok()?;
        self.procedures.get(index).copied().flatten()
    }

    /// Run the module's entry point in `vm` with `args`.
    pub(crate) fn call<T>(&self, vm: &mut Vm<T>, args: &[i32]) -> Result<i32> {
        let ps = vm.push_entry_frame(args)?;
        let mut ctx = JitContext {
            memory: vm.memory_mut().base_ptr(),
            call: call_target::<T>,
            block_copy: block_copy::<T>,
            stack_bottom: vm.stack_bottom(),
            trapped: 0,
            vm: (vm as *mut Vm<T>).cast(),
            code: self,
            error: None,
            panic: None,
            site: None,
        };

        // SAFETY: `ctx` points at `vm` and `self`, both of which outlive the
        // call.
        let value = unsafe { call_target::<T>(&mut ctx, 0, ps) };

        if let Some(payload) = ctx.panic.take() {
            panic::resume_unwind(payload);
        }
        match ctx.trapped {
            0 => Ok(value),
            code => {
                let error = match (ctx.error.take(), TRAPS.get(code as usize - 1)) {
                    (Some(error), _) => error,
                    (None, Some(trap)) => anyhow::Error::new(*trap),
                    (None, None) => anyhow!("native code stopped with unknown trap code {code}"),
                };
                match ctx.site.take() {
                    Some(site) if error.downcast_ref::<TrapSite>().is_none() => {
                        log::debug!("{}: {error}", site.module);
                        Err(error.context(site))
                    }
                    _ => Err(error),
                }
            }
        }
    }
}

impl Drop for CompiledModule {
    fn drop(&mut self) {
        if let Some(jit) = self.jit.take() {
            // SAFETY: the code is only reachable through `self.procedures`.
            unsafe { jit.free_memory() }
        }
    }
}

/// # Safety
///
/// `ctx` must point to a live context whose `vm` is a `Vm<T>`, with no other
/// reference to that instance in use.
unsafe fn vm_mut<'a, T>(ctx: *mut JitContext) -> &'a mut Vm<T> {
    unsafe { &mut *(*ctx).vm.cast::<Vm<T>>() }
}

/// Called from generated code for every `call`, and for the entry point.
///
/// A negative `target` is a syscall, anything else must be the start of a
/// procedure. Failures are stored in `ctx` and reported with a zero result.
unsafe extern "C" fn call_target<T>(ctx: *mut JitContext, target: i32, ps: i32) -> i32 {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe { dispatch::<T>(ctx, target, ps) }));
    // SAFETY: see `vm_mut`; nothing else borrows the context any more.
    let vm = unsafe { vm_mut::<T>(ctx) };
    let cx = unsafe { &mut *ctx };
    // Memory may have been reborrowed by the host in the meantime.
    cx.memory = vm.memory_mut().base_ptr();
    match outcome {
        Ok(Ok(value)) => value,
        Ok(Err(error)) => {
            if cx.site.is_none() {
                cx.site = Some(vm.trap_site(None));
            }
            cx.fail(error);
            0
        }
        Err(payload) => {
            cx.panic = Some(payload);
            cx.trapped = PENDING;
            0
        }
    }
}

unsafe fn dispatch<T>(ctx: *mut JitContext, target: i32, ps: i32) -> Result<i32> {
    if target < 0 {
        let vm = unsafe { vm_mut::<T>(ctx) };
        let id = (-1 - target) as u32;
        vm.set_program_stack(ps - 4);
        vm.memory_mut().store4(ps + 4, id as i32);
        return syscall::dispatch(vm, id, ps);
    }

    let Some(func) = (unsafe { &*(*ctx).code }).procedure(target) else {
        return Err(Trap::BadCallTarget.into());
    };
    unsafe { vm_mut::<T>(ctx) }.enter_call(target)?;
    let value = unsafe { func(ctx, ps) };
    let vm = unsafe { vm_mut::<T>(ctx) };
    let cx = unsafe { &mut *ctx };
    // Remember where the callee trapped before its frame disappears.
    if cx.trapped != 0 && cx.site.is_none() {
        cx.site = Some(vm.trap_site(None));
    }
    vm.leave_call();
    Ok(value)
}

unsafe extern "C" fn block_copy<T>(ctx: *mut JitContext, dest: i32, src: i32, len: i32) {
    let vm = unsafe { vm_mut::<T>(ctx) };
    vm.memory_mut().block_copy(dest, src, len);
    unsafe { (*ctx).memory = vm.memory_mut().base_ptr() };
}

/// Builds the native function of one procedure.
struct Translator<'a> {
    builder: FunctionBuilder<'a>,
    code: &'a [Instruction],
    proc: &'a Procedure,
    ptr: Type,
    mask: u32,
    call_sig: SigRef,
    copy_sig: SigRef,

    ctx: Value,
    ps: Value,
    stack: Vec<Value>,
    /// Blocks by the instruction they start at.
    blocks: HashMap<usize, Block>,
    traps: HashMap<u32, Block>,
    /// Returns without touching the context, after a callee failed.
    bail: Block,
    filled: bool,
}

impl<'a> Translator<'a> {
    fn new(
        mut builder: FunctionBuilder<'a>,
        code: &'a [Instruction],
        proc: &'a Procedure,
        ptr: Type,
        mask: u32,
        call_sig: SigRef,
        copy_sig: SigRef,
    ) -> Translator<'a> {
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);
        let (ctx, caller_ps) = {
            let params = builder.block_params(entry);
            (params[0], params[1])
        };

        // Instructions that can be reached other than by falling through, or
        // that follow an instruction that does not fall through.
        let mut blocks = HashMap::new();
        for i in proc.start + 1..=proc.end {
            let prev = code[i - 1].op;
            if code[i].jump_used
                || prev.is_conditional_jump()
                || matches!(prev, Opcode::Jump | Opcode::Leave)
            {
                blocks.insert(i, builder.create_block());
            }
        }
        let bail = builder.create_block();
        let ps = builder.ins().iadd_imm(caller_ps, -i64::from(proc.frame_size));

        let mut t = Translator {
            builder,
            code,
            proc,
            ptr,
            mask,
            call_sig,
            copy_sig,
            ctx,
            ps,
            stack: Vec::new(),
            blocks,
            traps: HashMap::new(),
            bail,
            filled: false,
        };
        let bottom = t.context_load(types::I32, offset_of!(JitContext, stack_bottom));
        let overflow = t.builder.ins().icmp(IntCC::SignedLessThan, ps, bottom);
        t.trap_if(overflow, Trap::StackOverflow);
        t
    }

    fn translate(mut self) -> Result<()> {
        for i in self.proc.start + 1..=self.proc.end {
            if let Some(&block) = self.blocks.get(&i) {
                if !self.stack.is_empty() {
                    bail!("operands live across the block boundary at {i}");
                }
                if !self.filled {
                    self.builder.ins().jump(block, &[]);
                }
                self.builder.switch_to_block(block);
                self.filled = false;
            }
            self.instruction(i)?;
        }
        if !self.filled {
            bail!("procedure does not end in `leave`");
        }
        self.finish();
        Ok(())
    }

    fn finish(mut self) {
        let mut traps: Vec<(u32, Block)> = self.traps.drain().collect();
        traps.sort_unstable_by_key(|&(code, _)| code);
        for (code, block) in traps {
            self.builder.switch_to_block(block);
            let code = self.builder.ins().iconst(types::I32, i64::from(code));
            self.context_store(code, offset_of!(JitContext, trapped));
            let zero = self.builder.ins().iconst(types::I32, 0);
            self.builder.ins().return_(&[zero]);
        }
        self.builder.switch_to_block(self.bail);
        let zero = self.builder.ins().iconst(types::I32, 0);
        self.builder.ins().return_(&[zero]);

        self.builder.seal_all_blocks();
        self.builder.finalize();
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| anyhow!("operand stack underflow"))
    }

    fn pop_float(&mut self) -> Result<Value> {
        let v = self.pop()?;
        Ok(self.builder.ins().bitcast(types::F32, MemFlags::new(), v))
    }

    fn push_float(&mut self, v: Value) {
        let v = self.builder.ins().bitcast(types::I32, MemFlags::new(), v);
        self.push(v);
    }

    fn block(&self, index: usize) -> Result<Block> {
        self.blocks
            .get(&index)
            .copied()
            .ok_or_else(|| anyhow!("no block starts at {index}"))
    }

    fn context_load(&mut self, ty: Type, offset: usize) -> Value {
        self.builder
            .ins()
            .load(ty, MemFlags::trusted(), self.ctx, offset as i32)
    }

    fn context_store(&mut self, value: Value, offset: usize) {
        self.builder
            .ins()
            .store(MemFlags::trusted(), value, self.ctx, offset as i32);
    }

    fn trap_block(&mut self, trap: Trap) -> Block {
        let builder = &mut self.builder;
        *self
            .traps
            .entry(trap_code(trap))
            .or_insert_with(|| builder.create_block())
    }

    /// Continue in a fresh block, trapping first if `cond` is nonzero.
    fn trap_if(&mut self, cond: Value, trap: Trap) {
        let trap = self.trap_block(trap);
        let next = self.builder.create_block();
        self.builder.ins().brif(cond, trap, &[], next, &[]);
        self.builder.switch_to_block(next);
        self.builder.seal_block(next);
    }

    fn memflags() -> MemFlags {
        MemFlags::trusted().with_endianness(Endianness::Little)
    }

    /// The native address of module address `addr` for a `width`-byte access.
    fn address(&mut self, addr: Value, width: u32) -> Value {
        let mask = self.mask & !(width - 1);
        let offset = self.builder.ins().band_imm(addr, i64::from(mask));
        let offset = if self.ptr == types::I32 {
            offset
        } else {
            self.builder.ins().uextend(self.ptr, offset)
        };
        let base = self.context_load(self.ptr, offset_of!(JitContext, memory));
        self.builder.ins().iadd(base, offset)
    }

    fn condition(&mut self, op: Opcode, a: Value, b: Value) -> Value {
        let int = match op {
            Opcode::Eq => Some(IntCC::Equal),
            Opcode::Ne => Some(IntCC::NotEqual),
            Opcode::Lti => Some(IntCC::SignedLessThan),
            Opcode::Lei => Some(IntCC::SignedLessThanOrEqual),
            Opcode::Gti => Some(IntCC::SignedGreaterThan),
            Opcode::Gei => Some(IntCC::SignedGreaterThanOrEqual),
            Opcode::Ltu => Some(IntCC::UnsignedLessThan),
            Opcode::Leu => Some(IntCC::UnsignedLessThanOrEqual),
            Opcode::Gtu => Some(IntCC::UnsignedGreaterThan),
            Opcode::Geu => Some(IntCC::UnsignedGreaterThanOrEqual),
            _ => None,
        };
        if let Some(cc) = int {
            return self.builder.ins().icmp(cc, a, b);
        }
        let cc = match op {
            Opcode::Eqf => FloatCC::Equal,
            Opcode::Nef => FloatCC::NotEqual,
            Opcode::Ltf => FloatCC::LessThan,
            Opcode::Lef => FloatCC::LessThanOrEqual,
            Opcode::Gtf => FloatCC::GreaterThan,
            _ => FloatCC::GreaterThanOrEqual,
        };
        let a = self.builder.ins().bitcast(types::F32, MemFlags::new(), a);
        let b = self.builder.ins().bitcast(types::F32, MemFlags::new(), b);
        self.builder.ins().fcmp(cc, a, b)
    }

    fn divide(&mut self, op: Opcode) -> Result<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let zero = self.builder.ins().icmp_imm(IntCC::Equal, b, 0);
        self.trap_if(zero, Trap::IntegerDivisionByZero);
        let value = match op {
            Opcode::Divu => self.builder.ins().udiv(a, b),
            Opcode::Modu => self.builder.ins().urem(a, b),
            _ => {
                // `MIN / -1` overflows natively; it wraps here.
                let minus_one = self.builder.ins().icmp_imm(IntCC::Equal, b, -1);
                let one = self.builder.ins().iconst(types::I32, 1);
                let divisor = self.builder.ins().select(minus_one, one, b);
                if op == Opcode::Divi {
                    let quotient = self.builder.ins().sdiv(a, divisor);
                    let negated = self.builder.ins().ineg(a);
                    self.builder.ins().select(minus_one, negated, quotient)
                } else {
                    self.builder.ins().srem(a, divisor)
                }
            }
        };
        self.push(value);
        Ok(())
    }

    fn call(&mut self, index: usize) -> Result<()> {
        let target = self.pop()?;
        let slot = self.address(self.ps, 4);
        let return_pc = self.builder.ins().iconst(types::I32, (index + 1) as i64);
        self.builder.ins().store(Self::memflags(), return_pc, slot, 0);

        let callee = self.context_load(self.ptr, offset_of!(JitContext, call));
        let call = self
            .builder
            .ins()
            .call_indirect(self.call_sig, callee, &[self.ctx, target, self.ps]);
        let result = self.builder.inst_results(call)[0];

        let trapped = self.context_load(types::I32, offset_of!(JitContext, trapped));
        let next = self.builder.create_block();
        self.builder.ins().brif(trapped, self.bail, &[], next, &[]);
        self.builder.switch_to_block(next);
        self.builder.seal_block(next);
        self.push(result);
        Ok(())
    }

    fn computed_jump(&mut self, target: Value) -> Result<()> {
        let mut switch = Switch::new();
        for t in self.proc.start + 1..=self.proc.end {
            if self.code[t].jump_used && self.code[t].op != Opcode::Enter {
                switch.set_entry(t.try_into()?, self.block(t)?);
            }
        }
        let bad = self.trap_block(Trap::BadJumpTarget);
        switch.emit(&mut self.builder, target, bad);
        Ok(())
    }

    fn instruction(&mut self, index: usize) -> Result<()> {
        let inst = self.code[index];
        match inst.op {
            Opcode::Undef => {
                let always = self.builder.ins().iconst(types::I8, 1);
                self.trap_if(always, Trap::UndefinedInstruction);
            }
            Opcode::Ignore | Opcode::Break => {}
            Opcode::Enter => bail!("nested `enter` at {index}"),
            Opcode::Leave => {
                let value = self.pop()?;
                self.builder.ins().return_(&[value]);
                self.filled = true;
            }
            Opcode::Call => self.call(index)?,
            Opcode::Push => {
                let zero = self.builder.ins().iconst(types::I32, 0);
                self.push(zero);
            }
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Const => {
                let v = self.builder.ins().iconst(types::I32, i64::from(inst.operand));
                self.push(v);
            }
            Opcode::Local => {
                let v = self.builder.ins().iadd_imm(self.ps, i64::from(inst.operand));
                self.push(v);
            }
            Opcode::Jump => {
                let target = self.pop()?;
                if inst.computed_jump {
                    self.computed_jump(target)?;
                } else {
                    let block = self.block(inst.operand as usize)?;
                    self.builder.ins().jump(block, &[]);
                }
                self.filled = true;
            }

            Opcode::Eq
            | Opcode::Ne
            | Opcode::Lti
            | Opcode::Lei
            | Opcode::Gti
            | Opcode::Gei
            | Opcode::Ltu
            | Opcode::Leu
            | Opcode::Gtu
            | Opcode::Geu
            | Opcode::Eqf
            | Opcode::Nef
            | Opcode::Ltf
            | Opcode::Lef
            | Opcode::Gtf
            | Opcode::Gef => {
                let b = self.pop()?;
                let a = self.pop()?;
                let cond = self.condition(inst.op, a, b);
                let taken = self.block(inst.operand as usize)?;
                let next = self.block(index + 1)?;
                self.builder.ins().brif(cond, taken, &[], next, &[]);
                self.filled = true;
            }

            Opcode::Load1 | Opcode::Load2 | Opcode::Load4 => {
                let addr = self.pop()?;
                let flags = Self::memflags();
                let v = match inst.op {
                    Opcode::Load1 => {
                        let p = self.address(addr, 1);
                        self.builder.ins().uload8(types::I32, flags, p, 0)
                    }
                    Opcode::Load2 => {
                        let p = self.address(addr, 2);
                        self.builder.ins().uload16(types::I32, flags, p, 0)
                    }
                    _ => {
                        let p = self.address(addr, 4);
                        self.builder.ins().load(types::I32, flags, p, 0)
                    }
                };
                self.push(v);
            }
            Opcode::Store1 | Opcode::Store2 | Opcode::Store4 => {
                let value = self.pop()?;
                let addr = self.pop()?;
                let flags = Self::memflags();
                match inst.op {
                    Opcode::Store1 => {
                        let p = self.address(addr, 1);
                        self.builder.ins().istore8(flags, value, p, 0);
                    }
                    Opcode::Store2 => {
                        let p = self.address(addr, 2);
                        self.builder.ins().istore16(flags, value, p, 0);
                    }
                    _ => {
                        let p = self.address(addr, 4);
                        self.builder.ins().store(flags, value, p, 0);
                    }
                }
            }
            Opcode::Arg => {
                let value = self.pop()?;
                let addr = self.builder.ins().iadd_imm(self.ps, i64::from(inst.operand));
                let p = self.address(addr, 4);
                self.builder.ins().store(Self::memflags(), value, p, 0);
            }
            Opcode::BlockCopy => {
                let src = self.pop()?;
                let dest = self.pop()?;
                let len = self.builder.ins().iconst(types::I32, i64::from(inst.operand));
                let callee = self.context_load(self.ptr, offset_of!(JitContext, block_copy));
                self.builder
                    .ins()
                    .call_indirect(self.copy_sig, callee, &[self.ctx, dest, src, len]);
            }

            Opcode::Sex8 | Opcode::Sex16 => {
                let a = self.pop()?;
                let narrow = if inst.op == Opcode::Sex8 {
                    types::I8
                } else {
                    types::I16
                };
                let v = self.builder.ins().ireduce(narrow, a);
                let v = self.builder.ins().sextend(types::I32, v);
                self.push(v);
            }
            Opcode::Negi | Opcode::Bcom => {
                let a = self.pop()?;
                let v = if inst.op == Opcode::Negi {
                    self.builder.ins().ineg(a)
                } else {
                    self.builder.ins().bnot(a)
                };
                self.push(v);
            }
            Opcode::Divi | Opcode::Divu | Opcode::Modi | Opcode::Modu => self.divide(inst.op)?,
            Opcode::Add
            | Opcode::Sub
            | Opcode::Muli
            | Opcode::Mulu
            | Opcode::Band
            | Opcode::Bor
            | Opcode::Bxor
            | Opcode::Lsh
            | Opcode::Rshi
            | Opcode::Rshu => {
                let b = self.pop()?;
                let a = self.pop()?;
                let ins = self.builder.ins();
                // Shift amounts are taken modulo 32, like `wrapping_shl`.
                let v = match inst.op {
                    Opcode::Add => ins.iadd(a, b),
                    Opcode::Sub => ins.isub(a, b),
                    Opcode::Muli | Opcode::Mulu => ins.imul(a, b),
                    Opcode::Band => ins.band(a, b),
                    Opcode::Bor => ins.bor(a, b),
                    Opcode::Bxor => ins.bxor(a, b),
                    Opcode::Lsh => ins.ishl(a, b),
                    Opcode::Rshi => ins.sshr(a, b),
                    _ => ins.ushr(a, b),
                };
                self.push(v);
            }

            Opcode::Negf => {
                let a = self.pop_float()?;
                let v = self.builder.ins().fneg(a);
                self.push_float(v);
            }
            Opcode::Addf | Opcode::Subf | Opcode::Mulf | Opcode::Divf => {
                let b = self.pop_float()?;
                let a = self.pop_float()?;
                let ins = self.builder.ins();
                let v = match inst.op {
                    Opcode::Addf => ins.fadd(a, b),
                    Opcode::Subf => ins.fsub(a, b),
                    Opcode::Mulf => ins.fmul(a, b),
                    _ => ins.fdiv(a, b),
                };
                self.push_float(v);
            }
            Opcode::Cvif => {
                let a = self.pop()?;
                let v = self.builder.ins().fcvt_from_sint(types::F32, a);
                self.push_float(v);
            }
            Opcode::Cvfi => {
                // Saturating, with NaN going to zero, like `as`.
                let a = self.pop_float()?;
                let v = self.builder.ins().fcvt_to_sint_sat(types::I32, a);
                self.push(v);
            }
        }
        Ok(())
    }
}
