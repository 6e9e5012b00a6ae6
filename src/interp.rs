//! Interpretation of verified module code.
//!
//! The operand stack is a slice shared by all frames of a call (and by nested
//! calls made from syscalls). The verifier bounds each frame's share of it to
//! `MAX_OPSTACK_SLOTS`, and the call depth is bounded by the configuration,
//! which together bound the whole stack. Return addresses live on a shadow
//! stack out of reach of module code; the copy the module writes into its
//! own memory is never read back.

use crate::decode::Instruction;
use crate::error::{Trap, TrapSite};
use crate::module::Module;
use crate::opcode::Opcode;
use crate::syscall;
use crate::vm::Vm;
use anyhow::Result;
use core::ops::ControlFlow;
use std::sync::Arc;

enum Done {
    Return(i32),
    Trap(Trap),
    Host(anyhow::Error),
}

impl From<Trap> for Done {
    fn from(trap: Trap) -> Done {
        Done::Trap(trap)
    }
}

struct Frame {
    return_pc: Option<usize>,
    start: usize,
    end: usize,
}

struct Interpreter<'a, T> {
    vm: &'a mut Vm<T>,
    module: &'a Module,
    code: &'a [Instruction],
    pc: usize,
    ps: i32,
    sp: usize,
    frames: Vec<Frame>,
}

/// Run the module's entry point with `args`.
pub(crate) fn call<T>(vm: &mut Vm<T>, args: &[i32]) -> Result<i32> {
    let module = Arc::clone(vm.module());
    let ps = vm.push_entry_frame(args)?;
    let sp = vm.opstack_top();
    let mut interp = Interpreter {
        vm,
        module: &module,
        code: module.instructions(),
        pc: 0,
        ps,
        sp,
        frames: Vec::new(),
    };

    let done = match interp.call_procedure(0, None) {
        ControlFlow::Continue(()) => interp.run(),
        ControlFlow::Break(done) => done,
    };
    match done {
        Done::Return(value) => Ok(value),
        Done::Trap(trap) => {
            log::debug!("{}: {trap} at instruction {}", module.name(), interp.pc);
            let site = interp.vm.trap_site(Some(interp.pc));
            Err(anyhow::Error::new(trap).context(site))
        }
        // Errors from nested calls already know where they happened.
        Done::Host(e) if e.downcast_ref::<TrapSite>().is_some() => Err(e),
        Done::Host(e) => {
            let site = interp.vm.trap_site(Some(interp.pc));
            Err(e.context(site))
        }
    }
}

impl<T> Interpreter<'_, T> {
    fn run(&mut self) -> Done {
        loop {
            match self.step() {
                ControlFlow::Continue(()) => {}
                ControlFlow::Break(done) => break done,
            }
        }
    }

    #[inline]
    fn push(&mut self, value: i32) {
        self.vm.opstack_mut()[self.sp] = value;
        self.sp += 1;
    }

    #[inline]
    fn pop(&mut self) -> i32 {
        self.sp -= 1;
        self.vm.opstack_mut()[self.sp]
    }

    #[inline]
    fn top(&mut self) -> &mut i32 {
        let sp = self.sp;
        &mut self.vm.opstack_mut()[sp - 1]
    }

    #[inline]
    fn unary(&mut self, f: impl FnOnce(i32) -> i32) {
        let top = self.top();
        *top = f(*top);
    }

    #[inline]
    fn binary(&mut self, f: impl FnOnce(i32, i32) -> i32) {
        let b = self.pop();
        let top = self.top();
        *top = f(*top, b);
    }

    #[inline]
    fn float_unary(&mut self, f: impl FnOnce(f32) -> f32) {
        self.unary(|a| f(f32::from_bits(a as u32)).to_bits() as i32);
    }

    #[inline]
    fn float_binary(&mut self, f: impl FnOnce(f32, f32) -> f32) {
        self.binary(|a, b| f(f32::from_bits(a as u32), f32::from_bits(b as u32)).to_bits() as i32);
    }

    fn checked_binary(&mut self, f: impl FnOnce(i32, i32) -> Option<i32>) -> ControlFlow<Done> {
        let b = self.pop();
        let top = self.top();
        match f(*top, b) {
            Some(value) => {
                *top = value;
                ControlFlow::Continue(())
            }
            None => ControlFlow::Break(Trap::IntegerDivisionByZero.into()),
        }
    }

    /// Pop two operands and branch to `target` if `cond` holds.
    #[inline]
    fn branch(&mut self, target: i32, cond: impl FnOnce(i32, i32) -> bool) -> ControlFlow<Done> {
        let b = self.pop();
        let a = self.pop();
        if cond(a, b) {
            self.pc = target as usize;
        } else {
            self.pc += 1;
        }
        ControlFlow::Continue(())
    }

    #[inline]
    fn branch_float(&mut self, target: i32, cond: impl FnOnce(f32, f32) -> bool) -> ControlFlow<Done> {
        self.branch(target, |a, b| {
            cond(f32::from_bits(a as u32), f32::from_bits(b as u32))
        })
    }

    fn call_procedure(&mut self, target: usize, return_pc: Option<usize>) -> ControlFlow<Done> {
        let Some(proc) = self.module.procedure_at(target) else {
            return ControlFlow::Break(Trap::BadCallTarget.into());
        };
        if let Err(trap) = self.vm.enter_call(target as i32) {
            return ControlFlow::Break(trap.into());
        }
        self.frames.push(Frame {
            return_pc,
            start: proc.start,
            end: proc.end,
        });
        self.pc = target;
        ControlFlow::Continue(())
    }

    fn call(&mut self) -> ControlFlow<Done> {
        let target = *self.top();
        let return_pc = self.pc + 1;
        self.vm.memory_mut().store4(self.ps, return_pc as i32);

        if target >= 0 {
            self.pop();
            return self.call_procedure(target as usize, Some(return_pc));
        }

        let id = (-1 - target) as u32;
        self.vm.set_program_stack(self.ps - 4);
        self.vm.memory_mut().store4(self.ps + 4, id as i32);
        self.vm.set_opstack_top(self.sp);
        match syscall::dispatch(self.vm, id, self.ps) {
            Ok(value) => {
                *self.top() = value;
                self.pc = return_pc;
                ControlFlow::Continue(())
            }
            Err(e) => ControlFlow::Break(Done::Host(e)),
        }
    }

    fn leave(&mut self, frame_size: i32) -> ControlFlow<Done> {
        self.ps += frame_size;
        self.vm.leave_call();
        // The verifier guarantees every `leave` belongs to a frame.
        match self.frames.pop().and_then(|f| f.return_pc) {
            Some(pc) => {
                self.pc = pc;
                ControlFlow::Continue(())
            }
            None => {
                let value = self.pop();
                ControlFlow::Break(Done::Return(value))
            }
        }
    }

    fn computed_jump(&mut self, target: i32) -> ControlFlow<Done> {
        let ok = match (usize::try_from(target), self.frames.last()) {
            (Ok(t), Some(frame)) => {
                (frame.start..=frame.end).contains(&t)
                    && self.code[t].jump_used
                    && self.code[t].op != Opcode::Enter
            }
            _ => false,
        };
        if !ok {
            return ControlFlow::Break(Trap::BadJumpTarget.into());
        }
        self.pc = target as usize;
        ControlFlow::Continue(())
    }

    fn step(&mut self) -> ControlFlow<Done> {
        let inst = self.code[self.pc];
        log::trace!("{:>6} {:>4}: {inst}", self.pc, self.sp);

        match inst.op {
            Opcode::Undef => return ControlFlow::Break(Trap::UndefinedInstruction.into()),
            Opcode::Ignore => {}
            Opcode::Break => self.vm.hit_breakpoint(),

            Opcode::Enter => {
                self.ps -= inst.operand;
                if self.ps < self.vm.stack_bottom() {
                    return ControlFlow::Break(Trap::StackOverflow.into());
                }
            }
            Opcode::Leave => return self.leave(inst.operand),
            Opcode::Call => return self.call(),
            Opcode::Push => self.push(0),
            Opcode::Pop => {
                self.pop();
            }
            Opcode::Const => self.push(inst.operand),
            Opcode::Local => self.push(self.ps.wrapping_add(inst.operand)),
            Opcode::Jump => {
                let target = self.pop();
                if inst.computed_jump {
                    return self.computed_jump(target);
                }
                self.pc = target as usize;
                return ControlFlow::Continue(());
            }

            Opcode::Eq => return self.branch(inst.operand, |a, b| a == b),
            Opcode::Ne => return self.branch(inst.operand, |a, b| a != b),
            Opcode::Lti => return self.branch(inst.operand, |a, b| a < b),
            Opcode::Lei => return self.branch(inst.operand, |a, b| a <= b),
            Opcode::Gti => return self.branch(inst.operand, |a, b| a > b),
            Opcode::Gei => return self.branch(inst.operand, |a, b| a >= b),
            Opcode::Ltu => return self.branch(inst.operand, |a, b| (a as u32) < b as u32),
            Opcode::Leu => return self.branch(inst.operand, |a, b| a as u32 <= b as u32),
            Opcode::Gtu => return self.branch(inst.operand, |a, b| a as u32 > b as u32),
            Opcode::Geu => return self.branch(inst.operand, |a, b| a as u32 >= b as u32),
            Opcode::Eqf => return self.branch_float(inst.operand, |a, b| a == b),
            Opcode::Nef => return self.branch_float(inst.operand, |a, b| a != b),
            Opcode::Ltf => return self.branch_float(inst.operand, |a, b| a < b),
            Opcode::Lef => return self.branch_float(inst.operand, |a, b| a <= b),
            Opcode::Gtf => return self.branch_float(inst.operand, |a, b| a > b),
            Opcode::Gef => return self.branch_float(inst.operand, |a, b| a >= b),

            Opcode::Load1 => {
                let addr = *self.top();
                *self.top() = self.vm.memory().load1(addr);
            }
            Opcode::Load2 => {
                let addr = *self.top();
                *self.top() = self.vm.memory().load2(addr);
            }
            Opcode::Load4 => {
                let addr = *self.top();
                *self.top() = self.vm.memory().load4(addr);
            }
            Opcode::Store1 => {
                let value = self.pop();
                let addr = self.pop();
                self.vm.memory_mut().store1(addr, value);
            }
            Opcode::Store2 => {
                let value = self.pop();
                let addr = self.pop();
                self.vm.memory_mut().store2(addr, value);
            }
            Opcode::Store4 => {
                let value = self.pop();
                let addr = self.pop();
                self.vm.memory_mut().store4(addr, value);
            }
            Opcode::Arg => {
                let value = self.pop();
                let addr = self.ps.wrapping_add(inst.operand);
                self.vm.memory_mut().store4(addr, value);
            }
            Opcode::BlockCopy => {
                let src = self.pop();
                let dest = self.pop();
                self.vm.memory_mut().block_copy(dest, src, inst.operand);
            }

            Opcode::Sex8 => self.unary(|a| i32::from(a as i8)),
            Opcode::Sex16 => self.unary(|a| i32::from(a as i16)),

            Opcode::Negi => self.unary(i32::wrapping_neg),
            Opcode::Add => self.binary(i32::wrapping_add),
            Opcode::Sub => self.binary(i32::wrapping_sub),
            Opcode::Divi => self.checked_binary(|a, b| (b != 0).then(|| a.wrapping_div(b)))?,
            Opcode::Divu => {
                self.checked_binary(|a, b| (a as u32).checked_div(b as u32).map(|v| v as i32))?
            }
            Opcode::Modi => self.checked_binary(|a, b| (b != 0).then(|| a.wrapping_rem(b)))?,
            Opcode::Modu => {
                self.checked_binary(|a, b| (a as u32).checked_rem(b as u32).map(|v| v as i32))?
            }
            Opcode::Muli | Opcode::Mulu => self.binary(i32::wrapping_mul),
            Opcode::Band => self.binary(|a, b| a & b),
            Opcode::Bor => self.binary(|a, b| a | b),
            Opcode::Bxor => self.binary(|a, b| a ^ b),
            Opcode::Bcom => self.unary(|a| !a),
            Opcode::Lsh => self.binary(|a, b| a.wrapping_shl(b as u32)),
            Opcode::Rshi => self.binary(|a, b| a.wrapping_shr(b as u32)),
            Opcode::Rshu => self.binary(|a, b| (a as u32).wrapping_shr(b as u32) as i32),

            Opcode::Negf => self.float_unary(|a| -a),
            Opcode::Addf => self.float_binary(|a, b| a + b),
            Opcode::Subf => self.float_binary(|a, b| a - b),
            Opcode::Divf => self.float_binary(|a, b| a / b),
            Opcode::Mulf => self.float_binary(|a, b| a * b),
            Opcode::Cvif => self.unary(|a| (a as f32).to_bits() as i32),
            Opcode::Cvfi => self.unary(|a| f32::from_bits(a as u32) as i32),
        }

        self.pc += 1;
        ControlFlow::Continue(())
    }
}
