//! Static verification of decoded module code.
//!
//! Nothing in a module runs before the verifier has accepted all of it. The
//! verifier proves that:
//!
//! * the operand stack never underflows and stays below a small fixed bound,
//! * code is organized into procedures, each opened by an `enter` and closed
//!   by the `push; leave` sequence compilers emit for the default return,
//! * every static branch lands on a statement boundary (operand-stack depth
//!   zero) inside the procedure it was taken from,
//! * every static call targets the start of a procedure other than the
//!   module entry point,
//! * frame-relative and constant addresses stay inside the frame or the
//!   static data.
//!
//! Addresses computed at runtime are not checked here; the interpreter masks
//! every memory access into the sandbox regardless of what the verifier
//! proved.

use crate::decode::{Instruction, is_static_jump};
use crate::error::{VerifyError, VerifyErrorKind};
use crate::opcode::Opcode;
use std::ops::RangeInclusive;

/// Size of the program stack appended to a module's static data.
///
/// Procedure frames must be smaller than this.
pub const PROGRAM_STACK_SIZE: i32 = 0x10000;

/// Maximum operand-stack depth of a procedure, in 4-byte slots.
pub const MAX_OPSTACK_SLOTS: i32 = 30;

/// Number of argument slots above its own frame a procedure may read through
/// `local; load`.
pub const MAX_PROC_ARGS: i32 = 64;

/// A procedure located by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Procedure {
    /// Index of the `enter` instruction.
    pub start: usize,
    /// Index of the final `leave` instruction.
    pub end: usize,
    /// Frame size in bytes.
    pub frame_size: i32,
    /// Whether the procedure contains a jump with a computed target.
    pub computed_jump: bool,
}

impl Procedure {
    /// The instruction indices belonging to this procedure.
    pub fn range(&self) -> RangeInclusive<usize> {
        self.start..=self.end
    }
}

type Result<T> = core::result::Result<T, VerifyError>;

fn err<T>(index: usize, kind: VerifyErrorKind) -> Result<T> {
    Err(VerifyError::new(index, kind))
}

/// Verify `code` and fill in its jump flags.
///
/// `data_length` is the size of all static data (data, literals and bss)
/// which constant load addresses must stay within. `jump_table` is the
/// compiler-supplied list of computed-jump targets, if any.
///
/// Returns the procedures of the module in code order.
pub fn verify(
    code: &mut [Instruction],
    data_length: u32,
    jump_table: Option<&[i32]>,
) -> Result<Vec<Procedure>> {
    let mut verifier = Verifier {
        code,
        data_length: i64::from(data_length),
        procedures: Vec::new(),
        toplevel_computed_jump: false,
    };
    verifier.check_final_return()?;
    verifier.check_stack_depths()?;
    verifier.check_structure()?;
    verifier.mark_jump_targets(jump_table)?;
    log::debug!(
        "verified {} instructions in {} procedures",
        verifier.code.len(),
        verifier.procedures.len()
    );
    Ok(verifier.procedures)
}

struct Verifier<'a> {
    code: &'a mut [Instruction],
    data_length: i64,
    procedures: Vec<Procedure>,
    toplevel_computed_jump: bool,
}

impl Verifier<'_> {
    fn check_final_return(&self) -> Result<()> {
        match self.code.last() {
            Some(last) if last.op != Opcode::Leave => {
                err(self.code.len() - 1, VerifyErrorKind::MissingFinalReturn)
            }
            _ => Ok(()),
        }
    }

    /// Pass 1: the running depth stays within `[0, MAX_OPSTACK_SLOTS * 4)`.
    fn check_stack_depths(&self) -> Result<()> {
        let limit = MAX_OPSTACK_SLOTS * 4;
        let mut after = 0;
        for (i, inst) in self.code.iter().enumerate() {
            check_depth(i, inst.depth, limit)?;
            after = inst.depth + inst.op.stack_delta();
            check_depth(i, after, limit)?;
        }
        debug_assert!(after >= 0);
        Ok(())
    }

    /// Pass 2: procedure structure, branches, calls and addresses.
    fn check_structure(&mut self) -> Result<()> {
        let mut current: Option<Procedure> = None;

        for i in 0..self.code.len() {
            let inst = self.code[i];
            match inst.op {
                Opcode::Enter => {
                    if current.is_some() {
                        return err(i, VerifyErrorKind::MissingProcEnd);
                    }
                    let Some(end) = self.find_proc_end(i) else {
                        return err(i, VerifyErrorKind::MissingProcEnd);
                    };
                    let frame_size = inst.operand;
                    if inst.depth != 0
                        || !(0..PROGRAM_STACK_SIZE).contains(&frame_size)
                        || frame_size % 4 != 0
                    {
                        return err(i, VerifyErrorKind::BadEntryFrame);
                    }
                    current = Some(Procedure {
                        start: i,
                        end,
                        frame_size,
                        computed_jump: false,
                    });
                }

                Opcode::Leave => {
                    let Some(proc) = current else {
                        return err(i, VerifyErrorKind::MissingProcFrame);
                    };
                    if inst.operand != proc.frame_size {
                        return err(i, VerifyErrorKind::BadReturnFrame);
                    }
                    if inst.depth != 4 {
                        return err(i, VerifyErrorKind::BadOpStackAtReturn);
                    }
                    if i == proc.end {
                        self.procedures.push(proc);
                        current = None;
                    }
                }

                op if op.is_conditional_jump() => {
                    if inst.depth != 8 {
                        return err(i, VerifyErrorKind::BadOpStackAtJump);
                    }
                    self.check_jump_target(i, inst.operand, current.as_ref())?;
                }

                Opcode::Jump => {
                    if is_static_jump(self.code, i) {
                        if inst.operand == i as i32 {
                            return err(i, VerifyErrorKind::SelfLoop);
                        }
                        if inst.depth != 4 {
                            return err(i, VerifyErrorKind::BadOpStackAtJump);
                        }
                        self.check_jump_target(i, inst.operand, current.as_ref())?;
                    } else {
                        if inst.depth != 4 {
                            return err(i, VerifyErrorKind::BadOpStackAtJump);
                        }
                        self.code[i].computed_jump = true;
                        match &mut current {
                            Some(proc) => {
                                proc.computed_jump = true;
                                self.code[proc.start].computed_jump = true;
                            }
                            None => self.toplevel_computed_jump = true,
                        }
                    }
                }

                Opcode::Call => {
                    if inst.depth < 4 {
                        return err(i, VerifyErrorKind::BadOpStackAtCall);
                    }
                    if let Some(target) = self.constant_before(i) {
                        // Negative targets are syscalls, resolved at runtime.
                        if target >= 0 {
                            let target = target as usize;
                            match self.code.get(target) {
                                Some(callee) if callee.op == Opcode::Enter => {}
                                _ => return err(i, VerifyErrorKind::BadCallTarget),
                            }
                            if target == 0 {
                                return err(i, VerifyErrorKind::ExplicitEntryCall);
                            }
                        }
                    }
                }

                Opcode::Arg => {
                    let Some(proc) = current else {
                        return err(i, VerifyErrorKind::MissingProcFrame);
                    };
                    let offset = inst.operand;
                    if offset < 8 || offset > proc.frame_size - 4 || offset % 4 != 0 {
                        return err(i, VerifyErrorKind::BadArgAddress);
                    }
                }

                Opcode::Local => {
                    let Some(proc) = current else {
                        return err(i, VerifyErrorKind::MissingProcFrame);
                    };
                    let next = self.code.get(i + 1).and_then(|n| n.op.load_width());
                    if let Some(width) = next {
                        let addr = i64::from(inst.operand);
                        let limit = i64::from(proc.frame_size) + 8 + 4 * i64::from(MAX_PROC_ARGS);
                        if addr < 0 || addr + i64::from(width) > limit {
                            return err(i, VerifyErrorKind::BadLocalAddress);
                        }
                    }
                }

                Opcode::Load1 | Opcode::Load2 | Opcode::Load4 => {
                    let width = i64::from(inst.op.load_width().unwrap_or(4));
                    if let Some(addr) = self.constant_before(i) {
                        let addr = i64::from(addr);
                        if addr < 0 || addr + width > self.data_length {
                            return err(i, VerifyErrorKind::BadLoadAddress);
                        }
                    }
                }

                _ => {}
            }
        }

        // The final `leave` closes the last procedure, and `enter` refuses to
        // open a procedure without finding its end.
        debug_assert!(current.is_none());
        Ok(())
    }

    /// Find the `leave` of the first `push; leave` pair after `start`.
    fn find_proc_end(&self, start: usize) -> Option<usize> {
        self.code[start + 1..]
            .windows(2)
            .position(|pair| pair[0].op == Opcode::Push && pair[1].op == Opcode::Leave)
            .map(|pos| start + 1 + pos + 1)
    }

    fn constant_before(&self, index: usize) -> Option<i32> {
        let prev = self.code.get(index.checked_sub(1)?)?;
        (prev.op == Opcode::Const).then_some(prev.operand)
    }

    /// Check a static branch from `from` to `target` and mark the target.
    fn check_jump_target(
        &mut self,
        from: usize,
        target: i32,
        proc: Option<&Procedure>,
    ) -> Result<()> {
        let range = match proc {
            Some(proc) => proc.range(),
            None => 0..=self.code.len() - 1,
        };
        let target = match usize::try_from(target) {
            Ok(t) if range.contains(&t) => t,
            _ => return err(from, VerifyErrorKind::JumpOutOfRange),
        };
        let dest = &self.code[target];
        if dest.depth != 0 || dest.op == Opcode::Enter {
            return err(from, VerifyErrorKind::BadJumpTarget);
        }
        self.code[target].jump_used = true;
        Ok(())
    }

    /// Pass 3: mark which instructions computed jumps may land on.
    fn mark_jump_targets(&mut self, jump_table: Option<&[i32]>) -> Result<()> {
        if let Some(targets) = jump_table {
            for &target in targets {
                let index = match usize::try_from(target) {
                    Ok(t) if t < self.code.len() => t,
                    _ => {
                        let last = self.code.len().saturating_sub(1);
                        let index = usize::try_from(target).unwrap_or(0).min(last);
                        return err(index, VerifyErrorKind::JumpOutOfRange);
                    }
                };
                if self.code[index].depth != 0 {
                    return err(index, VerifyErrorKind::BadJumpTarget);
                }
                self.code[index].jump_used = true;
            }
            return Ok(());
        }

        // Without a target list any statement boundary of a procedure with a
        // computed jump may be a `switch` label.
        for proc in self.procedures.iter().filter(|p| p.computed_jump) {
            for inst in &mut self.code[proc.start + 1..=proc.end] {
                if inst.depth == 0 {
                    inst.jump_used = true;
                }
            }
        }
        if self.toplevel_computed_jump {
            let mut next = 0;
            for proc in &self.procedures {
                mark_boundaries(&mut self.code[next..proc.start]);
                next = proc.end + 1;
            }
            mark_boundaries(&mut self.code[next..]);
        }
        Ok(())
    }
}

fn mark_boundaries(code: &mut [Instruction]) {
    for inst in code.iter_mut().filter(|i| i.depth == 0) {
        inst.jump_used = true;
    }
}

fn check_depth(index: usize, depth: i32, limit: i32) -> Result<()> {
    if depth < 0 {
        err(index, VerifyErrorKind::StackUnderflow)
    } else if depth >= limit {
        err(index, VerifyErrorKind::StackOverflow)
    } else {
        Ok(())
    }
}
