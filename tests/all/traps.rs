use crate::{instantiate, strategies};
use anyhow::Result;
use qvm::{Config, ImageBuilder, Module, Opcode::*, Strategy, Syscalls, Trap, TrapSite, Vm};
use std::sync::Arc;

/// `vmMain(n)` recursing `n` levels deep through the procedure at 9, which
/// calls syscall 0 at the bottom and returns its result.
fn recursion() -> ImageBuilder {
    let mut b = ImageBuilder::new();
    b.ops(&[
        (Enter, 16),
        (Local, 24),
        (Load4, 0),
        (Arg, 8),
        (Const, 9),
        (Call, 0),
        (Leave, 16),
        (Push, 0),
        (Leave, 16),
        // 9
        (Enter, 12),
        (Local, 20),
        (Load4, 0),
        (Const, 0),
        (Gti, 17),
        (Const, -1),
        (Call, 0),
        (Leave, 12),
        // 17
        (Local, 20),
        (Load4, 0),
        (Const, 1),
        (Sub, 0),
        (Arg, 8),
        (Const, 9),
        (Call, 0),
        (Leave, 12),
        (Push, 0),
        (Leave, 12),
    ]);
    b
}

/// Records the call depth and the number of recorded trace entries.
fn depth_recorder() -> Syscalls<Vec<(usize, usize)>> {
    let mut syscalls = Syscalls::<Vec<(usize, usize)>>::new();
    syscalls
        .define(0, "record_depth", 0, |caller, _| {
            let trace = caller.stack_trace();
            let sample = (trace.depth(), trace.entries().len());
            caller.data_mut().push(sample);
            Ok(7)
        })
        .unwrap();
    syscalls
}

#[test]
fn trace_is_bounded_under_deep_recursion() -> Result<()> {
    for strategy in strategies() {
        let mut vm = instantiate(&recursion(), strategy, depth_recorder(), Vec::new())?;
        assert_eq!(vm.call(&[100])?, 7);
        // The entry procedure plus 101 levels of the recursive one.
        assert_eq!(vm.data(), &[(102, 32)]);
        assert_eq!(vm.stack_trace().depth(), 0);
        assert!(vm.stack_trace().entries().is_empty());
    }
    Ok(())
}

#[test]
fn call_depth_is_limited() -> Result<()> {
    for strategy in strategies() {
        let module = Arc::new(Module::from_bytes("deep", &recursion().build())?);
        let mut config = Config::new();
        config.strategy(strategy).max_call_depth(50).call_trace_capacity(4);
        let mut vm = Vm::new(&config, module, Arc::new(depth_recorder()), Vec::new());

        assert_eq!(vm.call(&[48])?, 7);
        let err = vm.call(&[49]).unwrap_err();
        assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::CallStackExhausted));
        let site = err.downcast_ref::<TrapSite>().unwrap();
        assert_eq!(site.module, "deep");
        assert_eq!(site.frames, [0, 9, 9, 9]);

        // A trap leaves the instance usable.
        assert_eq!(vm.call(&[3])?, 7);
        assert_eq!(vm.program_stack(), vm.memory().size() as i32);
    }
    Ok(())
}

#[test]
fn program_stack_overflow() -> Result<()> {
    // Two frames of half the program stack each cannot both fit.
    let mut b = ImageBuilder::new();
    b.ops(&[
        (Enter, 0x8000),
        (Const, 6),
        (Call, 0),
        (Leave, 0x8000),
        (Push, 0),
        (Leave, 0x8000),
        (Enter, 0x8000),
        (Const, 1),
        (Leave, 0x8000),
        (Push, 0),
        (Leave, 0x8000),
    ]);
    for strategy in strategies() {
        let mut vm = instantiate(&b, strategy, Syscalls::new(), ())?;
        let err = vm.call(&[]).unwrap_err();
        assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::StackOverflow));
    }
    Ok(())
}

#[test]
fn interpreter_reports_the_trapping_instruction() -> Result<()> {
    let mut b = ImageBuilder::new();
    b.ops(&[
        (Enter, 8),
        (Local, 16),
        (Load4, 0),
        (Const, 0),
        (Divi, 0),
        (Leave, 8),
        (Push, 0),
        (Leave, 8),
    ]);
    let mut vm = instantiate(&b, Strategy::Interpreter, Syscalls::new(), ())?;
    let err = vm.call(&[1]).unwrap_err();
    assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::IntegerDivisionByZero));
    let site = err.downcast_ref::<TrapSite>().unwrap();
    assert_eq!(site.pc, Some(4));
    assert_eq!(site.frames, [0]);
    let message = format!("{err:?}");
    assert!(message.contains("module `test` trapped at instruction 4"), "{message}");
    assert!(message.contains("integer divide by zero"), "{message}");
    Ok(())
}

#[test]
fn bad_call_targets_trap() -> Result<()> {
    // Calls through a computed target that is not a procedure.
    let mut b = ImageBuilder::new();
    b.ops(&[
        (Enter, 8),
        (Local, 16),
        (Load4, 0),
        (Call, 0),
        (Leave, 8),
        (Push, 0),
        (Leave, 8),
        // 7
        (Enter, 8),
        (Const, 5),
        (Leave, 8),
        (Push, 0),
        (Leave, 8),
    ]);
    for strategy in strategies() {
        let mut vm = instantiate(&b, strategy, Syscalls::new(), ())?;
        assert_eq!(vm.call(&[7])?, 5);
        for target in [1, 8, 1000] {
            let err = vm.call(&[target]).unwrap_err();
            assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::BadCallTarget));
        }
    }
    Ok(())
}
