use crate::{instantiate, strategies};
use anyhow::{Result, bail};
use qvm::{ImageBuilder, MemoryAccessError, Opcode::*, Syscalls, Trap, TrapSite};

#[test]
fn arguments_and_results() -> Result<()> {
    // return sum(40, 2);
    let mut b = ImageBuilder::new();
    b.ops(&[
        (Enter, 16),
        (Const, 40),
        (Arg, 8),
        (Const, 2),
        (Arg, 12),
        (Const, -2),
        (Call, 0),
        (Leave, 16),
        (Push, 0),
        (Leave, 16),
    ]);
    for strategy in strategies() {
        let mut syscalls = Syscalls::<i32>::new();
        syscalls.define(1, "sum", 2, |caller, args| {
            *caller.data_mut() += 1;
            Ok(args[0] + args[1])
        })?;
        let mut vm = instantiate(&b, strategy, syscalls, 0)?;
        assert_eq!(vm.call(&[])?, 42);
        assert_eq!(*vm.data(), 1);
    }
    Ok(())
}

#[test]
fn host_errors_propagate() -> Result<()> {
    let mut b = ImageBuilder::new();
    b.ops(&[(Enter, 8), (Const, -1), (Call, 0), (Leave, 8), (Push, 0), (Leave, 8)]);
    for strategy in strategies() {
        let mut syscalls = Syscalls::<()>::new();
        syscalls.define(0, "fail", 0, |_, _| bail!("host says no"))?;
        let mut vm = instantiate(&b, strategy, syscalls, ())?;
        let err = vm.call(&[]).unwrap_err();
        assert!(err.downcast_ref::<Trap>().is_none());
        assert!(err.downcast_ref::<TrapSite>().is_some());
        assert!(format!("{err:?}").contains("host says no"));
    }
    Ok(())
}

#[test]
fn unknown_syscalls_trap() -> Result<()> {
    let mut b = ImageBuilder::new();
    b.ops(&[(Enter, 8), (Const, -6), (Call, 0), (Leave, 8), (Push, 0), (Leave, 8)]);
    for strategy in strategies() {
        let mut vm = instantiate(&b, strategy, Syscalls::<()>::new(), ())?;
        let err = vm.call(&[]).unwrap_err();
        assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::UnknownSyscall(5)));
    }
    Ok(())
}

#[test]
fn reentrant_calls() -> Result<()> {
    // vmMain(cmd): cmd 0 returns reenter() + 1, anything else returns 41.
    let mut b = ImageBuilder::new();
    b.ops(&[
        (Enter, 8),
        (Local, 16),
        (Load4, 0),
        (Const, 0),
        (Ne, 10),
        (Const, -1),
        (Call, 0),
        (Const, 1),
        (Add, 0),
        (Leave, 8),
        // 10
        (Const, 41),
        (Leave, 8),
        (Push, 0),
        (Leave, 8),
    ]);
    for strategy in strategies() {
        let mut syscalls = Syscalls::<Vec<i32>>::new();
        syscalls.define(0, "reenter", 0, |caller, _| {
            let depth = caller.stack_trace().depth() as i32;
            let value = caller.call(&[1])?;
            caller.data_mut().extend([depth, value]);
            // The nested call is fully unwound.
            assert_eq!(caller.stack_trace().depth() as i32, depth);
            Ok(value)
        })?;
        let mut vm = instantiate(&b, strategy, syscalls, Vec::new())?;
        assert_eq!(vm.call(&[0])?, 42);
        assert_eq!(vm.data(), &[1, 41]);
        assert_eq!(vm.call_level(), 0);
        assert_eq!(vm.program_stack(), vm.memory().size() as i32);
    }
    Ok(())
}

#[test]
fn nested_failures_reach_the_outer_caller() -> Result<()> {
    // vmMain(cmd): cmd 0 calls back in with 1, which divides by zero.
    let mut b = ImageBuilder::new();
    b.ops(&[
        (Enter, 8),
        (Local, 16),
        (Load4, 0),
        (Const, 0),
        (Ne, 8),
        (Const, -1),
        (Call, 0),
        (Leave, 8),
        // 8
        (Const, 1),
        (Const, 0),
        (Divu, 0),
        (Leave, 8),
        (Push, 0),
        (Leave, 8),
    ]);
    for strategy in strategies() {
        let mut syscalls = Syscalls::<()>::new();
        syscalls.define(0, "reenter", 0, |caller, _| caller.call(&[1]))?;
        let mut vm = instantiate(&b, strategy, syscalls, ())?;
        let err = vm.call(&[0]).unwrap_err();
        assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::IntegerDivisionByZero));
        assert_eq!(vm.call_level(), 0);
        let err = vm.call(&[5]).unwrap_err();
        assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::IntegerDivisionByZero));
    }
    Ok(())
}

#[test]
fn handlers_see_module_memory() -> Result<()> {
    // store(0x100); return *(int *)0x100;
    let mut b = ImageBuilder::new();
    b.ops(&[
        (Enter, 12),
        (Const, 0x100),
        (Arg, 8),
        (Const, -1),
        (Call, 0),
        (Pop, 0),
        (Const, 0x100),
        (Load4, 0),
        (Leave, 12),
        (Push, 0),
        (Leave, 12),
    ])
    .lit(b"hello\0")
    .bss(0x200);
    for strategy in strategies() {
        let mut syscalls = Syscalls::<String>::new();
        syscalls
            .define(0, "store", 1, |caller, args| {
                let mut memory = caller.memory();
                memory.write_i32(args[0], 1234)?;
                let greeting = String::from_utf8_lossy(memory.c_str(0)?).into_owned();
                caller.data_mut().push_str(&greeting);
                Ok(0)
            })?;
        let mut vm = instantiate(&b, strategy, syscalls, String::new())?;
        assert_eq!(vm.call(&[])?, 1234);
        assert_eq!(vm.data(), "hello");
    }
    Ok(())
}

#[test]
fn out_of_bounds_host_access_fails_the_call() -> Result<()> {
    let mut b = ImageBuilder::new();
    b.ops(&[(Enter, 8), (Const, -1), (Call, 0), (Leave, 8), (Push, 0), (Leave, 8)]);
    for strategy in strategies() {
        let mut syscalls = Syscalls::<()>::new();
        syscalls.define(0, "oversized", 0, |caller, _| {
            let memory = caller.memory();
            let size = memory.size() as usize;
            memory.slice(0, size + 1)?;
            Ok(0)
        })?;
        let mut vm = instantiate(&b, strategy, syscalls, ())?;
        let err = vm.call(&[]).unwrap_err();
        assert!(err.downcast_ref::<MemoryAccessError>().is_some(), "{err:?}");
    }
    Ok(())
}
