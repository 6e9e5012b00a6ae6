use anyhow::Result;
use qvm::{Config, ImageBuilder, MAX_CALL_DEPTH, Module, Opcode::*, Strategy, Syscalls, Trap, Vm};
use std::sync::Arc;

#[test]
fn from_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("qvm.toml");
    std::fs::write(
        &path,
        r#"
            [vm]
            strategy = "interpreter"
            max-call-depth = 2
        "#,
    )?;
    let config = Config::from_file(&path)?;

    // proc 0 calls proc 6, which calls proc 12: three levels.
    let mut b = ImageBuilder::new();
    b.ops(&[
        (Enter, 8),
        (Const, 6),
        (Call, 0),
        (Leave, 8),
        (Push, 0),
        (Leave, 8),
        (Enter, 8),
        (Const, 12),
        (Call, 0),
        (Leave, 8),
        (Push, 0),
        (Leave, 8),
        (Enter, 8),
        (Const, 3),
        (Leave, 8),
        (Push, 0),
        (Leave, 8),
    ]);
    let module = Arc::new(Module::from_bytes("depth", &b.build())?);
    let mut vm = Vm::new(&config, module, Arc::new(Syscalls::new()), ());
    assert!(!vm.is_compiled());
    let err = vm.call(&[]).unwrap_err();
    assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::CallStackExhausted));
    Ok(())
}

#[test]
fn bad_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qvm.toml");

    std::fs::write(&path, "[vm]\nmax-call-depth = 0\n").unwrap();
    assert!(Config::from_file(&path).is_err());

    std::fs::write(&path, "[vm]\nstack-size = 1\n").unwrap();
    let err = Config::from_file(&path).unwrap_err();
    assert!(format!("{err:?}").contains("stack-size"), "{err:?}");

    std::fs::write(&path, "[vm]\nstrategy = \"fast\"\n").unwrap();
    assert!(Config::from_file(&path).is_err());

    assert!(Config::from_file(dir.path().join("missing.toml")).is_err());
}

#[test]
fn auto_strategy() -> Result<()> {
    let module = Arc::new(Module::from_bytes("auto", &crate::return_42().build())?);
    let mut config = Config::new();
    config.strategy(Strategy::Auto);
    let vm = Vm::new(&config, module, Arc::new(Syscalls::<()>::new()), ());
    assert_eq!(vm.is_compiled(), cfg!(feature = "cranelift"));
    Ok(())
}

#[test]
fn call_depth_is_capped() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("qvm.toml");
    std::fs::write(&path, "[vm]\nmax-call-depth = 18446744073709551615\n")?;
    assert!(Config::from_file(&path).is_err());

    // proc 6 calls itself until the depth limit is hit.
    let mut b = ImageBuilder::new();
    let recurse = [(Enter, 8), (Const, 6), (Call, 0), (Leave, 8), (Push, 0), (Leave, 8)];
    b.ops(&recurse).ops(&recurse);
    let module = Arc::new(Module::from_bytes("endless", &b.build())?);
    for strategy in crate::strategies() {
        let module = module.clone();
        let run = move || {
            let mut config = Config::new();
            config.strategy(strategy).max_call_depth(usize::MAX);
            let mut vm = Vm::new(&config, module, Arc::new(Syscalls::new()), ());
            let err = vm.call(&[]).unwrap_err();
            assert_eq!(err.downcast_ref::<Trap>(), Some(&Trap::CallStackExhausted));
            assert_eq!(vm.call_level(), 0);
            assert_eq!(vm.program_stack(), vm.memory().size() as i32);
        };
        std::thread::Builder::new()
            .stack_size(MAX_CALL_DEPTH * 4096)
            .spawn(run)?
            .join()
            .unwrap();
    }
    Ok(())
}
