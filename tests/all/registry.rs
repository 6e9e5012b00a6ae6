use crate::return_42;
use anyhow::Result;
use qvm::{Config, ImageBuilder, LoadError, Opcode::*, Registry, Syscalls};
use std::sync::Arc;

fn returning(value: i32) -> Vec<u8> {
    let mut b = ImageBuilder::new();
    b.ops(&[(Enter, 8), (Const, value), (Leave, 8), (Push, 0), (Leave, 8)]);
    b.build()
}

#[test]
fn modules_load_from_the_module_dir() -> Result<()> {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("game.qvm"), return_42().build())?;
    std::fs::write(dir.path().join("broken.qvm"), b"not a module")?;

    let mut config = Config::new();
    config.module_dir(dir.path());
    let mut registry = Registry::new(config);
    let syscalls = Arc::new(Syscalls::new());

    let vm = registry.create("game", syscalls.clone(), 1u32)?;
    assert_eq!(vm.name(), "game");
    assert_eq!(vm.call(&[])?, 42);

    assert!(matches!(
        registry.create("missing", syscalls.clone(), 2),
        Err(LoadError::Io { .. })
    ));
    assert!(matches!(
        registry.create("broken", syscalls.clone(), 3),
        Err(LoadError::Header(_))
    ));
    assert!(registry.create_optional("broken", syscalls.clone(), 4).is_none());
    assert_eq!(registry.names().collect::<Vec<_>>(), ["game"]);

    // Restarting picks up a new image and keeps the host data.
    std::fs::write(dir.path().join("game.qvm"), returning(7))?;
    let vm = registry.restart("game")?;
    assert_eq!(vm.call(&[])?, 7);
    assert_eq!(*vm.data(), 1);

    // A broken image does not take the running instance down.
    std::fs::write(dir.path().join("game.qvm"), b"garbage")?;
    assert!(registry.restart("game").is_err());
    assert_eq!(registry.get_mut("game").unwrap().call(&[])?, 7);

    assert_eq!(registry.free("game"), Some(1));
    assert!(registry.get("game").is_none());
    Ok(())
}
