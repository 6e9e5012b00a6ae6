mod config;
mod loading;
mod memory;
mod registry;
mod syscalls;
mod traps;

use qvm::{Config, ImageBuilder, Module, Opcode::*, Strategy, Syscalls, Vm};
use std::sync::Arc;

/// The smallest complete program: `vmMain` returning 42.
pub(crate) fn return_42() -> ImageBuilder {
    let mut b = ImageBuilder::new();
    b.ops(&[(Enter, 8), (Const, 42), (Leave, 8), (Push, 0), (Leave, 8)]);
    b
}

/// Load the image built by `b` and instantiate it on the given backend.
pub(crate) fn instantiate<T>(
    b: &ImageBuilder,
    strategy: Strategy,
    syscalls: Syscalls<T>,
    data: T,
) -> anyhow::Result<Vm<T>> {
    let _ = env_logger::try_init();
    let module = Module::from_bytes("test", &b.build())?;
    let mut config = Config::new();
    config.strategy(strategy);
    Ok(Vm::new(&config, Arc::new(module), Arc::new(syscalls), data))
}

/// The backends available in this build.
pub(crate) fn strategies() -> Vec<Strategy> {
    let mut strategies = vec![Strategy::Interpreter];
    if cfg!(feature = "cranelift") {
        strategies.push(Strategy::Cranelift);
    }
    strategies
}
