//! The `qvm` command line tool.
//!
//! Checks, lists and runs QVM module images. See `qvm --help` for usage.

use anyhow::{Context, Result, bail};
use clap::Parser;
use qvm::{Config, Disassembler, Module, Strategy, Syscalls, Vm};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// QVM module runtime
#[derive(Parser)]
#[command(name = "qvm", version)]
struct Qvm {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Parser)]
enum Subcommand {
    /// Loads and verifies a module image
    Verify(VerifyCommand),
    /// Prints the verified instructions of a module image
    Disas(DisasCommand),
    /// Runs a module's entry point
    Run(RunCommand),
}

/// Loads and verifies a module image.
#[derive(Parser)]
struct VerifyCommand {
    /// The module image.
    file: PathBuf,
}

impl VerifyCommand {
    fn execute(self) -> Result<()> {
        let module = Module::from_file(&self.file)?;
        println!(
            "{}: ok, {} instructions, {} procedures",
            self.file.display(),
            module.instructions().len(),
            module.procedures().len()
        );
        Ok(())
    }
}

/// Prints the verified instructions of a module image.
#[derive(Parser)]
struct DisasCommand {
    /// The module image.
    file: PathBuf,

    /// Leave out operand-stack depths.
    #[arg(long)]
    no_depths: bool,

    /// Leave out the header summary.
    #[arg(long)]
    no_header: bool,
}

impl DisasCommand {
    fn execute(self) -> Result<()> {
        let module = Module::from_file(&self.file)?;
        let text = Disassembler::new(&module)
            .depths(!self.no_depths)
            .header(!self.no_header)
            .disassemble();
        print!("{text}");
        Ok(())
    }
}

/// Runs a module's entry point.
#[derive(Parser)]
struct RunCommand {
    /// The module image.
    file: PathBuf,

    /// Arguments to the entry point; the first is usually a command number.
    #[arg(allow_negative_numbers = true)]
    args: Vec<i32>,

    /// Runtime configuration in TOML.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Always interpret, even when native code is available.
    #[arg(long)]
    interpret: bool,
}

struct Host {
    started: Instant,
}

impl RunCommand {
    fn execute(self) -> Result<()> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::new(),
        };
        if self.interpret {
            config.strategy(Strategy::Interpreter);
        }

        let module = Module::from_file(&self.file)?;
        let mut vm = Vm::new(&config, Arc::new(module), Arc::new(syscalls()?), Host {
            started: Instant::now(),
        });
        let result = vm
            .call(&self.args)
            .with_context(|| format!("failed to run `{}`", self.file.display()))?;
        println!("{result}");
        Ok(())
    }
}

fn syscalls() -> Result<Syscalls<Host>> {
    let mut syscalls = Syscalls::<Host>::new();
    syscalls
        .define(0, "print", 1, |caller, args| {
            let memory = caller.memory();
            let text = memory.c_str(args[0])?;
            print!("{}", String::from_utf8_lossy(text));
            Ok(0)
        })?
        .define(1, "milliseconds", 0, |caller, _| {
            Ok(caller.data().started.elapsed().as_millis() as i32)
        })?
        .define(2, "error", 1, |caller, args| {
            let memory = caller.memory();
            let text = memory.c_str(args[0])?;
            bail!("module error: {}", String::from_utf8_lossy(text))
        })?;
    Ok(syscalls)
}

fn main() -> Result<()> {
    env_logger::init();
    match Qvm::parse().subcommand {
        Subcommand::Verify(c) => c.execute(),
        Subcommand::Disas(c) => c.execute(),
        Subcommand::Run(c) => c.execute(),
    }
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Qvm::command().debug_assert()
}
