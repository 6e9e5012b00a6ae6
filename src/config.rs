//! Runtime configuration.

use crate::verify::PROGRAM_STACK_SIZE;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Upper bound for [`Config::max_call_depth`].
///
/// Every call level reserves operand-stack space up front, and compiled code
/// nests a few native frames per level on the calling thread's stack.
pub const MAX_CALL_DEPTH: usize = PROGRAM_STACK_SIZE as usize / 16;

/// How module code is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum Strategy {
    /// Compile to native code when this build supports it and fall back to
    /// the interpreter otherwise.
    #[default]
    Auto,
    /// Always interpret.
    Interpreter,
    /// Compile with Cranelift. Requires the `cranelift` feature of this crate;
    /// modules which fail to compile are still interpreted.
    Cranelift,
}

/// Global configuration for module instances.
///
/// Built up with the setter methods, or read from a TOML file:
///
/// ```toml
/// [vm]
/// strategy = "interpreter"
/// call-trace-capacity = 32
/// max-call-depth = 256
/// module-dir = "vm"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case", default)]
pub struct Config {
    strategy: Strategy,
    call_trace_capacity: usize,
    max_call_depth: usize,
    module_dir: PathBuf,
}

// wrapped so the file has a named section
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    vm: Config,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            strategy: Strategy::Auto,
            call_trace_capacity: 32,
            max_call_depth: 1024,
            module_dir: PathBuf::from("vm"),
        }
    }
}

impl Config {
    /// The default configuration.
    pub fn new() -> Config {
        Config::default()
    }

    /// Load configuration from the TOML file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Config::from_toml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Config> {
        let config = toml::from_str::<ConfigFile>(contents)?.vm;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=MAX_CALL_DEPTH).contains(&self.max_call_depth) {
            bail!("max-call-depth must be between 1 and {MAX_CALL_DEPTH}");
        }
        Ok(())
    }

    /// Choose how modules are executed.
    pub fn strategy(&mut self, strategy: Strategy) -> &mut Self {
        self.strategy = strategy;
        self
    }

    /// Number of call-stack entries recorded for diagnostics.
    ///
    /// Deeper calls still run; they are just not recorded.
    pub fn call_trace_capacity(&mut self, capacity: usize) -> &mut Self {
        self.call_trace_capacity = capacity;
        self
    }

    /// Maximum number of nested procedure calls before a call traps with
    /// [`Trap::CallStackExhausted`](crate::Trap::CallStackExhausted).
    ///
    /// Clamped to `1..=`[`MAX_CALL_DEPTH`].
    pub fn max_call_depth(&mut self, depth: usize) -> &mut Self {
        self.max_call_depth = depth.clamp(1, MAX_CALL_DEPTH);
        self
    }

    /// Directory module images are loaded from by a
    /// [`DirectoryLoader`](crate::DirectoryLoader).
    pub fn module_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.module_dir = dir.into();
        self
    }

    #[cfg(test)]
    pub(crate) fn get_strategy(&self) -> Strategy {
        self.strategy
    }

    pub(crate) fn get_call_trace_capacity(&self) -> usize {
        self.call_trace_capacity
    }

    pub(crate) fn get_max_call_depth(&self) -> usize {
        self.max_call_depth
    }

    pub(crate) fn get_module_dir(&self) -> &Path {
        &self.module_dir
    }

    /// Whether instances should try to compile their module.
    pub(crate) fn wants_compiler(&self) -> bool {
        match self.strategy {
            Strategy::Interpreter => false,
            Strategy::Auto => cfg!(feature = "cranelift"),
            Strategy::Cranelift => {
                if !cfg!(feature = "cranelift") {
                    log::warn!(
                        "the cranelift strategy was requested but support for it \
                         is not compiled in; interpreting"
                    );
                }
                cfg!(feature = "cranelift")
            }
        }
    }
}
