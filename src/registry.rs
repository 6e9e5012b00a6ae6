//! Named module instances.

use crate::config::Config;
use crate::error::LoadError;
use crate::module::Module;
use crate::syscall::Syscalls;
use crate::vm::Vm;
use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::path::PathBuf;
use std::sync::Arc;

/// Where module images come from.
pub trait FileLoader {
    /// Read the image of the module called `name`.
    fn load(&self, name: &str) -> Result<Vec<u8>, LoadError>;
}

impl<F> FileLoader for F
where
    F: Fn(&str) -> Result<Vec<u8>, LoadError>,
{
    fn load(&self, name: &str) -> Result<Vec<u8>, LoadError> {
        self(name)
    }
}

/// Loads `<dir>/<name>.qvm`.
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    dir: PathBuf,
}

impl DirectoryLoader {
    /// A loader reading images from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> DirectoryLoader {
        DirectoryLoader { dir: dir.into() }
    }
}

impl FileLoader for DirectoryLoader {
    fn load(&self, name: &str) -> Result<Vec<u8>, LoadError> {
        let path = self.dir.join(format!("{name}.qvm"));
        log::debug!("loading `{name}` from {}", path.display());
        std::fs::read(&path).map_err(|source| LoadError::Io { path, source })
    }
}

fn load(loader: &dyn FileLoader, name: &str) -> Result<Module, LoadError> {
    let image = loader.load(name)?;
    Module::from_bytes(name, &image)
}

/// The set of live module instances, at most one per name.
pub struct Registry<T> {
    config: Config,
    loader: Box<dyn FileLoader>,
    instances: BTreeMap<String, Vm<T>>,
}

impl<T> Registry<T> {
    /// A registry loading modules from the configured module directory.
    pub fn new(config: Config) -> Registry<T> {
        let loader = DirectoryLoader::new(config.get_module_dir());
        Registry::with_loader(config, loader)
    }

    /// A registry loading modules through `loader`.
    pub fn with_loader(config: Config, loader: impl FileLoader + 'static) -> Registry<T> {
        Registry {
            config,
            loader: Box::new(loader),
            instances: BTreeMap::new(),
        }
    }

    /// Create the instance of module `name`.
    ///
    /// If the module is already running the existing instance is returned and
    /// `syscalls` and `data` are dropped.
    pub fn create(
        &mut self,
        name: &str,
        syscalls: Arc<Syscalls<T>>,
        data: T,
    ) -> Result<&mut Vm<T>, LoadError> {
        match self.instances.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                log::debug!("`{name}` is already running");
                Ok(entry.into_mut())
            }
            Entry::Vacant(entry) => {
                let module = load(&*self.loader, name)?;
                let vm = Vm::new(&self.config, Arc::new(module), syscalls, data);
                log::info!(
                    "`{name}` loaded ({})",
                    if vm.is_compiled() { "compiled" } else { "interpreted" }
                );
                Ok(entry.insert(vm))
            }
        }
    }

    /// Like [`Registry::create`], for modules whose absence only disables a
    /// feature: failures are logged and `None` is returned.
    pub fn create_optional(
        &mut self,
        name: &str,
        syscalls: Arc<Syscalls<T>>,
        data: T,
    ) -> Option<&mut Vm<T>> {
        match self.create(name, syscalls, data) {
            Ok(vm) => Some(vm),
            Err(e) => {
                log::warn!("optional module `{name}` not loaded: {:#}", anyhow::Error::new(e));
                None
            }
        }
    }

    /// The instance of module `name`, if it is running.
    pub fn get(&self, name: &str) -> Option<&Vm<T>> {
        self.instances.get(name)
    }

    /// The instance of module `name`, mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Vm<T>> {
        self.instances.get_mut(name)
    }

    /// Names of the running modules.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }

    /// Reload module `name` from its image and replace the running instance
    /// with a fresh one sharing its syscalls and host data.
    ///
    /// If the image no longer loads the old instance keeps running.
    pub fn restart(&mut self, name: &str) -> Result<&mut Vm<T>> {
        let Some(old) = self.instances.remove(name) else {
            bail!("module `{name}` is not running");
        };
        let module = match load(&*self.loader, name) {
            Ok(module) => module,
            Err(e) => {
                self.instances.insert(name.to_string(), old);
                return Err(e).with_context(|| format!("failed to restart `{name}`"));
            }
        };
        let syscalls = Arc::clone(old.syscalls());
        let vm = Vm::new(&self.config, Arc::new(module), syscalls, old.into_data());
        log::info!("`{name}` restarted");
        Ok(self.instances.entry(name.to_string()).or_insert(vm))
    }

    /// Shut down module `name`, returning its host data.
    pub fn free(&mut self, name: &str) -> Option<T> {
        let vm = self.instances.remove(name)?;
        log::debug!("`{name}` freed");
        Some(vm.into_data())
    }

    /// Shut down every module.
    pub fn free_all(&mut self) {
        let names: Vec<String> = self.instances.keys().cloned().collect();
        for name in names {
            self.free(&name);
        }
    }
}
