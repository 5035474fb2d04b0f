//! Direct (non-sandboxed) module runtime
//!
//! Used when sandboxing is disabled. Modules get the same host imports as
//! sandboxed ones, but no import gate and no fuel, epoch or memory limits.
//! Compiled modules are cached by path and content digest; a changed file
//! always recompiles.

use crate::error::{PluginError, PluginResult};
use crate::sandbox::{ConsoleLimiter, HostApi, HostState, build_linker, call_func};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;
use wasmtime::{Engine, Instance, Linker, Module, Store, StoreLimits};

struct CachedModule {
    digest: Vec<u8>,
    module: Module,
}

struct DirectInstance {
    store: Store<HostState>,
    instance: Instance,
}

pub(crate) struct DirectRuntime {
    engine: Engine,
    linker: Linker<HostState>,
    max_timer_delay: Duration,
    modules: Mutex<HashMap<PathBuf, CachedModule>>,
    instances: Mutex<HashMap<String, Arc<Mutex<DirectInstance>>>>,
}

impl DirectRuntime {
    pub(crate) fn new(max_timer_delay: Duration) -> PluginResult<Self> {
        let engine = Engine::default();
        let linker = build_linker(&engine)
            .map_err(|e| PluginError::Config(format!("Failed to link host functions: {e}")))?;

        Ok(Self {
            engine,
            linker,
            max_timer_delay,
            modules: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
        })
    }

    /// Instantiate the module at `entry`; returns its export names
    pub(crate) fn load(
        &self,
        plugin_id: &str,
        entry: &Path,
        api: Arc<dyn HostApi>,
    ) -> PluginResult<Vec<String>> {
        let source = std::fs::read(entry).map_err(|e| {
            PluginError::loader(plugin_id, format!("failed to read {}: {e}", entry.display()))
        })?;
        let module = self.compile_cached(plugin_id, entry, &source)?;
        let exports: Vec<String> = module.exports().map(|e| e.name().to_string()).collect();

        let state = HostState::new(
            plugin_id,
            api,
            StoreLimits::default(),
            ConsoleLimiter::unlimited(),
            self.max_timer_delay,
        );
        let mut store = Store::new(&self.engine, state);
        let instance = self
            .linker
            .instantiate(&mut store, &module)
            .map_err(|e| PluginError::loader(plugin_id, format!("{e:#}")))?;

        lock(&self.instances).insert(
            plugin_id.to_string(),
            Arc::new(Mutex::new(DirectInstance { store, instance })),
        );

        debug!(plugin_id, entry = %entry.display(), "Loaded plugin module directly");
        Ok(exports)
    }

    pub(crate) fn invoke(&self, plugin_id: &str, export: &str) -> PluginResult<Option<i32>> {
        let loaded = lock(&self.instances)
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| PluginError::loader(plugin_id, "module is not loaded"))?;

        let mut guard = lock(&loaded);
        let loaded = &mut *guard;
        let func = loaded
            .instance
            .get_func(&mut loaded.store, export)
            .ok_or_else(|| {
                PluginError::loader(plugin_id, format!("export '{export}' is not a function"))
            })?;

        call_func(&mut loaded.store, func)
            .map_err(|e| PluginError::loader(plugin_id, format!("{export} failed: {e:#}")))
    }

    pub(crate) fn release(&self, plugin_id: &str) -> bool {
        lock(&self.instances).remove(plugin_id).is_some()
    }

    pub(crate) fn is_loaded(&self, plugin_id: &str) -> bool {
        lock(&self.instances).contains_key(plugin_id)
    }

    pub(crate) fn cached_modules(&self) -> usize {
        lock(&self.modules).len()
    }

    fn compile_cached(&self, plugin_id: &str, path: &Path, source: &[u8]) -> PluginResult<Module> {
        let digest = Sha256::digest(source).to_vec();
        let mut cache = lock(&self.modules);

        if let Some(cached) = cache.get(path) {
            if cached.digest == digest {
                debug!(plugin_id, path = %path.display(), "Reusing compiled module");
                return Ok(cached.module.clone());
            }
        }
        cache.remove(path);

        let module = Module::new(&self.engine, source)
            .map_err(|e| PluginError::loader(plugin_id, format!("failed to compile: {e:#}")))?;
        cache.insert(
            path.to_path_buf(),
            CachedModule {
                digest,
                module: module.clone(),
            },
        );
        Ok(module)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
