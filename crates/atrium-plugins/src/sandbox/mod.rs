//! WASM sandbox execution via wasmtime
//!
//! Each plugin gets its own [`Store`] holding its capability API, console
//! limiter and memory limits. Modules only see the host imports linked in
//! [`host`]; every other namespace fails at link time, and denylisted ones
//! are refused before compilation output is ever instantiated.
//!
//! Execution is bounded by fuel and by an epoch deadline (module load and
//! ad hoc code/hooks have separate timeouts). This is language-level
//! isolation only: guests share the host process, a host call that blocks
//! is not interrupted, and a runtime bug is a host bug.

mod host;
mod require;
mod ticker;

pub use host::{EmptyHostApi, HostApi, HostRequest};
pub use require::{DEFAULT_FORBIDDEN, ModuleDenylist, SafeRequire};

pub(crate) use host::{ConsoleLimiter, HostState, build_linker, call_func};

use crate::error::{SandboxError, SandboxResult};
use crate::settings::SandboxSettings;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use ticker::{DEFAULT_TICK, EpochTicker};
use tracing::{debug, info};
use wasmtime::{
    Config, Engine, Instance, Linker, Module, Store, StoreLimitsBuilder, Trap,
    WasmBacktraceDetails,
};

/// Export run by [`Sandbox::execute_code`]
pub const ENTRY_EXPORT: &str = "run";

const TABLE_ELEMENTS_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Instantiate,
    Execute,
}

struct SandboxContext {
    store: Store<HostState>,
    instance: Option<Instance>,
}

pub struct Sandbox {
    engine: Engine,
    linker: Linker<HostState>,
    denylist: ModuleDenylist,
    settings: SandboxSettings,
    contexts: Mutex<HashMap<String, Arc<Mutex<SandboxContext>>>>,
    ticker: EpochTicker,
}

impl Sandbox {
    pub fn new(settings: SandboxSettings) -> SandboxResult<Self> {
        if settings.fuel_per_call == 0 {
            return Err(SandboxError::Engine(
                "Fuel limit must be greater than zero".to_string(),
            ));
        }

        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        config.wasm_threads(false);
        config.wasm_backtrace_details(WasmBacktraceDetails::Disable);

        let engine = Engine::new(&config).map_err(|e| {
            SandboxError::Engine(format!("Failed to initialize wasmtime engine: {e}"))
        })?;

        let linker = build_linker(&engine)
            .map_err(|e| SandboxError::Engine(format!("Failed to link host functions: {e}")))?;

        let ticker = EpochTicker::start(engine.clone(), DEFAULT_TICK);

        Ok(Self {
            engine,
            linker,
            denylist: ModuleDenylist::default(),
            settings,
            contexts: Mutex::new(HashMap::new()),
            ticker,
        })
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Create (or replace) the isolated context for `plugin_id`
    pub fn create_context(&self, plugin_id: &str, api: Arc<dyn HostApi>) {
        let limits = StoreLimitsBuilder::new()
            .memory_size(self.settings.memory_limit_bytes)
            .table_elements(TABLE_ELEMENTS_LIMIT)
            .trap_on_grow_failure(true)
            .build();

        let state = HostState::new(
            plugin_id,
            api,
            limits,
            ConsoleLimiter::new(self.settings.console_messages_per_second),
            Duration::from_millis(self.settings.max_timer_delay_ms),
        );

        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);

        let context = Arc::new(Mutex::new(SandboxContext {
            store,
            instance: None,
        }));
        let replaced = self
            .contexts_lock()
            .insert(plugin_id.to_string(), context)
            .is_some();

        debug!(plugin_id, replaced, "Created sandbox context");
    }

    pub fn has_context(&self, plugin_id: &str) -> bool {
        self.contexts_lock().contains_key(plugin_id)
    }

    pub fn context_count(&self) -> usize {
        self.contexts_lock().len()
    }

    /// Import gate for one load, with `extra_allowed` exempted from the denylist
    pub fn create_safe_require(&self, plugin_id: &str, extra_allowed: &[&str]) -> SafeRequire {
        SafeRequire::new(plugin_id, &self.denylist, extra_allowed)
    }

    /// Compile and instantiate a module inside the plugin's context
    ///
    /// Runs the module's start function, if any, under the module-load
    /// timeout. Returns the module's export names.
    pub fn execute_module(
        &self,
        plugin_id: &str,
        source: &[u8],
        filename: &str,
        require: &SafeRequire,
    ) -> SandboxResult<Vec<String>> {
        let context = self.context(plugin_id)?;
        let module = self.compile(plugin_id, source, filename, require)?;
        let exports: Vec<String> = module.exports().map(|e| e.name().to_string()).collect();

        let mut guard = lock(&context);
        let instance = self.budgeted(
            plugin_id,
            &mut guard.store,
            self.settings.module_timeout_ms,
            Phase::Instantiate,
            |store| self.linker.instantiate(store, &module),
        )?;
        guard.instance = Some(instance);

        info!(plugin_id, filename, exports = exports.len(), "Loaded plugin module into sandbox");
        Ok(exports)
    }

    /// Run an ad hoc module in the plugin's context under the execution timeout
    ///
    /// The module's `run` export is called if present and its i32 result returned.
    pub fn execute_code(&self, plugin_id: &str, source: &[u8]) -> SandboxResult<Option<i32>> {
        let context = self.context(plugin_id)?;
        let require = self.create_safe_require(plugin_id, &[]);
        let module = self.compile(plugin_id, source, "<inline>", &require)?;

        let mut guard = lock(&context);
        self.budgeted(
            plugin_id,
            &mut guard.store,
            self.settings.exec_timeout_ms,
            Phase::Execute,
            |store| {
                let instance = self.linker.instantiate(&mut *store, &module)?;
                match instance.get_func(&mut *store, ENTRY_EXPORT) {
                    Some(func) => call_func(store, func),
                    None => Ok(None),
                }
            },
        )
    }

    /// Call a no-argument export of the plugin's loaded module
    pub fn invoke(&self, plugin_id: &str, export: &str) -> SandboxResult<Option<i32>> {
        let context = self.context(plugin_id)?;
        let mut guard = lock(&context);
        let ctx = &mut *guard;

        let instance = ctx.instance.ok_or_else(|| SandboxError::Execution {
            plugin_id: plugin_id.to_string(),
            cause: "no module has been loaded".to_string(),
        })?;
        let func = instance
            .get_func(&mut ctx.store, export)
            .ok_or_else(|| SandboxError::Execution {
                plugin_id: plugin_id.to_string(),
                cause: format!("export '{export}' is not a function"),
            })?;

        self.budgeted(
            plugin_id,
            &mut ctx.store,
            self.settings.exec_timeout_ms,
            Phase::Execute,
            |store| call_func(store, func),
        )
    }

    /// Read `entry`, create a fresh context and load the module into it
    ///
    /// The context is destroyed again if loading fails.
    pub fn load_plugin_module(
        &self,
        plugin_id: &str,
        entry: &Path,
        api: Arc<dyn HostApi>,
    ) -> SandboxResult<Vec<String>> {
        let source = std::fs::read(entry).map_err(|e| SandboxError::Compile {
            plugin_id: plugin_id.to_string(),
            cause: format!("failed to read {}: {e}", entry.display()),
        })?;
        let filename = entry
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("module");

        self.create_context(plugin_id, api);
        let require = self.create_safe_require(plugin_id, &[]);

        self.execute_module(plugin_id, &source, filename, &require)
            .inspect_err(|_| {
                self.destroy_context(plugin_id);
            })
    }

    pub fn destroy_context(&self, plugin_id: &str) -> bool {
        let removed = self.contexts_lock().remove(plugin_id);
        if let Some(context) = &removed {
            let dropped = lock(context).store.data().console.dropped();
            debug!(plugin_id, dropped_console_messages = dropped, "Destroyed sandbox context");
        }
        removed.is_some()
    }

    pub fn destroy_all_contexts(&self) -> usize {
        let drained: Vec<_> = self.contexts_lock().drain().collect();
        debug!(count = drained.len(), "Destroyed all sandbox contexts");
        drained.len()
    }

    pub fn is_module_forbidden(&self, module: &str) -> bool {
        self.denylist.is_forbidden(module)
    }

    pub fn allow_module(&self, module: &str) -> bool {
        self.denylist.allow(module)
    }

    pub fn forbid_module(&self, module: &str) -> bool {
        self.denylist.forbid(module)
    }

    fn context(&self, plugin_id: &str) -> SandboxResult<Arc<Mutex<SandboxContext>>> {
        self.contexts_lock()
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| SandboxError::ContextMissing {
                plugin_id: plugin_id.to_string(),
            })
    }

    fn compile(
        &self,
        plugin_id: &str,
        source: &[u8],
        filename: &str,
        require: &SafeRequire,
    ) -> SandboxResult<Module> {
        let module = Module::new(&self.engine, source).map_err(|e| SandboxError::Compile {
            plugin_id: plugin_id.to_string(),
            cause: format!("{filename}: {e:#}"),
        })?;

        for import in module.imports() {
            require.check(import.module())?;
        }

        Ok(module)
    }

    fn budgeted<R>(
        &self,
        plugin_id: &str,
        store: &mut Store<HostState>,
        timeout_ms: u64,
        phase: Phase,
        run: impl FnOnce(&mut Store<HostState>) -> wasmtime::Result<R>,
    ) -> SandboxResult<R> {
        store
            .set_fuel(self.settings.fuel_per_call)
            .map_err(|e| SandboxError::Engine(format!("Failed to add fuel: {e}")))?;
        store.set_epoch_deadline(self.ticker.ticks_for(Duration::from_millis(timeout_ms)));

        run(store).map_err(|e| classify(plugin_id, timeout_ms, phase, &e))
    }

    fn contexts_lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Mutex<SandboxContext>>>> {
        lock(&self.contexts)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn classify(plugin_id: &str, timeout_ms: u64, phase: Phase, err: &wasmtime::Error) -> SandboxError {
    let plugin_id = plugin_id.to_string();
    match err.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => SandboxError::Timeout {
            plugin_id,
            timeout_ms,
        },
        Some(Trap::OutOfFuel) => SandboxError::Execution {
            plugin_id,
            cause: "execution fuel exhausted".to_string(),
        },
        Some(_) => SandboxError::Execution {
            plugin_id,
            cause: format!("{err:#}"),
        },
        None if phase == Phase::Instantiate => SandboxError::Instantiate {
            plugin_id,
            cause: format!("{err:#}"),
        },
        None => SandboxError::Execution {
            plugin_id,
            cause: format!("{err:#}"),
        },
    }
}
