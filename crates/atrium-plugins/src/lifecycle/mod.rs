//! Plugin lifecycle management
//!
//! [`PluginService`] owns the registry of installed plugins and is the single
//! entry point the host uses. Every state change goes through the table in
//! [`state`]; an illegal request is rejected without touching the record.
//!
//! Public lifecycle operations return [`OperationResult`] instead of failing.
//! Admission operations (install, manifest parsing) return errors.
//!
//! Callers must serialise operations on the same plugin id. The registry lock
//! is never held while plugin code runs, so two overlapping operations on one
//! id can interleave; nothing here prevents that.

mod install;
mod permissions;
mod plugin;
mod result;
mod startup;
mod state;
mod updates;

pub use permissions::RuntimeConfigUpdate;
pub use plugin::{Plugin, PluginErrorRecord, PluginInfo};
pub use result::OperationResult;
pub use startup::StartupReport;
pub use state::PluginState;
pub use updates::PluginUpdate;

use crate::context::PluginContext;
use crate::dependency;
use crate::error::{PluginError, PluginResult};
use crate::events::{EventBus, Listener, PluginEvent, SubscriptionId, topics};
use crate::git::GitService;
use crate::loader::{PluginLoader, PluginModule};
use crate::manifest::Manifest;
use crate::sandbox::HostApi;
use crate::services::PluginServices;
use crate::settings::RuntimeSettings;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

const ACTIVATE_HOOK: &str = "activate";
const DEACTIVATE_HOOK: &str = "deactivate";

pub struct PluginService {
    settings: RuntimeSettings,
    loader: Arc<PluginLoader>,
    plugins: RwLock<HashMap<String, Plugin>>,
    services: PluginServices,
    git: Arc<dyn GitService>,
    events: Arc<EventBus>,
    host_subscriptions: Mutex<HashMap<SubscriptionId, String>>,
}

impl PluginService {
    pub fn new(
        settings: RuntimeSettings,
        services: PluginServices,
        git: Arc<dyn GitService>,
    ) -> PluginResult<Self> {
        let loader = Arc::new(PluginLoader::new(&settings)?);
        Ok(Self {
            settings,
            loader,
            plugins: RwLock::new(HashMap::new()),
            services,
            git,
            events: Arc::new(EventBus::new()),
            host_subscriptions: Mutex::new(HashMap::new()),
        })
    }

    /// Share an existing bus instead of the private one
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = bus;
        self
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ==================== Queries ====================

    pub async fn get_plugins(&self) -> Vec<PluginInfo> {
        let plugins = self.plugins.read().await;
        let mut infos: Vec<_> = plugins.values().map(Plugin::info).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn get_plugin(&self, id: &str) -> Option<PluginInfo> {
        self.plugins.read().await.get(id).map(Plugin::info)
    }

    pub async fn get_plugin_state(&self, id: &str) -> PluginResult<PluginState> {
        self.plugins
            .read()
            .await
            .get(id)
            .map(|p| p.state)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    /// Live context of an initialized plugin
    pub async fn plugin_context(&self, id: &str) -> Option<Arc<PluginContext>> {
        self.plugins.read().await.get(id).and_then(|p| p.context.clone())
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.plugins.read().await.contains_key(id)
    }

    // ==================== State machine ====================

    /// Move `id` to `to`, recording or clearing the error record
    async fn transition(&self, id: &str, to: PluginState, failure: Option<&PluginError>) -> OperationResult {
        let outcome = {
            let mut plugins = self.plugins.write().await;
            match plugins.get_mut(id) {
                Some(plugin) => apply_transition(plugin, to, failure),
                None => Err(PluginError::NotFound(id.to_string())),
            }
        };

        match outcome {
            Ok(from) => self.transitioned(id, from, to),
            Err(e) => {
                debug!(plugin_id = id, to = %to, error = %e, "Transition rejected");
                OperationResult::from_error(id, &e)
            }
        }
    }

    fn transitioned(&self, id: &str, from: PluginState, to: PluginState) -> OperationResult {
        debug!(plugin_id = id, from = %from, to = %to, "Plugin state changed");
        self.emit(
            topics::PLUGIN_STATE_CHANGED,
            json!({ "pluginId": id, "oldState": from, "newState": to }),
        );
        OperationResult::ok(id, format!("Plugin state changed from {from} to {to}"))
            .with_data(json!({ "oldState": from, "newState": to }))
    }

    /// Push `id` into ERROR for `e` and return the failure result
    async fn fail(&self, id: &str, e: PluginError) -> OperationResult {
        error!(plugin_id = id, code = e.code(), error = %e, "Plugin operation failed");
        let moved = self.transition(id, PluginState::Error, Some(&e)).await;
        if !moved.success {
            warn!(plugin_id = id, reason = %moved.message, "Could not record plugin error state");
        }
        let (module, context) = self
            .with_plugin_mut(id, Plugin::take_transient)
            .await
            .unwrap_or((None, None));
        self.release(module, context);
        self.emit(
            topics::PLUGIN_ERROR,
            json!({ "pluginId": id, "error": e.to_string(), "code": e.code() }),
        );
        OperationResult::from_error(id, &e)
    }

    fn emit(&self, topic: &str, payload: Value) -> usize {
        self.events.emit(&PluginEvent::new(topic, payload))
    }

    async fn state_or_missing(&self, id: &str) -> Result<PluginState, OperationResult> {
        self.get_plugin_state(id)
            .await
            .map_err(|e| OperationResult::from_error(id, &e))
    }

    fn rejected(id: &str, state: PluginState, action: &str) -> OperationResult {
        OperationResult::failed(
            id,
            format!("Plugin '{id}' cannot be {action} from state {state}"),
        )
    }

    // ==================== Lifecycle operations ====================

    /// UNLOADED -> LOADING -> LOADED
    ///
    /// Fails into ERROR if the install directory is gone or a required
    /// dependency is missing or incompatible.
    pub async fn load_plugin(&self, id: &str) -> OperationResult {
        let loading = self.transition(id, PluginState::Loading, None).await;
        if !loading.success {
            return loading;
        }

        let (install_path, manifest, installed) = {
            let plugins = self.plugins.read().await;
            let Some(plugin) = plugins.get(id) else {
                return OperationResult::not_found(id);
            };
            (
                plugin.install_path.clone(),
                plugin.manifest.clone(),
                installed_manifests(&plugins, Some(id)),
            )
        };

        let checked = async {
            if !tokio::fs::try_exists(&install_path).await.unwrap_or(false) {
                return Err(PluginError::loader(
                    id,
                    format!("install directory not found: {}", install_path.display()),
                ));
            }
            dependency::check_dependencies(&manifest, &installed).into_result(id)
        }
        .await;

        match checked {
            Ok(()) => {
                let loaded = self.transition(id, PluginState::Loaded, None).await;
                if loaded.success {
                    info!(plugin_id = id, "Plugin loaded");
                    self.emit(topics::PLUGIN_LOADED, json!({ "pluginId": id, "manifest": manifest }));
                }
                loaded
            }
            Err(e) => self.fail(id, e).await,
        }
    }

    /// LOADED -> INITIALIZING -> INITIALIZED
    ///
    /// Builds a fresh context from the granted permissions and loads the
    /// entry module with that context as its host API.
    pub async fn init_plugin(&self, id: &str) -> OperationResult {
        match self.state_or_missing(id).await {
            Ok(PluginState::Loaded) => {}
            Ok(state) => return Self::rejected(id, state, "initialized"),
            Err(missing) => return missing,
        }

        let initializing = self.transition(id, PluginState::Initializing, None).await;
        if !initializing.success {
            return initializing;
        }

        let Some((install_path, manifest, granted)) = self
            .with_plugin(id, |p| {
                (
                    p.install_path.clone(),
                    p.manifest.clone(),
                    p.runtime_config.granted_permissions.clone(),
                )
            })
            .await
        else {
            return OperationResult::not_found(id);
        };

        let context = Arc::new(PluginContext::new(
            id,
            &manifest.version,
            &install_path,
            granted,
            self.services.clone(),
            Arc::clone(&self.events),
        ));
        let api: Arc<dyn HostApi> = context.clone();

        let loader = Arc::clone(&self.loader);
        let loaded = run_blocking(id, move || {
            loader.load_plugin_module(&install_path, &manifest, Some(api))
        })
        .await;

        match loaded {
            Ok(module) => {
                let outcome = {
                    let mut plugins = self.plugins.write().await;
                    match plugins.get_mut(id) {
                        Some(plugin) => {
                            plugin.module = Some(module.clone());
                            plugin.context = Some(Arc::clone(&context));
                            apply_transition(plugin, PluginState::Initialized, None)
                        }
                        None => Err(PluginError::NotFound(id.to_string())),
                    }
                };
                match outcome {
                    Ok(from) => {
                        info!(plugin_id = id, exports = module.exports.len(), "Plugin initialized");
                        self.emit(topics::PLUGIN_INITIALIZED, json!({ "pluginId": id }));
                        self.transitioned(id, from, PluginState::Initialized)
                    }
                    Err(e) => {
                        self.loader.release_module(&module);
                        context.dispose();
                        OperationResult::from_error(id, &e)
                    }
                }
            }
            Err(e) => {
                context.dispose();
                self.fail(id, e).await
            }
        }
    }

    /// INITIALIZED | INACTIVE -> ACTIVATING -> ACTIVE
    pub async fn activate_plugin(&self, id: &str) -> OperationResult {
        match self.state_or_missing(id).await {
            Ok(PluginState::Initialized | PluginState::Inactive) => {}
            Ok(state) => return Self::rejected(id, state, "activated"),
            Err(missing) => return missing,
        }

        let activating = self.transition(id, PluginState::Activating, None).await;
        if !activating.success {
            return activating;
        }

        let (module, context) = self.transient(id).await;
        if let Some(context) = &context {
            context.activate();
        }

        match self.run_hook(id, module, ACTIVATE_HOOK).await {
            Ok(()) => {
                let active = self.transition(id, PluginState::Active, None).await;
                if active.success {
                    info!(plugin_id = id, "Plugin activated");
                    self.emit(topics::PLUGIN_ACTIVATED, json!({ "pluginId": id }));
                }
                active
            }
            Err(e) => {
                if let Some(context) = &context {
                    context.deactivate();
                }
                self.fail(id, e).await
            }
        }
    }

    /// ACTIVE -> DEACTIVATING -> INACTIVE
    pub async fn deactivate_plugin(&self, id: &str) -> OperationResult {
        match self.state_or_missing(id).await {
            Ok(PluginState::Active) => {}
            Ok(state) => return Self::rejected(id, state, "deactivated"),
            Err(missing) => return missing,
        }

        let deactivating = self.transition(id, PluginState::Deactivating, None).await;
        if !deactivating.success {
            return deactivating;
        }

        let (module, context) = self.transient(id).await;
        let hook = self.run_hook(id, module, DEACTIVATE_HOOK).await;
        if let Some(context) = &context {
            context.deactivate();
        }

        match hook {
            Ok(()) => {
                let inactive = self.transition(id, PluginState::Inactive, None).await;
                if inactive.success {
                    info!(plugin_id = id, "Plugin deactivated");
                    self.emit(topics::PLUGIN_DEACTIVATED, json!({ "pluginId": id }));
                }
                inactive
            }
            Err(e) => self.fail(id, e).await,
        }
    }

    /// Back to UNLOADED, dropping the module and context
    ///
    /// Allowed from ACTIVE (deactivating first), INACTIVE and INITIALIZED.
    /// Already UNLOADED is a no-op success.
    pub async fn unload_plugin(&self, id: &str) -> OperationResult {
        match self.state_or_missing(id).await {
            Ok(PluginState::Active) => {
                let deactivated = self.deactivate_plugin(id).await;
                if !deactivated.success {
                    warn!(plugin_id = id, reason = %deactivated.message, "Deactivation before unload failed");
                }
            }
            Ok(PluginState::Inactive | PluginState::Initialized) => {}
            Ok(PluginState::Unloaded) => {
                return OperationResult::ok(id, format!("Plugin '{id}' is already unloaded"));
            }
            Ok(state) => return Self::rejected(id, state, "unloaded"),
            Err(missing) => return missing,
        }

        let outcome = {
            let mut plugins = self.plugins.write().await;
            match plugins.get_mut(id) {
                Some(plugin) => apply_transition(plugin, PluginState::Unloaded, None)
                    .map(|from| (from, plugin.take_transient())),
                None => Err(PluginError::NotFound(id.to_string())),
            }
        };

        match outcome {
            Ok((from, (module, context))) => {
                self.release(module, context);
                info!(plugin_id = id, "Plugin unloaded");
                self.transitioned(id, from, PluginState::Unloaded)
            }
            Err(e) => OperationResult::from_error(id, &e),
        }
    }

    /// Deactivate, unload and, if the plugin was enabled, bring it back up
    ///
    /// Stops at the first failing step and leaves the plugin where that step
    /// put it.
    pub async fn reload_plugin(&self, id: &str) -> OperationResult {
        let Some((original_state, was_enabled)) = self.with_plugin(id, |p| (p.state, p.enabled)).await
        else {
            return OperationResult::not_found(id);
        };

        let mut results = Vec::new();
        macro_rules! step {
            ($label:literal, $op:expr) => {{
                let result = $op;
                let success = result.success;
                let message = result.message.clone();
                results.push(result);
                if !success {
                    return OperationResult::failed(id, format!("Failed to {} plugin: {}", $label, message))
                        .with_data(json!({ "results": results }));
                }
            }};
        }

        if original_state == PluginState::Active {
            step!("deactivate", self.deactivate_plugin(id).await);
        }
        if self.get_plugin_state(id).await.ok() != Some(PluginState::Unloaded) {
            step!("unload", self.unload_plugin(id).await);
        }
        if was_enabled {
            step!("load", self.load_plugin(id).await);
            step!("initialize", self.init_plugin(id).await);
            step!("activate", self.activate_plugin(id).await);
        }

        let final_state = self.get_plugin_state(id).await.ok();
        info!(plugin_id = id, "Plugin reloaded");
        OperationResult::ok(id, format!("Plugin '{id}' reloaded")).with_data(json!({
            "results": results,
            "originalState": original_state,
            "finalState": final_state,
        }))
    }

    /// Reload every plugin: deactivate all, unload all, start enabled ones
    pub async fn reload_plugins(&self) -> Vec<OperationResult> {
        let mut results = Vec::new();

        for id in self.ids_where(|p| p.state == PluginState::Active).await {
            results.push(self.deactivate_plugin(&id).await);
        }
        for id in self.ids_where(|p| p.state != PluginState::Unloaded).await {
            results.push(self.unload_plugin(&id).await);
        }
        for id in self.ids_where(|p| p.enabled).await {
            results.extend(self.start_plugin(&id).await);
        }

        results
    }

    /// load -> init -> activate, stopping at the first failure
    pub(crate) async fn start_plugin(&self, id: &str) -> Vec<OperationResult> {
        let mut results = Vec::new();
        for step in 0..3 {
            let result = match step {
                0 => self.load_plugin(id).await,
                1 => self.init_plugin(id).await,
                _ => self.activate_plugin(id).await,
            };
            let success = result.success;
            results.push(result);
            if !success {
                break;
            }
        }
        results
    }

    // ==================== Enable / disable ====================

    /// Persist `enabled = true`, bring the plugin up as far as needed and activate
    pub async fn enable_plugin(&self, id: &str) -> OperationResult {
        if !self.set_enabled(id, true).await {
            return OperationResult::not_found(id);
        }

        let state = match self.state_or_missing(id).await {
            Ok(state) => state,
            Err(missing) => return missing,
        };

        if matches!(state, PluginState::Unloaded | PluginState::Error) {
            let loaded = self.load_plugin(id).await;
            if !loaded.success {
                return loaded;
            }
        }
        if self.get_plugin_state(id).await.ok() == Some(PluginState::Loaded) {
            let initialized = self.init_plugin(id).await;
            if !initialized.success {
                return initialized;
            }
        }
        if self.get_plugin_state(id).await.ok() == Some(PluginState::Active) {
            return OperationResult::ok(id, format!("Plugin '{id}' is enabled"));
        }

        let activated = self.activate_plugin(id).await;
        if activated.success {
            OperationResult::ok(id, format!("Plugin '{id}' is enabled"))
        } else {
            activated
        }
    }

    /// Persist `enabled = false` and deactivate if active
    pub async fn disable_plugin(&self, id: &str) -> OperationResult {
        if !self.set_enabled(id, false).await {
            return OperationResult::not_found(id);
        }

        if self.get_plugin_state(id).await.ok() == Some(PluginState::Active) {
            let deactivated = self.deactivate_plugin(id).await;
            if !deactivated.success {
                return deactivated;
            }
        }
        OperationResult::ok(id, format!("Plugin '{id}' is disabled"))
    }

    pub async fn batch_enable(&self, ids: &[String]) -> Vec<OperationResult> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.enable_plugin(id).await);
        }
        results
    }

    pub async fn batch_disable(&self, ids: &[String]) -> Vec<OperationResult> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.disable_plugin(id).await);
        }
        results
    }

    pub async fn batch_uninstall(&self, ids: &[String]) -> Vec<OperationResult> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.uninstall_plugin(id).await);
        }
        results
    }

    /// Update the in-memory flag, then persist it best-effort
    async fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let found = self
            .with_plugin_mut(id, |p| {
                p.enabled = enabled;
                p.runtime_config.enabled = enabled;
            })
            .await
            .is_some();
        if !found {
            return false;
        }

        let update = RuntimeConfigUpdate {
            enabled: Some(enabled),
            ..RuntimeConfigUpdate::default()
        };
        if let Err(e) = self.save_plugin_runtime_config(id, update).await {
            warn!(plugin_id = id, enabled, error = %e, "Failed to persist enabled flag");
        }
        true
    }

    // ==================== Host event API ====================

    pub fn subscribe_event(&self, topic: &str, listener: Listener) -> SubscriptionId {
        let id = self.events.on(topic, listener);
        self.host_subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, topic.to_string());
        id
    }

    pub fn unsubscribe_event(&self, subscription: SubscriptionId) -> bool {
        let topic = self
            .host_subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&subscription);
        match topic {
            Some(topic) => self.events.off(&topic, subscription),
            None => {
                warn!(%subscription, "Unknown event subscription");
                false
            }
        }
    }

    /// Emit on behalf of the host; the first failing listener aborts delivery
    pub fn emit_event(&self, topic: &str, payload: Value) -> PluginResult<usize> {
        self.events
            .try_emit(&PluginEvent::new(topic, payload))
            .map_err(|e| PluginError::service("Event listener", format!("{e:#}")))
    }

    /// Standard topics followed by every other topic with listeners
    pub fn get_event_list(&self) -> Vec<String> {
        let mut list: Vec<String> = topics::ALL.iter().map(|t| t.to_string()).collect();
        for topic in self.events.topics() {
            if !list.contains(&topic) {
                list.push(topic);
            }
        }
        list
    }

    // ==================== Internals ====================

    async fn with_plugin<T>(&self, id: &str, f: impl FnOnce(&Plugin) -> T) -> Option<T> {
        self.plugins.read().await.get(id).map(f)
    }

    async fn with_plugin_mut<T>(&self, id: &str, f: impl FnOnce(&mut Plugin) -> T) -> Option<T> {
        self.plugins.write().await.get_mut(id).map(f)
    }

    async fn ids_where(&self, predicate: impl Fn(&Plugin) -> bool) -> Vec<String> {
        let plugins = self.plugins.read().await;
        let mut ids: Vec<_> = plugins
            .values()
            .filter(|p| predicate(p))
            .map(|p| p.manifest.id.clone())
            .collect();
        ids.sort();
        ids
    }

    async fn transient(&self, id: &str) -> (Option<PluginModule>, Option<Arc<PluginContext>>) {
        self.with_plugin(id, |p| (p.module.clone(), p.context.clone()))
            .await
            .unwrap_or((None, None))
    }

    async fn run_hook(&self, id: &str, module: Option<PluginModule>, hook: &'static str) -> PluginResult<()> {
        let Some(module) = module else {
            return Err(PluginError::loader(id, "module is not loaded"));
        };
        let loader = Arc::clone(&self.loader);
        let called = run_blocking(id, move || loader.call_hook(&module, hook)).await?;
        debug!(plugin_id = id, hook, called, "Ran lifecycle hook");
        Ok(())
    }

    fn release(&self, module: Option<PluginModule>, context: Option<Arc<PluginContext>>) {
        if let Some(module) = module {
            self.loader.release_module(&module);
        }
        if let Some(context) = context {
            context.dispose();
        }
    }

    async fn installed(&self) -> HashMap<String, Manifest> {
        installed_manifests(&*self.plugins.read().await, None)
    }

    async fn install_path(&self, id: &str) -> Option<PathBuf> {
        self.with_plugin(id, |p| p.install_path.clone()).await
    }
}

/// Validate and apply a transition; returns the previous state
fn apply_transition(
    plugin: &mut Plugin,
    to: PluginState,
    failure: Option<&PluginError>,
) -> PluginResult<PluginState> {
    let from = plugin.state;
    if !from.can_transition(to) {
        return Err(PluginError::TransitionRejected {
            plugin_id: plugin.manifest.id.clone(),
            from,
            to,
        });
    }

    plugin.state = to;
    plugin.error = failure.map(PluginErrorRecord::from_error);
    Ok(from)
}

fn installed_manifests(plugins: &HashMap<String, Plugin>, except: Option<&str>) -> HashMap<String, Manifest> {
    plugins
        .iter()
        .filter(|(id, _)| Some(id.as_str()) != except)
        .map(|(id, p)| (id.clone(), p.manifest.clone()))
        .collect()
}

/// Run sandbox/loader work off the async executor
async fn run_blocking<T, F>(id: &str, f: F) -> PluginResult<T>
where
    F: FnOnce() -> PluginResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PluginError::loader(id, format!("plugin task failed: {e}")))?
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::PluginResult;
    use crate::git::{RepositoryInfo, UpdateStatus};
    use crate::manifest::{MANIFEST_FILE, tests::sample_json};
    use crate::runtime_config::RUNTIME_CONFIG_FILE;
    use crate::settings::{RootSettings, UpdateSettings};
    use async_trait::async_trait;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const MODULE_WAT: &str = r#"(module
      (func (export "activate") (result i32) (i32.const 0))
      (func (export "deactivate") (result i32) (i32.const 0)))"#;

    pub(crate) const FAILING_ACTIVATE_WAT: &str =
        r#"(module (func (export "activate") (result i32) (i32.const 3)))"#;

    pub(crate) const COMMIT: &str = "0123456789abcdef";

    pub(crate) fn manifest_json(id: &str, extra: Value) -> Value {
        let mut value = sample_json();
        value["id"] = id.into();
        value["main"] = "index.wat".into();
        if let Value::Object(extra) = extra {
            for (key, field) in extra {
                value[key.as_str()] = field;
            }
        }
        value
    }

    pub(crate) fn manifest_for(id: &str, extra: Value) -> Manifest {
        serde_json::from_value(manifest_json(id, extra)).unwrap()
    }

    pub(crate) fn write_plugin(dir: &Path, id: &str, extra: Value) {
        write_plugin_wat(dir, id, extra, MODULE_WAT);
    }

    pub(crate) fn write_plugin_wat(dir: &Path, id: &str, extra: Value, wat: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(MANIFEST_FILE), manifest_json(id, extra).to_string()).unwrap();
        fs::write(dir.join("index.wat"), wat).unwrap();
    }

    pub(crate) fn settings(base: &Path) -> RuntimeSettings {
        RuntimeSettings::default()
            .with_roots(RootSettings::under(base.join("roots")))
            .with_updates(UpdateSettings {
                auto_check: false,
                ..UpdateSettings::default()
            })
    }

    pub(crate) fn service(base: &Path) -> PluginService {
        service_with_git(base, Arc::new(StubGit::unavailable()))
    }

    pub(crate) fn service_with_git(base: &Path, git: Arc<dyn GitService>) -> PluginService {
        PluginService::new(settings(base), PluginServices::default(), git).unwrap()
    }

    /// Scripted [`GitService`] that never touches the network
    pub(crate) struct StubGit {
        available: bool,
        clone_plugin: Option<String>,
        temp_root: PathBuf,
        last_temp: Mutex<Option<PathBuf>>,
        status: Mutex<Option<UpdateStatus>>,
        pulls: AtomicUsize,
    }

    impl StubGit {
        fn base(available: bool, clone_plugin: Option<&str>, temp_root: PathBuf) -> Self {
            Self {
                available,
                clone_plugin: clone_plugin.map(str::to_string),
                temp_root,
                last_temp: Mutex::new(None),
                status: Mutex::new(None),
                pulls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn unavailable() -> Self {
            Self::base(false, None, std::env::temp_dir())
        }

        pub(crate) fn cloning(plugin_id: &str, temp_root: PathBuf) -> Self {
            Self::base(true, Some(plugin_id), temp_root)
        }

        pub(crate) fn failing_clone(temp_root: PathBuf) -> Self {
            Self::base(true, None, temp_root)
        }

        pub(crate) fn with_status(self, has_updates: bool) -> Self {
            *self.status.lock().unwrap() = Some(UpdateStatus {
                has_updates,
                local_commit: COMMIT.to_string(),
                remote_commit: if has_updates { "fedcba9876543210" } else { COMMIT }.to_string(),
            });
            self
        }

        pub(crate) fn last_temp_dir(&self) -> Option<PathBuf> {
            self.last_temp.lock().unwrap().clone()
        }

        pub(crate) fn pulls(&self) -> usize {
            self.pulls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GitService for StubGit {
        async fn is_available(&self) -> bool {
            self.available
        }

        async fn clone_shallow(&self, url: &str, target: &Path) -> PluginResult<RepositoryInfo> {
            match &self.clone_plugin {
                Some(id) => {
                    write_plugin(target, id, json!({}));
                    Ok(RepositoryInfo {
                        url: Some(url.to_string()),
                        branch: Some("main".to_string()),
                        commit: COMMIT.to_string(),
                    })
                }
                None => Err(PluginError::Git("remote end hung up unexpectedly".into())),
            }
        }

        async fn check_for_updates(&self, repo: &Path) -> PluginResult<UpdateStatus> {
            self.status
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| PluginError::Git(format!("{} is not a repository", repo.display())))
        }

        async fn pull(&self, repo: &Path) -> PluginResult<bool> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            self.check_for_updates(repo).await.map(|s| s.has_updates)
        }

        async fn repository_info(&self, _repo: &Path) -> PluginResult<RepositoryInfo> {
            Ok(RepositoryInfo {
                url: None,
                branch: Some("main".to_string()),
                commit: COMMIT.to_string(),
            })
        }

        async fn create_temp_dir(&self) -> PluginResult<PathBuf> {
            let dir = self.temp_root.join(format!("clone-{}", uuid::Uuid::new_v4()));
            tokio::fs::create_dir_all(&dir).await?;
            *self.last_temp.lock().unwrap() = Some(dir.clone());
            Ok(dir)
        }
    }

    async fn discovered(base: &Path, plugins: &[(&str, Value, &str)]) -> PluginService {
        for (id, extra, wat) in plugins {
            write_plugin_wat(&base.join("roots/user").join(id), id, extra.clone(), wat);
        }
        let service = service(base);
        service.discover_plugins().await;
        service
    }

    fn state_changes(service: &PluginService) -> Arc<Mutex<Vec<(String, String)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        service.subscribe_event(
            topics::PLUGIN_STATE_CHANGED,
            crate::events::listener(move |event| {
                let pair = (
                    event.payload["oldState"].as_str().unwrap_or_default().to_string(),
                    event.payload["newState"].as_str().unwrap_or_default().to_string(),
                );
                sink.lock().unwrap().push(pair);
                Ok(())
            }),
        );
        seen
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let service = discovered(tmp.path(), &[("alpha", json!({}), MODULE_WAT)]).await;
        let changes = state_changes(&service);

        for (op, expected) in [
            ("load", PluginState::Loaded),
            ("init", PluginState::Initialized),
            ("activate", PluginState::Active),
            ("deactivate", PluginState::Inactive),
            ("activate", PluginState::Active),
            ("unload", PluginState::Unloaded),
        ] {
            let result = match op {
                "load" => service.load_plugin("alpha").await,
                "init" => service.init_plugin("alpha").await,
                "activate" => service.activate_plugin("alpha").await,
                "deactivate" => service.deactivate_plugin("alpha").await,
                _ => service.unload_plugin("alpha").await,
            };
            assert!(result.success, "{op}: {}", result.message);
            assert_eq!(service.get_plugin_state("alpha").await.unwrap(), expected);
        }

        let info = service.get_plugin("alpha").await.unwrap();
        assert!(!info.has_context);
        assert!(info.error.is_none());

        let changes = changes.lock().unwrap();
        assert_eq!(changes.first().unwrap(), &("unloaded".to_string(), "loading".to_string()));
        // unload from active goes through deactivating and inactive
        let tail: Vec<_> = changes[changes.len() - 3..].iter().map(|(_, to)| to.as_str()).collect();
        assert_eq!(tail, vec!["deactivating", "inactive", "unloaded"]);
    }

    #[tokio::test]
    async fn test_context_exists_only_while_initialized() {
        let tmp = tempfile::tempdir().unwrap();
        let service = discovered(tmp.path(), &[("alpha", json!({}), MODULE_WAT)]).await;

        service.load_plugin("alpha").await;
        assert!(service.plugin_context("alpha").await.is_none());
        service.init_plugin("alpha").await;
        let context = service.plugin_context("alpha").await.expect("context");
        assert!(!context.is_active());
        service.activate_plugin("alpha").await;
        assert!(context.is_active());

        service.unload_plugin("alpha").await;
        assert!(!context.is_active());
        assert!(service.plugin_context("alpha").await.is_none());
    }

    #[tokio::test]
    async fn test_illegal_transitions_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let service = discovered(tmp.path(), &[("alpha", json!({}), MODULE_WAT)]).await;

        let result = service.activate_plugin("alpha").await;
        assert!(!result.success);
        assert_eq!(service.get_plugin_state("alpha").await.unwrap(), PluginState::Unloaded);
        assert!(service.get_plugin("alpha").await.unwrap().error.is_none());

        assert!(!service.init_plugin("alpha").await.success);
        assert!(!service.deactivate_plugin("alpha").await.success);

        service.load_plugin("alpha").await;
        let again = service.load_plugin("alpha").await;
        assert!(!again.success);
        assert_eq!(again.error.as_deref(), Some("E541"));
        assert_eq!(service.get_plugin_state("alpha").await.unwrap(), PluginState::Loaded);

        // LOADED is not an unload source
        assert!(!service.unload_plugin("alpha").await.success);
    }

    #[tokio::test]
    async fn test_unload_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let service = discovered(tmp.path(), &[("alpha", json!({}), MODULE_WAT)]).await;
        let changes = state_changes(&service);

        let first = service.unload_plugin("alpha").await;
        let second = service.unload_plugin("alpha").await;
        assert!(first.success && second.success);
        assert!(changes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_plugin() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service(tmp.path());

        for result in [
            service.load_plugin("ghost").await,
            service.activate_plugin("ghost").await,
            service.unload_plugin("ghost").await,
            service.enable_plugin("ghost").await,
            service.reload_plugin("ghost").await,
        ] {
            assert!(!result.success);
            assert_eq!(result.error.as_deref(), Some("E540"));
        }
        assert!(matches!(
            service.get_plugin_state("ghost").await,
            Err(PluginError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_hook_moves_to_error() {
        let tmp = tempfile::tempdir().unwrap();
        let service = discovered(tmp.path(), &[("broken", json!({}), FAILING_ACTIVATE_WAT)]).await;
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        service.subscribe_event(
            topics::PLUGIN_ERROR,
            crate::events::listener(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let result = service.enable_plugin("broken").await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("E520"));

        let info = service.get_plugin("broken").await.unwrap();
        assert_eq!(info.state, PluginState::Error);
        assert!(!info.has_context);
        let record = info.error.expect("error record");
        assert!(record.message.contains("returned status 3"));
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        // a successful retry from ERROR clears the record
        fs::write(tmp.path().join("roots/user/broken/index.wat"), MODULE_WAT).unwrap();
        let retried = service.enable_plugin("broken").await;
        assert!(retried.success, "{}", retried.message);
        assert!(service.get_plugin("broken").await.unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_load_checks_dependencies_and_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let service = discovered(
            tmp.path(),
            &[
                ("base", json!({"version": "1.0.0"}), MODULE_WAT),
                ("needy", json!({"dependencies": [{"pluginId": "base", "version": ">=2.0.0"}]}), MODULE_WAT),
                ("lonely", json!({"dependencies": [{"pluginId": "missing", "version": "*"}]}), MODULE_WAT),
            ],
        )
        .await;

        let needy = service.load_plugin("needy").await;
        assert_eq!(needy.error.as_deref(), Some("E501"));
        assert_eq!(service.get_plugin_state("needy").await.unwrap(), PluginState::Error);
        assert!(service.load_plugin("lonely").await.message.contains("missing"));

        fs::remove_dir_all(tmp.path().join("roots/user/base")).unwrap();
        let base = service.load_plugin("base").await;
        assert!(!base.success);
        assert!(base.message.contains("install directory not found"));
    }

    #[tokio::test]
    async fn test_enable_disable_persist_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let service = discovered(tmp.path(), &[("alpha", json!({}), MODULE_WAT)]).await;
        let config_path = tmp.path().join("roots/user/alpha").join(RUNTIME_CONFIG_FILE);

        assert!(service.enable_plugin("alpha").await.success);
        assert_eq!(service.get_plugin_state("alpha").await.unwrap(), PluginState::Active);
        assert!(fs::read_to_string(&config_path).unwrap().contains("\"enabled\": true"));
        assert!(service.enable_plugin("alpha").await.success);

        assert!(service.disable_plugin("alpha").await.success);
        assert_eq!(service.get_plugin_state("alpha").await.unwrap(), PluginState::Inactive);
        assert!(!service.get_plugin("alpha").await.unwrap().enabled);
        assert!(fs::read_to_string(&config_path).unwrap().contains("\"enabled\": false"));

        let results = service.batch_enable(&["alpha".into(), "ghost".into()]).await;
        assert!(results[0].success);
        assert!(!results[1].success);
    }

    #[tokio::test]
    async fn test_reload_respects_enabled_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let service = discovered(
            tmp.path(),
            &[("alpha", json!({}), MODULE_WAT), ("beta", json!({}), MODULE_WAT)],
        )
        .await;
        service.enable_plugin("alpha").await;
        service.load_plugin("beta").await;
        service.init_plugin("beta").await;

        let alpha = service.reload_plugin("alpha").await;
        assert!(alpha.success, "{}", alpha.message);
        let data = alpha.data.unwrap();
        assert_eq!(data["originalState"], "active");
        assert_eq!(data["finalState"], "active");
        assert_eq!(data["results"].as_array().unwrap().len(), 5);

        let beta = service.reload_plugin("beta").await;
        assert!(beta.success);
        assert_eq!(service.get_plugin_state("beta").await.unwrap(), PluginState::Unloaded);

        let all = service.reload_plugins().await;
        assert!(all.iter().all(|r| r.success));
        assert_eq!(service.get_plugin_state("alpha").await.unwrap(), PluginState::Active);
    }

    #[tokio::test]
    async fn test_reload_stops_at_first_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let service = discovered(tmp.path(), &[("alpha", json!({}), MODULE_WAT)]).await;
        service.enable_plugin("alpha").await;
        fs::write(tmp.path().join("roots/user/alpha/index.wat"), "(module").unwrap();

        let result = service.reload_plugin("alpha").await;
        assert!(!result.success);
        assert!(result.message.starts_with("Failed to initialize plugin"));
        assert_eq!(service.get_plugin_state("alpha").await.unwrap(), PluginState::Error);
    }

    #[tokio::test]
    async fn test_host_event_api() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service(tmp.path());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let id = service.subscribe_event(
            "host:custom",
            crate::events::listener(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        assert_eq!(service.emit_event("host:custom", json!({})).unwrap(), 1);
        assert!(service.get_event_list().contains(&"host:custom".to_string()));
        assert!(service.get_event_list().contains(&topics::APP_READY.to_string()));

        assert!(service.unsubscribe_event(id));
        assert!(!service.unsubscribe_event(id));
        assert_eq!(service.emit_event("host:custom", json!({})).unwrap(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        service.subscribe_event(
            "host:fails",
            crate::events::listener(|_| anyhow::bail!("listener exploded")),
        );
        let err = service.emit_event("host:fails", json!({})).unwrap_err();
        assert!(err.to_string().contains("listener exploded"));
    }
}
