//! Capability-gated plugin contexts
//!
//! A [`PluginContext`] is the only thing plugin code can reach. Its optional
//! sub-APIs (`entities`, `files`, `config`, `ui`) are recomputed from the
//! granted permissions on every change, and each method re-checks its own
//! permission at call time, so revoking a permission takes effect on the
//! next call without rebuilding the context.

mod config;
mod entities;
mod events;
pub(crate) mod files;
mod logger;
mod storage;
mod ui;
pub mod utils;

pub use config::ConfigApi;
pub use entities::EntityApi;
pub use events::PluginEventApi;
pub use files::FileApi;
pub use logger::PluginLogger;
pub use storage::PluginStorage;
pub use ui::{DialogOptions, NotificationOptions, UiApi};

use crate::error::{PluginError, PluginResult};
use crate::events::EventBus;
use crate::permission::{CapabilityGroup, Permission, PermissionSet};
use crate::sandbox::{HostApi, HostRequest};
use crate::services::{ConfigStore, MemoryConfigStore, PluginServices};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// The permission-dependent part of a context
#[derive(Clone, Default)]
pub struct CapabilitySurface {
    pub entities: Option<EntityApi>,
    pub files: Option<FileApi>,
    pub config: Option<ConfigApi>,
    pub ui: Option<UiApi>,
}

impl fmt::Debug for CapabilitySurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySurface")
            .field("entities", &self.entities.is_some())
            .field("files", &self.files.is_some())
            .field("config", &self.config.is_some())
            .field("ui", &self.ui.is_some())
            .finish()
    }
}

pub struct PluginContext {
    plugin_id: String,
    version: String,
    install_path: PathBuf,
    permissions: PermissionSet,
    services: PluginServices,
    config_store: Arc<dyn ConfigStore>,
    surface: RwLock<CapabilitySurface>,
    active: AtomicBool,
    storage: PluginStorage,
    logger: PluginLogger,
    events: PluginEventApi,
}

impl PluginContext {
    pub fn new(
        plugin_id: &str,
        version: &str,
        install_path: &Path,
        granted: impl IntoIterator<Item = Permission>,
        services: PluginServices,
        bus: Arc<EventBus>,
    ) -> Self {
        let permissions = PermissionSet::new(granted);
        let config_store = services
            .config
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryConfigStore::default()));

        let context = Self {
            plugin_id: plugin_id.to_string(),
            version: version.to_string(),
            install_path: install_path.to_path_buf(),
            events: PluginEventApi::new(plugin_id, permissions.clone(), bus),
            permissions,
            services,
            config_store,
            surface: RwLock::new(CapabilitySurface::default()),
            active: AtomicBool::new(false),
            storage: PluginStorage::default(),
            logger: PluginLogger::new(plugin_id),
        };
        context.recompute_surface();
        context
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn install_path(&self) -> &Path {
        &self.install_path
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(permission)
    }

    pub fn permissions(&self) -> Vec<Permission> {
        self.permissions.to_vec()
    }

    pub fn add_permission(&self, permission: Permission) -> bool {
        let added = self.permissions.insert(permission);
        self.recompute_surface();
        added
    }

    pub fn remove_permission(&self, permission: Permission) -> bool {
        let removed = self.permissions.remove(permission);
        self.recompute_surface();
        removed
    }

    pub fn set_permissions(&self, permissions: impl IntoIterator<Item = Permission>) {
        self.permissions.replace(permissions);
        self.recompute_surface();
    }

    /// Snapshot of the current sub-APIs
    pub fn surface(&self) -> CapabilitySurface {
        self.surface.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn entities(&self) -> Option<EntityApi> {
        self.surface().entities
    }

    pub fn files(&self) -> Option<FileApi> {
        self.surface().files
    }

    pub fn config(&self) -> Option<ConfigApi> {
        self.surface().config
    }

    pub fn ui(&self) -> Option<UiApi> {
        self.surface().ui
    }

    pub fn storage(&self) -> &PluginStorage {
        &self.storage
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    pub fn events(&self) -> &PluginEventApi {
        &self.events
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
        self.logger.info("Plugin context activated");
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.logger.info("Plugin context deactivated");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Deactivate and drop every shared-bus subscription
    pub fn dispose(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.events.dispose();
    }

    fn recompute_surface(&self) {
        let id = self.plugin_id.as_str();
        let permissions = &self.permissions;
        let services = &self.services;

        let surface = CapabilitySurface {
            entities: permissions.any_in(CapabilityGroup::Entities).then(|| {
                EntityApi::new(id, permissions.clone(), services.entities.clone())
            }),
            files: permissions.any_in(CapabilityGroup::Files).then(|| {
                FileApi::new(id, &self.install_path, permissions.clone(), services.files.clone())
            }),
            config: permissions.any_in(CapabilityGroup::Config).then(|| {
                ConfigApi::new(id, permissions.clone(), self.config_store.clone())
            }),
            ui: permissions
                .any_in(CapabilityGroup::Ui)
                .then(|| UiApi::new(id, permissions.clone(), services.ui.clone())),
        };

        debug!(plugin_id = id, surface = ?surface, "Recomputed capability surface");
        *self.surface.write().unwrap_or_else(|e| e.into_inner()) = surface;
    }

    fn unavailable(&self, api: &str) -> PluginError {
        PluginError::ApiUnavailable {
            plugin_id: self.plugin_id.clone(),
            api: api.to_string(),
        }
    }

    fn dispatch_entities(&self, method: &str, args: &Value) -> PluginResult<Value> {
        let api = self.entities().ok_or_else(|| self.unavailable("entities"))?;
        match method {
            "getTypes" => Ok(json!(api.get_types()?)),
            "getType" => Ok(json!(api.get_type(str_arg(args, "id")?)?)),
            "getEntities" => Ok(json!(api.get_entities(args.get("query"))?)),
            "getEntity" => Ok(json!(api.get_entity(str_arg(args, "id")?)?)),
            "createEntity" => api.create_entity(value_arg(args, "entity")?),
            "updateEntity" => api.update_entity(str_arg(args, "id")?, value_arg(args, "updates")?),
            "deleteEntity" => Ok(json!(api.delete_entity(str_arg(args, "id")?)?)),
            _ => Err(unknown("entities", method)),
        }
    }

    fn dispatch_files(&self, method: &str, args: &Value) -> PluginResult<Value> {
        let api = self.files().ok_or_else(|| self.unavailable("files"))?;
        let path = str_arg(args, "path")?;
        match method {
            "read" => Ok(json!(api.read(path)?)),
            "write" => {
                api.write(path, str_arg(args, "content")?)?;
                Ok(Value::Null)
            }
            "exists" => Ok(json!(api.exists(path)?)),
            "stat" => Ok(serde_json::to_value(api.stat(path)?)?),
            _ => Err(unknown("files", method)),
        }
    }

    fn dispatch_config(&self, method: &str, args: &Value) -> PluginResult<Value> {
        let api = self.config().ok_or_else(|| self.unavailable("config"))?;
        let key = str_arg(args, "key")?;
        match method {
            "get" => api.get_or(key, args.get("default").cloned().unwrap_or(Value::Null)),
            "set" => {
                api.set(key, value_arg(args, "value")?)?;
                Ok(Value::Null)
            }
            "delete" => {
                api.delete(key)?;
                Ok(Value::Null)
            }
            _ => Err(unknown("config", method)),
        }
    }

    fn dispatch_ui(&self, method: &str, args: Value) -> PluginResult<Value> {
        let api = self.ui().ok_or_else(|| self.unavailable("ui"))?;
        match method {
            "showNotification" => {
                api.show_notification(parse_args(args)?)?;
                Ok(Value::Null)
            }
            "showDialog" => Ok(json!(api.show_dialog(parse_args(args)?)?)),
            "openExternal" => {
                api.open_external(str_arg(&args, "url")?)?;
                Ok(Value::Null)
            }
            _ => Err(unknown("ui", method)),
        }
    }

    fn dispatch_utils(&self, method: &str, args: &Value) -> PluginResult<Value> {
        match method {
            "generateId" => Ok(json!(utils::generate_id())),
            "formatDate" => {
                let date = match args.get("date").and_then(Value::as_str) {
                    Some(raw) => DateTime::parse_from_rfc3339(raw)
                        .map_err(|e| PluginError::InvalidHostCall(format!("date '{raw}': {e}")))?
                        .with_timezone(&Utc),
                    None => Utc::now(),
                };
                let format = args.get("format").and_then(Value::as_str);
                Ok(json!(utils::format_date(date, format)))
            }
            "deepClone" => Ok(utils::deep_clone(args.get("value").unwrap_or(&Value::Null))),
            _ => Err(unknown("utils", method)),
        }
    }

    fn dispatch_storage(&self, method: &str, args: &Value) -> PluginResult<Value> {
        match method {
            "get" => Ok(self.storage.get(str_arg(args, "key")?).unwrap_or(Value::Null)),
            "set" => {
                self.storage.set(str_arg(args, "key")?, value_arg(args, "value")?);
                Ok(Value::Null)
            }
            "delete" => Ok(json!(self.storage.delete(str_arg(args, "key")?))),
            "clear" => {
                self.storage.clear();
                Ok(Value::Null)
            }
            "keys" => Ok(json!(self.storage.keys())),
            _ => Err(unknown("storage", method)),
        }
    }

    fn dispatch_events(&self, method: &str, args: &Value) -> PluginResult<Value> {
        match method {
            "emit" => {
                let payload = args.get("payload").cloned().unwrap_or(Value::Null);
                Ok(json!(self.events.emit(str_arg(args, "topic")?, payload)?))
            }
            "subscribe" => {
                self.events.subscribe_inbox(str_arg(args, "topic")?)?;
                Ok(json!(true))
            }
            "unsubscribe" => Ok(json!(self.events.unsubscribe_inbox(str_arg(args, "topic")?))),
            "poll" => Ok(serde_json::to_value(self.events.drain_inbox())?),
            _ => Err(unknown("events", method)),
        }
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .field("version", &self.version)
            .field("active", &self.is_active())
            .field("permissions", &self.permissions.to_vec())
            .finish()
    }
}

impl HostApi for PluginContext {
    fn dispatch(&self, request: HostRequest) -> PluginResult<Value> {
        let HostRequest { api, method, args } = request;
        let method = method.as_str();
        match api.as_str() {
            "entities" => self.dispatch_entities(method, &args),
            "files" => self.dispatch_files(method, &args),
            "config" => self.dispatch_config(method, &args),
            "ui" => self.dispatch_ui(method, args),
            "utils" => self.dispatch_utils(method, &args),
            "storage" => self.dispatch_storage(method, &args),
            "events" => self.dispatch_events(method, &args),
            "logger" => {
                self.logger.log(method, str_arg(&args, "message")?);
                Ok(Value::Null)
            }
            "context" => Ok(json!({
                "pluginId": self.plugin_id,
                "version": self.version,
                "installPath": self.install_path.display().to_string(),
                "active": self.is_active(),
                "permissions": self.permissions.to_vec(),
            })),
            other => Err(PluginError::InvalidHostCall(format!("unknown API '{other}'"))),
        }
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> PluginResult<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| PluginError::InvalidHostCall(format!("missing string argument '{key}'")))
}

fn value_arg(args: &Value, key: &str) -> PluginResult<Value> {
    args.get(key)
        .cloned()
        .ok_or_else(|| PluginError::InvalidHostCall(format!("missing argument '{key}'")))
}

fn parse_args<T: DeserializeOwned>(args: Value) -> PluginResult<T> {
    serde_json::from_value(args).map_err(|e| PluginError::InvalidHostCall(e.to_string()))
}

fn unknown(api: &str, method: &str) -> PluginError {
    PluginError::InvalidHostCall(format!("unknown method '{api}.{method}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::EntityService;

    struct StaticEntities;

    impl EntityService for StaticEntities {
        fn get_types(&self) -> anyhow::Result<Vec<Value>> {
            Ok(vec![json!({"id": "task"})])
        }
        fn get_type(&self, _id: &str) -> anyhow::Result<Option<Value>> {
            Ok(None)
        }
        fn get_entities(&self, _query: Option<&Value>) -> anyhow::Result<Vec<Value>> {
            Ok(Vec::new())
        }
        fn get_entity(&self, _id: &str) -> anyhow::Result<Option<Value>> {
            Ok(None)
        }
        fn create_entity(&self, entity: Value) -> anyhow::Result<Value> {
            Ok(json!({"id": "e1", "data": entity}))
        }
        fn update_entity(&self, _id: &str, updates: Value) -> anyhow::Result<Value> {
            Ok(updates)
        }
        fn delete_entity(&self, _id: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    fn context(dir: &Path, granted: &[Permission]) -> PluginContext {
        PluginContext::new(
            "notes",
            "1.0.0",
            dir,
            granted.iter().copied(),
            PluginServices::default().with_entities(Arc::new(StaticEntities)),
            Arc::new(EventBus::new()),
        )
    }

    fn call(ctx: &PluginContext, api: &str, method: &str, args: Value) -> PluginResult<Value> {
        ctx.dispatch(HostRequest {
            api: api.into(),
            method: method.into(),
            args,
        })
    }

    #[test]
    fn test_surface_follows_granted_permissions() {
        let ctx = context(Path::new("/plugins/user/notes"), &[Permission::EntitiesCreate]);
        let surface = ctx.surface();
        assert!(surface.entities.is_some());
        assert!(surface.files.is_none());
        assert!(surface.config.is_none());
        assert!(surface.ui.is_none());

        ctx.add_permission(Permission::ConfigRead);
        assert!(ctx.config().is_some());
        ctx.remove_permission(Permission::EntitiesCreate);
        assert!(ctx.entities().is_none());

        ctx.set_permissions([Permission::UiShow]);
        assert!(ctx.ui().is_some());
        assert!(ctx.config().is_none());
    }

    #[test]
    fn test_no_grant_means_no_entities() {
        let ctx = context(Path::new("/plugins/user/notes"), &[]);
        assert!(ctx.entities().is_none());
        assert!(matches!(
            call(&ctx, "entities", "getTypes", Value::Null).unwrap_err(),
            PluginError::ApiUnavailable { .. }
        ));
    }

    #[test]
    fn test_revocation_applies_to_held_api() {
        let ctx = context(
            Path::new("/plugins/user/notes"),
            &[Permission::EntitiesCreate, Permission::EntitiesGetTypes],
        );
        let entities = ctx.entities().expect("entities granted");
        assert!(entities.create_entity(json!({"title": "a"})).is_ok());

        ctx.remove_permission(Permission::EntitiesCreate);
        assert!(matches!(
            entities.create_entity(json!({"title": "b"})).unwrap_err(),
            PluginError::PermissionDenied { permission: Permission::EntitiesCreate, .. }
        ));
        assert!(entities.get_types().is_ok());
    }

    #[test]
    fn test_dispatch_through_host_api() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(
            tmp.path(),
            &[Permission::EntitiesCreate, Permission::FilesOpen, Permission::FilesSave],
        );

        let created = call(&ctx, "entities", "createEntity", json!({"entity": {"n": 1}})).unwrap();
        assert_eq!(created["id"], "e1");

        call(&ctx, "files", "write", json!({"path": "out.txt", "content": "hi"})).unwrap();
        assert_eq!(call(&ctx, "files", "read", json!({"path": "out.txt"})).unwrap(), "hi");
        let escape = call(&ctx, "files", "read", json!({"path": "../../etc/passwd"})).unwrap_err();
        assert!(matches!(escape, PluginError::PathEscape { .. }));

        call(&ctx, "storage", "set", json!({"key": "k", "value": [1, 2]})).unwrap();
        assert_eq!(call(&ctx, "storage", "keys", Value::Null).unwrap(), json!(["k"]));

        let id = call(&ctx, "utils", "generateId", Value::Null).unwrap();
        assert!(id.as_str().unwrap().starts_with("id_"));

        let info = call(&ctx, "context", "info", Value::Null).unwrap();
        assert_eq!(info["pluginId"], "notes");
    }

    #[test]
    fn test_malformed_calls() {
        let ctx = context(Path::new("/plugins/user/notes"), &[Permission::FilesOpen]);
        assert!(matches!(
            call(&ctx, "files", "read", json!({})).unwrap_err(),
            PluginError::InvalidHostCall(_)
        ));
        assert!(matches!(
            call(&ctx, "process", "exit", Value::Null).unwrap_err(),
            PluginError::InvalidHostCall(_)
        ));
    }

    #[test]
    fn test_config_falls_back_to_private_store() {
        let ctx = context(
            Path::new("/plugins/user/notes"),
            &[Permission::ConfigRead, Permission::ConfigWrite],
        );
        call(&ctx, "config", "set", json!({"key": "theme", "value": "dark"})).unwrap();
        assert_eq!(call(&ctx, "config", "get", json!({"key": "theme"})).unwrap(), "dark");
        assert_eq!(
            call(&ctx, "config", "get", json!({"key": "missing", "default": 3})).unwrap(),
            3
        );
    }

    #[test]
    fn test_activation_flag() {
        let ctx = context(Path::new("/plugins/user/notes"), &[]);
        assert!(!ctx.is_active());
        ctx.activate();
        assert!(ctx.is_active());
        ctx.dispose();
        assert!(!ctx.is_active());
    }
}
