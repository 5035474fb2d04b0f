//! Collaborator interfaces consumed by plugin contexts
//!
//! Plugins reach host functionality only through these traits, and only
//! behind the permission checks in [`crate::context`]. They are synchronous
//! because guest code calls them from inside a running wasm instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Entity/dashboard CRUD owned by the host
pub trait EntityService: Send + Sync {
    fn get_types(&self) -> anyhow::Result<Vec<Value>>;
    fn get_type(&self, id: &str) -> anyhow::Result<Option<Value>>;
    fn get_entities(&self, query: Option<&Value>) -> anyhow::Result<Vec<Value>>;
    fn get_entity(&self, id: &str) -> anyhow::Result<Option<Value>>;
    fn create_entity(&self, entity: Value) -> anyhow::Result<Value>;
    fn update_entity(&self, id: &str, updates: Value) -> anyhow::Result<Value>;
    fn delete_entity(&self, id: &str) -> anyhow::Result<bool>;
}

/// File access; paths arrive already resolved inside the plugin directory
pub trait FileService: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<String>;
    fn write(&self, path: &Path, content: &str) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn stat(&self, path: &Path) -> io::Result<FileStat>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub size: u64,
    pub is_file: bool,
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
}

/// Key/value configuration persistence
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> anyhow::Result<()>;
    fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Notifications and dialogs
pub trait UiService: Send + Sync {
    fn show_notification(&self, notification: &Notification) -> anyhow::Result<()>;
    /// Returns the index of the button the user picked
    fn show_dialog(&self, dialog: &Dialog) -> anyhow::Result<usize>;
    fn open_external(&self, url: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Warning,
    Error,
}

impl NotificationKind {
    /// Map a plugin-supplied type; `success` and unknown types become `info`
    pub fn from_plugin(kind: Option<&str>) -> Self {
        match kind {
            Some("warning") => Self::Warning,
            Some("error") => Self::Error,
            _ => Self::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogKind {
    Info,
    Warning,
    Error,
    Question,
}

impl DialogKind {
    /// `confirm` and `prompt` become questions, `alert` and unknown types info
    pub fn from_plugin(kind: Option<&str>) -> Self {
        match kind {
            Some("confirm") | Some("prompt") => Self::Question,
            Some("warning") => Self::Warning,
            Some("error") => Self::Error,
            _ => Self::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dialog {
    pub title: String,
    pub message: String,
    pub kind: DialogKind,
    pub buttons: Vec<String>,
}

/// [`FileService`] backed by the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileService;

impl FileService for LocalFileService {
    fn read(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write(&self, path: &Path, content: &str) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let metadata = std::fs::metadata(path)?;
        Ok(FileStat {
            size: metadata.len(),
            is_file: metadata.is_file(),
            is_dir: metadata.is_dir(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

/// [`ConfigStore`] kept in memory, used when the host supplies none
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: RwLock<HashMap<String, Value>>,
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }
}

/// The set of collaborators handed to every plugin context
#[derive(Clone)]
pub struct PluginServices {
    pub entities: Option<Arc<dyn EntityService>>,
    pub files: Arc<dyn FileService>,
    pub config: Option<Arc<dyn ConfigStore>>,
    pub ui: Option<Arc<dyn UiService>>,
}

impl Default for PluginServices {
    fn default() -> Self {
        Self {
            entities: None,
            files: Arc::new(LocalFileService),
            config: None,
            ui: None,
        }
    }
}

impl fmt::Debug for PluginServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginServices")
            .field("entities", &self.entities.is_some())
            .field("config", &self.config.is_some())
            .field("ui", &self.ui.is_some())
            .finish()
    }
}

impl PluginServices {
    pub fn with_entities(mut self, service: Arc<dyn EntityService>) -> Self {
        self.entities = Some(service);
        self
    }

    pub fn with_files(mut self, service: Arc<dyn FileService>) -> Self {
        self.files = service;
        self
    }

    pub fn with_config(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.config = Some(store);
        self
    }

    pub fn with_ui(mut self, service: Arc<dyn UiService>) -> Self {
        self.ui = Some(service);
        self
    }
}
