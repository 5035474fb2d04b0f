//! Concrete collaborators wired into the plugin runtime by the CLI host

use anyhow::{Context, anyhow};
use atrium_plugins::context::utils::generate_id;
use atrium_plugins::services::{ConfigStore, Dialog, EntityService, Notification, UiService};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Entity store that lives for one CLI invocation
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    entities: RwLock<BTreeMap<String, Value>>,
}

impl MemoryEntityStore {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.entities.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Value>> {
        self.entities.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl EntityService for MemoryEntityStore {
    fn get_types(&self) -> anyhow::Result<Vec<Value>> {
        let mut types: Vec<_> = self
            .read()
            .values()
            .filter_map(|e| e.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        types.sort();
        types.dedup();
        Ok(types.into_iter().map(|id| json!({ "id": id })).collect())
    }

    fn get_type(&self, id: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.get_types()?.into_iter().find(|t| t["id"] == id))
    }

    fn get_entities(&self, query: Option<&Value>) -> anyhow::Result<Vec<Value>> {
        let wanted = query.and_then(|q| q.get("type")).and_then(Value::as_str);
        Ok(self
            .read()
            .values()
            .filter(|e| wanted.is_none_or(|t| e.get("type").and_then(Value::as_str) == Some(t)))
            .cloned()
            .collect())
    }

    fn get_entity(&self, id: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.read().get(id).cloned())
    }

    fn create_entity(&self, entity: Value) -> anyhow::Result<Value> {
        let Value::Object(mut fields) = entity else {
            return Err(anyhow!("entity must be a JSON object"));
        };
        let id = generate_id();
        fields.insert("id".to_string(), json!(id));
        let entity = Value::Object(fields);
        self.write().insert(id, entity.clone());
        Ok(entity)
    }

    fn update_entity(&self, id: &str, updates: Value) -> anyhow::Result<Value> {
        let Value::Object(updates) = updates else {
            return Err(anyhow!("updates must be a JSON object"));
        };
        let mut entities = self.write();
        let entity = entities
            .get_mut(id)
            .ok_or_else(|| anyhow!("entity '{id}' not found"))?;
        if let Value::Object(fields) = entity {
            for (key, value) in updates {
                if key != "id" {
                    fields.insert(key, value);
                }
            }
        }
        Ok(entity.clone())
    }

    fn delete_entity(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self.write().remove(id).is_some())
    }
}

/// Key/value store persisted as one JSON object
#[derive(Debug)]
pub struct JsonConfigStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonConfigStore {
    /// Open `path`, starting empty if it does not exist or cannot be parsed
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Map<String, Value>>(&contents) {
                Ok(values) => values,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Plugin store is not a JSON object, starting empty");
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        };
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &Map<String, Value>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(values)?;
        fs::write(&self.path, contents)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

impl ConfigStore for JsonConfigStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value);
        self.persist(&values)
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

/// Headless UI: everything goes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogUi;

impl UiService for LogUi {
    fn show_notification(&self, notification: &Notification) -> anyhow::Result<()> {
        info!(
            kind = ?notification.kind,
            title = %notification.title,
            "{}",
            notification.message
        );
        Ok(())
    }

    fn show_dialog(&self, dialog: &Dialog) -> anyhow::Result<usize> {
        info!(
            kind = ?dialog.kind,
            title = %dialog.title,
            buttons = ?dialog.buttons,
            "{} (answering with the first button)",
            dialog.message
        );
        Ok(0)
    }

    fn open_external(&self, url: &str) -> anyhow::Result<()> {
        info!(url, "Plugin asked to open an external URL");
        Ok(())
    }
}
