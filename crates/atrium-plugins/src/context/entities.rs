//! Entity CRUD exposed to plugins

use crate::error::{PluginError, PluginResult};
use crate::permission::{Permission, PermissionSet};
use crate::services::EntityService;
use serde_json::Value;
use std::sync::Arc;

const SERVICE: &str = "Entity";

/// Permission-gated view of the host's [`EntityService`]
///
/// Without a collaborator the API is inert: listings come back empty,
/// deletes report `false` and single-item operations fail.
#[derive(Clone)]
pub struct EntityApi {
    plugin_id: String,
    permissions: PermissionSet,
    service: Option<Arc<dyn EntityService>>,
}

impl EntityApi {
    pub(crate) fn new(
        plugin_id: &str,
        permissions: PermissionSet,
        service: Option<Arc<dyn EntityService>>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            permissions,
            service,
        }
    }

    pub fn is_inert(&self) -> bool {
        self.service.is_none()
    }

    pub fn get_types(&self) -> PluginResult<Vec<Value>> {
        self.require(Permission::EntitiesGetTypes)?;
        match &self.service {
            Some(service) => service.get_types().map_err(failed),
            None => Ok(Vec::new()),
        }
    }

    pub fn get_type(&self, id: &str) -> PluginResult<Option<Value>> {
        self.require(Permission::EntitiesGetType)?;
        self.service()?.get_type(id).map_err(failed)
    }

    pub fn get_entities(&self, query: Option<&Value>) -> PluginResult<Vec<Value>> {
        self.require(Permission::EntitiesList)?;
        match &self.service {
            Some(service) => service.get_entities(query).map_err(failed),
            None => Ok(Vec::new()),
        }
    }

    pub fn get_entity(&self, id: &str) -> PluginResult<Option<Value>> {
        self.require(Permission::EntitiesGet)?;
        self.service()?.get_entity(id).map_err(failed)
    }

    pub fn create_entity(&self, entity: Value) -> PluginResult<Value> {
        self.require(Permission::EntitiesCreate)?;
        self.service()?.create_entity(entity).map_err(failed)
    }

    pub fn update_entity(&self, id: &str, updates: Value) -> PluginResult<Value> {
        self.require(Permission::EntitiesUpdate)?;
        self.service()?.update_entity(id, updates).map_err(failed)
    }

    pub fn delete_entity(&self, id: &str) -> PluginResult<bool> {
        self.require(Permission::EntitiesDelete)?;
        match &self.service {
            Some(service) => service.delete_entity(id).map_err(failed),
            None => Ok(false),
        }
    }

    fn require(&self, permission: Permission) -> PluginResult<()> {
        self.permissions.require(&self.plugin_id, permission)
    }

    fn service(&self) -> PluginResult<&Arc<dyn EntityService>> {
        self.service
            .as_ref()
            .ok_or_else(|| PluginError::ServiceUnavailable(SERVICE.to_string()))
    }
}

fn failed(e: anyhow::Error) -> PluginError {
    PluginError::service(SERVICE, format!("{e:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        created: Mutex<Vec<Value>>,
    }

    impl EntityService for Recording {
        fn get_types(&self) -> anyhow::Result<Vec<Value>> {
            Ok(vec![json!({"id": "note"})])
        }
        fn get_type(&self, id: &str) -> anyhow::Result<Option<Value>> {
            Ok((id == "note").then(|| json!({"id": "note"})))
        }
        fn get_entities(&self, _query: Option<&Value>) -> anyhow::Result<Vec<Value>> {
            Ok(self.created.lock().unwrap().clone())
        }
        fn get_entity(&self, _id: &str) -> anyhow::Result<Option<Value>> {
            Ok(None)
        }
        fn create_entity(&self, entity: Value) -> anyhow::Result<Value> {
            self.created.lock().unwrap().push(entity.clone());
            Ok(entity)
        }
        fn update_entity(&self, _id: &str, _updates: Value) -> anyhow::Result<Value> {
            anyhow::bail!("read-only store")
        }
        fn delete_entity(&self, _id: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_calls_pass_through_with_permission() {
        let service = Arc::new(Recording::default());
        let api = EntityApi::new(
            "notes",
            PermissionSet::new([Permission::EntitiesCreate, Permission::EntitiesList]),
            Some(service.clone()),
        );

        api.create_entity(json!({"title": "a"})).unwrap();
        assert_eq!(api.get_entities(None).unwrap().len(), 1);
        assert!(matches!(
            api.delete_entity("x").unwrap_err(),
            PluginError::PermissionDenied { permission: Permission::EntitiesDelete, .. }
        ));
    }

    #[test]
    fn test_service_failures_are_wrapped() {
        let api = EntityApi::new(
            "notes",
            PermissionSet::new([Permission::EntitiesUpdate]),
            Some(Arc::new(Recording::default())),
        );
        let err = api.update_entity("x", json!({})).unwrap_err();
        assert!(err.to_string().contains("read-only store"));
    }

    #[test]
    fn test_inert_api_without_service() {
        let api = EntityApi::new("notes", PermissionSet::new(Permission::ALL), None);
        assert!(api.is_inert());
        assert!(api.get_types().unwrap().is_empty());
        assert!(api.get_entities(None).unwrap().is_empty());
        assert!(!api.delete_entity("x").unwrap());
        assert!(matches!(
            api.create_entity(json!({})).unwrap_err(),
            PluginError::ServiceUnavailable(_)
        ));
    }
}
