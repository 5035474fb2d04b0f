//! Uniform result shape for public lifecycle operations

use crate::error::PluginError;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    /// Suitable for direct display
    pub message: String,
    pub plugin_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl OperationResult {
    pub fn ok(plugin_id: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            plugin_id: plugin_id.to_string(),
            error: None,
            data: None,
        }
    }

    pub fn failed(plugin_id: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(plugin_id, message)
        }
    }

    pub fn from_error(plugin_id: &str, error: &PluginError) -> Self {
        Self {
            error: Some(error.code().to_string()),
            ..Self::failed(plugin_id, error.to_string())
        }
    }

    pub fn not_found(plugin_id: &str) -> Self {
        Self::from_error(plugin_id, &PluginError::NotFound(plugin_id.to_string()))
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialised_shape() {
        let result = OperationResult::not_found("ghost");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({
                "success": false,
                "message": "Plugin 'ghost' not found",
                "pluginId": "ghost",
                "error": "E540"
            })
        );

        let ok = OperationResult::ok("x", "done").with_data(json!({"n": 1}));
        assert!(ok.success);
        assert_eq!(serde_json::to_value(&ok).unwrap()["data"]["n"], 1);
    }
}
