//! Plugin manifest parsing and validation
//!
//! A manifest is the static `plugin.json` shipped with every plugin. Parsing
//! enforces field presence and types; [`validate`] re-checks the grammar rules
//! and contribution points. Neither touches the entry file, which may not be
//! installed yet.

use crate::error::{PluginError, PluginResult};
use crate::permission::Permission;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

/// File name of the manifest inside a plugin directory
pub const MANIFEST_FILE: &str = "plugin.json";

const MAX_MANIFEST_BYTES: u64 = 64 * 1024;

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("valid id pattern"));

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+(-[a-zA-Z0-9.]+)?(\+[a-zA-Z0-9.]+)?$").expect("valid version pattern")
});

/// Where a plugin comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginCategory {
    System,
    User,
}

impl PluginCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
        }
    }
}

/// Plugin manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Entry file relative to the plugin directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub screenshots: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    pub category: PluginCategory,
    /// Host version range this plugin supports
    pub compatibility: String,
    pub license: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_dependencies: Vec<DependencySpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandContribution>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub views: Vec<ViewContribution>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub menus: Vec<MenuContribution>,
}

/// A declared plugin-to-plugin dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencySpec {
    pub plugin_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandContribution {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortcut: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewPosition {
    Sidebar,
    Toolbar,
    Statusbar,
    Main,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewContribution {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<ViewPosition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MenuPosition {
    File,
    Edit,
    View,
    Plugin,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuContribution {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<MenuPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i32>,
}

impl Manifest {
    /// Required and optional dependencies, the latter flagged optional
    pub fn all_dependencies(&self) -> impl Iterator<Item = DependencySpec> + '_ {
        self.dependencies.iter().cloned().chain(
            self.optional_dependencies
                .iter()
                .cloned()
                .map(|dep| DependencySpec { optional: true, ..dep }),
        )
    }

    pub fn declares_conflict_with(&self, plugin_id: &str) -> bool {
        self.conflicts.iter().any(|c| c == plugin_id)
    }
}

/// Read and decode a manifest file
pub fn parse(path: &Path) -> PluginResult<Manifest> {
    let metadata = fs::metadata(path)?;
    if metadata.len() > MAX_MANIFEST_BYTES {
        return Err(PluginError::ManifestValidation(format!(
            "Manifest file too large: {} bytes (limit {MAX_MANIFEST_BYTES})",
            metadata.len()
        )));
    }

    let data = fs::read_to_string(path)?;
    parse_str(&data)
}

pub fn parse_str(data: &str) -> PluginResult<Manifest> {
    serde_json::from_str(data)
        .map_err(|e| PluginError::ManifestValidation(format!("Invalid manifest JSON: {e}")))
}

/// Re-check grammar rules and contribution points
///
/// Asset paths are not checked here; the loader confines the entry file to
/// the install directory when the plugin is loaded. Repeated permissions are
/// accepted and collapse once granted.
pub fn validate(manifest: &Manifest, _install_dir: &Path) -> PluginResult<()> {
    if !ID_PATTERN.is_match(&manifest.id) {
        return Err(invalid(format!(
            "Plugin id '{}' must be lowercase letters and digits separated by single hyphens",
            manifest.id
        )));
    }

    if !VERSION_PATTERN.is_match(&manifest.version) {
        return Err(invalid(format!(
            "Version '{}' is not a semantic version",
            manifest.version
        )));
    }

    for (field, value) in [
        ("name", &manifest.name),
        ("description", &manifest.description),
        ("author", &manifest.author),
        ("compatibility", &manifest.compatibility),
        ("license", &manifest.license),
    ] {
        if value.trim().is_empty() {
            return Err(invalid(format!("Field '{field}' cannot be empty")));
        }
    }

    validate_dependencies(manifest)?;
    validate_contributions(manifest)
}

fn validate_dependencies(manifest: &Manifest) -> PluginResult<()> {
    let mut seen = HashSet::new();
    for dep in manifest.all_dependencies() {
        if dep.plugin_id.trim().is_empty() {
            return Err(invalid("Dependency is missing 'pluginId'"));
        }
        if dep.version.trim().is_empty() {
            return Err(invalid(format!(
                "Dependency '{}' is missing a version range",
                dep.plugin_id
            )));
        }
        if !seen.insert(dep.plugin_id.clone()) {
            return Err(invalid(format!("Duplicate dependency '{}'", dep.plugin_id)));
        }
        if dep.plugin_id == manifest.id {
            return Err(invalid("A plugin cannot depend on itself"));
        }
    }
    Ok(())
}

fn validate_contributions(manifest: &Manifest) -> PluginResult<()> {
    check_collection(
        "command",
        manifest.commands.iter().map(|c| (c.id.as_str(), c.name.as_str())),
    )?;
    check_collection(
        "view",
        manifest.views.iter().map(|v| (v.id.as_str(), v.name.as_str())),
    )?;
    check_collection(
        "menu",
        manifest.menus.iter().map(|m| (m.id.as_str(), m.name.as_str())),
    )?;

    if let Some(menu) = manifest.menus.iter().find(|m| m.position.is_none()) {
        return Err(invalid(format!(
            "Menu '{}' requires a position (file, edit, view, plugin or help)",
            menu.id
        )));
    }

    Ok(())
}

fn check_collection<'a>(
    kind: &str,
    items: impl Iterator<Item = (&'a str, &'a str)>,
) -> PluginResult<()> {
    let mut ids = HashSet::new();
    for (id, name) in items {
        if id.trim().is_empty() {
            return Err(invalid(format!("A {kind} contribution is missing 'id'")));
        }
        if name.trim().is_empty() {
            return Err(invalid(format!("The {kind} '{id}' is missing 'name'")));
        }
        if !ids.insert(id) {
            return Err(invalid(format!("Duplicate {kind} id '{id}'")));
        }
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> PluginError {
    PluginError::ManifestValidation(message.into())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_json() -> serde_json::Value {
        json!({
            "id": "word-count",
            "name": "Word Count",
            "version": "1.2.0",
            "description": "Counts words",
            "author": "Atrium",
            "category": "user",
            "compatibility": "^1.0.0",
            "license": "MIT",
            "permissions": ["entities:create", "files:open"],
            "menus": [{ "id": "count", "name": "Count", "position": "plugin" }]
        })
    }

    fn sample() -> Manifest {
        serde_json::from_value(sample_json()).expect("valid sample")
    }

    fn dir() -> &'static Path {
        Path::new("/plugins/user/word-count")
    }

    #[test]
    fn test_sample_is_valid() {
        let manifest = sample();
        assert_eq!(manifest.category, PluginCategory::User);
        assert_eq!(
            manifest.permissions,
            vec![Permission::EntitiesCreate, Permission::FilesOpen]
        );
        validate(&manifest, dir()).expect("sample validates");
    }

    #[test]
    fn test_missing_required_field_fails_parse() {
        let mut value = sample_json();
        value.as_object_mut().unwrap().remove("license");
        let err = parse_str(&value.to_string()).unwrap_err();
        assert!(matches!(err, PluginError::ManifestValidation(_)));
    }

    #[test]
    fn test_wrong_category_fails_parse() {
        let mut value = sample_json();
        value["category"] = json!("vendor");
        assert!(parse_str(&value.to_string()).is_err());
    }

    #[test]
    fn test_unknown_permission_fails_parse() {
        let mut value = sample_json();
        value["permissions"] = json!(["entities:create", "shell:exec"]);
        assert!(parse_str(&value.to_string()).is_err());
    }

    #[test]
    fn test_id_grammar() {
        for bad in ["Word-Count", "word--count", "-word", "word-", "word_count", ""] {
            let mut manifest = sample();
            manifest.id = bad.to_string();
            assert!(validate(&manifest, dir()).is_err(), "{bad} should be rejected");
        }
        for good in ["a", "word-count", "x1-2y"] {
            let mut manifest = sample();
            manifest.id = good.to_string();
            assert!(validate(&manifest, dir()).is_ok(), "{good} should be accepted");
        }
    }

    #[test]
    fn test_version_grammar() {
        for good in ["0.0.1", "1.2.3-beta.1", "1.2.3+build.5", "10.20.30-rc1+sha.1"] {
            let mut manifest = sample();
            manifest.version = good.to_string();
            assert!(validate(&manifest, dir()).is_ok(), "{good} should be accepted");
        }
        for bad in ["1.2", "v1.2.3", "1.2.3-", "1.2.x"] {
            let mut manifest = sample();
            manifest.version = bad.to_string();
            assert!(validate(&manifest, dir()).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_menu_requires_position() {
        let mut manifest = sample();
        manifest.menus[0].position = None;
        let err = validate(&manifest, dir()).unwrap_err();
        assert!(err.to_string().contains("position"));
    }

    #[test]
    fn test_contribution_requires_name() {
        let mut manifest = sample();
        manifest.commands.push(CommandContribution {
            id: "run".into(),
            name: " ".into(),
            description: None,
            shortcut: None,
        });
        assert!(validate(&manifest, dir()).is_err());
    }

    #[test]
    fn test_duplicate_contribution_ids() {
        let mut manifest = sample();
        manifest.menus.push(manifest.menus[0].clone());
        assert!(validate(&manifest, dir()).is_err());
    }

    #[test]
    fn test_dependency_rules() {
        let mut manifest = sample();
        manifest.dependencies.push(DependencySpec {
            plugin_id: "base".into(),
            version: String::new(),
            optional: false,
        });
        assert!(validate(&manifest, dir()).is_err());

        manifest.dependencies[0].version = "^1".into();
        assert!(validate(&manifest, dir()).is_ok());

        manifest.optional_dependencies.push(manifest.dependencies[0].clone());
        assert!(validate(&manifest, dir()).is_err());
    }

    #[test]
    fn test_paths_and_repeated_permissions_are_accepted() {
        let mut manifest = sample();
        manifest.permissions = vec![Permission::EntitiesCreate, Permission::EntitiesCreate];
        assert!(validate(&manifest, dir()).is_ok());

        // containment is enforced when the entry is loaded
        manifest.main = Some("../shared/index.wasm".into());
        manifest.icon = Some("../shared/icon.png".into());
        assert!(validate(&manifest, dir()).is_ok());
    }

    #[test]
    fn test_parse_from_disk() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join(MANIFEST_FILE);
        fs::write(&path, sample_json().to_string()).expect("write manifest");

        let manifest = parse(&path).expect("parse");
        assert_eq!(manifest.id, "word-count");
        assert!(parse(&tmp.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_optional_dependencies_are_flagged() {
        let mut manifest = sample();
        manifest.optional_dependencies.push(DependencySpec {
            plugin_id: "extras".into(),
            version: "*".into(),
            optional: false,
        });
        let deps: Vec<_> = manifest.all_dependencies().collect();
        assert_eq!(deps.len(), 1);
        assert!(deps[0].optional);
    }
}
