//! Runtime settings with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Plugin runtime settings, read from `plugins.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub roots: RootSettings,
    pub sandbox: SandboxSettings,
    pub updates: UpdateSettings,
}

/// The three plugin root directories, scanned in this order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RootSettings {
    pub system: PathBuf,
    pub user: PathBuf,
    pub dev: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub enabled: bool,
    pub module_timeout_ms: u64,
    pub exec_timeout_ms: u64,
    pub max_timer_delay_ms: u64,
    pub fuel_per_call: u64,
    pub memory_limit_bytes: usize,
    pub console_messages_per_second: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    pub auto_check: bool,
    pub auto_update: bool,
    pub check_delay_secs: u64,
}

impl Default for RootSettings {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(env::temp_dir)
            .join("atrium")
            .join("plugins");
        Self::under(base)
    }
}

impl RootSettings {
    /// `system`, `user` and `dev` subdirectories of `base`
    pub fn under(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            system: base.join("system"),
            user: base.join("user"),
            dev: base.join("dev"),
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            module_timeout_ms: 10_000,
            exec_timeout_ms: 5_000,
            max_timer_delay_ms: 5_000,
            fuel_per_call: 500_000_000,
            memory_limit_bytes: 64 * 1024 * 1024,
            console_messages_per_second: 50,
        }
    }
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            auto_check: true,
            auto_update: false,
            check_delay_secs: 5,
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            roots: RootSettings::default(),
            sandbox: SandboxSettings::default(),
            updates: UpdateSettings::default(),
        }
    }
}

impl RuntimeSettings {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("ATRIUM_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("atrium")
        };
        Ok(dir)
    }

    /// Get the settings file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("plugins.toml"))
    }

    /// Load settings from file, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
            let settings: RuntimeSettings = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;
            settings.validate()?;
            Ok(settings)
        } else {
            // Return defaults without creating file
            Ok(RuntimeSettings::default())
        }
    }

    /// Save settings to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize settings")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write settings file: {}", path.display()))?;

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, root) in [
            ("system", &self.roots.system),
            ("user", &self.roots.user),
            ("dev", &self.roots.dev),
        ] {
            if root.as_os_str().is_empty() {
                return Err(anyhow!("Plugin root '{name}' cannot be empty"));
            }
        }

        let sandbox = &self.sandbox;
        if sandbox.module_timeout_ms == 0 || sandbox.exec_timeout_ms == 0 {
            return Err(anyhow!("Sandbox timeouts must be greater than zero"));
        }
        if sandbox.fuel_per_call == 0 {
            return Err(anyhow!("Fuel per call must be greater than zero"));
        }
        if sandbox.memory_limit_bytes < 64 * 1024 {
            return Err(anyhow!("Sandbox memory limit must be at least one wasm page"));
        }

        Ok(())
    }

    pub fn with_roots(mut self, roots: RootSettings) -> Self {
        self.roots = roots;
        self
    }

    pub fn with_sandbox_enabled(mut self, enabled: bool) -> Self {
        self.sandbox.enabled = enabled;
        self
    }

    pub fn with_updates(mut self, updates: UpdateSettings) -> Self {
        self.updates = updates;
        self
    }
}
