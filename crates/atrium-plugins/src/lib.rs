//! Atrium Plugin Runtime
//!
//! Discovers, validates, sandboxes and drives the lifecycle of third-party
//! plugins:
//! - Manifest parsing and validation
//! - Dependency and conflict resolution against the installed set
//! - WASM sandboxing via wasmtime with an import denylist and execution budget
//! - Capability-gated plugin contexts recomputed on every permission change
//! - A ten-state lifecycle machine owned by [`PluginService`]
//!
//! Isolation is language-level only. Plugins share the host process; fuel and
//! epoch deadlines bound guest execution but do not protect against a host call
//! that blocks, nor against bugs in the runtime itself.

pub mod context;
pub mod dependency;
pub mod error;
pub mod events;
pub mod git;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod permission;
pub mod runtime_config;
pub mod sandbox;
pub mod services;
pub mod settings;

pub use context::PluginContext;
pub use error::{PluginError, PluginResult, SandboxError, SandboxResult};
pub use events::{EventBus, EventScope, PluginEvent};
pub use lifecycle::{
    OperationResult, Plugin, PluginInfo, PluginService, PluginState, PluginUpdate, RuntimeConfigUpdate,
    StartupReport,
};
pub use loader::{PluginLoader, PluginModule, RootKind};
pub use manifest::Manifest;
pub use permission::{CapabilityGroup, Permission, PermissionSet};
pub use runtime_config::RuntimeConfig;
pub use services::PluginServices;
pub use settings::RuntimeSettings;
