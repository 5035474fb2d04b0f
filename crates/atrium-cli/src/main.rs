//! Atrium CLI - host for the plugin runtime

mod host;

use anyhow::Context;
use atrium_plugins::git::Git2Service;
use atrium_plugins::{
    OperationResult, Permission, PluginInfo, PluginService, PluginServices, RuntimeSettings,
};
use clap::{Parser, Subcommand};
use host::{JsonConfigStore, LogUi, MemoryEntityStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// File beside `plugins.toml` backing the plugins' config API
const PLUGIN_STORE_FILE: &str = "plugin-store.json";

#[derive(Parser)]
#[command(name = "atrium")]
#[command(author, version, about = "Manage and run Atrium plugins", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List installed plugins
    List,

    /// Show plugin details
    Info { id: String },

    /// Install from a directory or a git URL
    Install {
        /// Local directory or repository URL
        source: String,
    },

    /// Remove an installed plugin
    Uninstall { id: String },

    /// Enable and activate plugins
    Enable {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Disable plugins
    Disable {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Reload a plugin
    Reload { id: String },

    /// Grant declared permissions
    Grant {
        id: String,
        #[arg(required = true)]
        permissions: Vec<String>,
    },

    /// Revoke granted permissions
    Revoke {
        id: String,
        #[arg(required = true)]
        permissions: Vec<String>,
    },

    /// Show declared but not yet granted permissions
    Pending { id: String },

    /// Check git-backed plugins for upstream changes
    CheckUpdates,

    /// Start enabled plugins and run until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("atrium=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output = Output {
        format: cli.format,
        quiet: cli.quiet,
    };

    let service = build_service()?;
    service.discover_plugins().await;

    match cli.command {
        Commands::List => cmd_list(&service, output).await,
        Commands::Info { id } => cmd_info(&service, &id, output).await,
        Commands::Install { source } => cmd_install(&service, &source, output).await,
        Commands::Uninstall { id } => output.results(&[service.uninstall_plugin(&id).await]),
        Commands::Enable { ids } => output.results(&service.batch_enable(&ids).await),
        Commands::Disable { ids } => output.results(&service.batch_disable(&ids).await),
        Commands::Reload { id } => cmd_reload(&service, &id, output).await,
        Commands::Grant { id, permissions } => {
            cmd_permissions(&service, &id, &permissions, true, output).await
        }
        Commands::Revoke { id, permissions } => {
            cmd_permissions(&service, &id, &permissions, false, output).await
        }
        Commands::Pending { id } => cmd_pending(&service, &id, output).await,
        Commands::CheckUpdates => cmd_check_updates(&service, output).await,
        Commands::Run => cmd_run(Arc::new(service), output).await,
    }
}

fn build_service() -> anyhow::Result<PluginService> {
    let settings = RuntimeSettings::load()?;
    let store_path = RuntimeSettings::config_dir()?.join(PLUGIN_STORE_FILE);

    let services = PluginServices::default()
        .with_entities(Arc::new(MemoryEntityStore::default()))
        .with_config(Arc::new(JsonConfigStore::open(store_path)))
        .with_ui(Arc::new(LogUi));

    PluginService::new(settings, services, Arc::new(Git2Service))
        .context("Failed to start the plugin runtime")
}

// ============================================================================
// Output
// ============================================================================

#[derive(Clone, Copy, Debug)]
struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    fn json(&self, value: &impl Serialize) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn line(&self, text: impl AsRef<str>) {
        if !self.quiet {
            println!("{}", text.as_ref());
        }
    }

    /// Print operation results; any failure makes the command fail
    fn results(&self, results: &[OperationResult]) -> anyhow::Result<()> {
        match self.format {
            OutputFormat::Json => self.json(&results)?,
            OutputFormat::Text => {
                for result in results {
                    let mark = if result.success { "ok" } else { "failed" };
                    self.line(format!("[{mark}] {}: {}", result.plugin_id, result.message));
                }
            }
        }

        let failed = results.iter().filter(|r| !r.success).count();
        if failed > 0 {
            anyhow::bail!("{failed} of {} operation(s) failed", results.len());
        }
        Ok(())
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_list(service: &PluginService, output: Output) -> anyhow::Result<()> {
    let plugins = service.get_plugins().await;
    if output.format == OutputFormat::Json {
        return output.json(&plugins);
    }

    if plugins.is_empty() {
        output.line("No plugins installed.");
        output.line("\nInstall one with: atrium install <directory|git-url>");
        return Ok(());
    }

    output.line("Plugins:");
    for p in plugins {
        let flag = if p.enabled { "enabled" } else { "disabled" };
        println!(
            "  {} {} [{}] ({}, {})",
            p.id, p.manifest.version, p.state, p.root, flag
        );
    }
    Ok(())
}

async fn cmd_info(service: &PluginService, id: &str, output: Output) -> anyhow::Result<()> {
    let info = service
        .get_plugin(id)
        .await
        .with_context(|| format!("Plugin '{id}' not found. Run `atrium list` to see installed plugins."))?;

    if output.format == OutputFormat::Json {
        return output.json(&info);
    }
    print_info(&info);
    Ok(())
}

fn print_info(info: &PluginInfo) {
    let manifest = &info.manifest;
    println!("Plugin: {} ({})", manifest.name, info.id);
    println!("  Version: {}", manifest.version);
    println!("  Author: {}", manifest.author);
    println!("  State: {}", info.state);
    println!("  Enabled: {}", info.enabled);
    println!("  Root: {}", info.root);
    println!("  Path: {}", info.install_path.display());
    if let Some(repo) = &manifest.repository {
        println!("  Repository: {repo}");
    }
    println!("  Declared: {}", join_permissions(&manifest.permissions));
    println!(
        "  Granted: {}",
        join_permissions(&info.runtime_config.granted_permissions)
    );
    if let Some(error) = &info.error {
        println!("  Last error: [{}] {}", error.code, error.message);
    }
}

fn join_permissions(permissions: &[Permission]) -> String {
    if permissions.is_empty() {
        return "(none)".to_string();
    }
    permissions
        .iter()
        .map(Permission::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

async fn cmd_install(service: &PluginService, source: &str, output: Output) -> anyhow::Result<()> {
    service.loader().ensure_roots().await?;
    let info = service.install_plugin(source, None).await?;

    if output.format == OutputFormat::Json {
        return output.json(&info);
    }
    output.line(format!("Plugin '{}' {} installed.", info.id, info.manifest.version));
    output.line(format!("  Path: {}", info.install_path.display()));
    if !info.manifest.permissions.is_empty() {
        output.line(format!(
            "  Requests: {}",
            join_permissions(&info.manifest.permissions)
        ));
        output.line(format!("\nGrant with: atrium grant {} <permission>..", info.id));
    }
    Ok(())
}

async fn cmd_reload(service: &PluginService, id: &str, output: Output) -> anyhow::Result<()> {
    // a one-shot process starts with nothing running
    if service.get_plugin(id).await.is_some_and(|p| p.enabled) {
        let started = service.enable_plugin(id).await;
        if !started.success {
            warn!(plugin_id = id, reason = %started.message, "Plugin failed to start before reload");
        }
    }
    output.results(&[service.reload_plugin(id).await])
}

async fn cmd_permissions(
    service: &PluginService,
    id: &str,
    tokens: &[String],
    grant: bool,
    output: Output,
) -> anyhow::Result<()> {
    let permissions = tokens
        .iter()
        .map(|t| t.parse::<Permission>())
        .collect::<Result<Vec<_>, _>>()?;

    for permission in permissions {
        let changed = if grant {
            service.grant_permission(id, permission).await?
        } else {
            service.revoke_permission(id, permission).await?
        };
        if !changed && output.format == OutputFormat::Text {
            let state = if grant { "already granted" } else { "not granted" };
            output.line(format!("{permission} is {state}"));
        }
    }

    let granted = service.get_granted_permissions(id).await?;
    match output.format {
        OutputFormat::Json => output.json(&granted),
        OutputFormat::Text => {
            output.line(format!("Granted to '{id}': {}", join_permissions(&granted)));
            Ok(())
        }
    }
}

async fn cmd_pending(service: &PluginService, id: &str, output: Output) -> anyhow::Result<()> {
    let pending = service.get_pending_permissions(id).await?;
    match output.format {
        OutputFormat::Json => output.json(&pending),
        OutputFormat::Text => {
            if pending.is_empty() {
                output.line(format!("'{id}' has every declared permission."));
            } else {
                println!("Pending for '{id}': {}", join_permissions(&pending));
            }
            Ok(())
        }
    }
}

async fn cmd_check_updates(service: &PluginService, output: Output) -> anyhow::Result<()> {
    let updates = service.check_updates().await;
    match output.format {
        OutputFormat::Json => output.json(&updates),
        OutputFormat::Text => {
            if updates.is_empty() {
                output.line("All plugins are up to date.");
            }
            for update in updates {
                println!(
                    "  {} {} -> {}",
                    update.plugin_id, update.current_version, update.latest_version
                );
            }
            Ok(())
        }
    }
}

async fn cmd_run(service: Arc<PluginService>, output: Output) -> anyhow::Result<()> {
    let (report, update_task) = service.on_app_ready().await;
    output.line(format!(
        "Started {} of {} plugin(s), {} failed. Press Ctrl-C to stop.",
        report.activated, report.discovered, report.failed
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down plugins");

    if let Some(task) = update_task {
        task.abort();
    }
    let stopped = service.on_app_before_quit().await;
    output.line(format!("Stopped {stopped} plugin(s)."));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_format_flag() {
        let cli = Cli::try_parse_from(["atrium", "list", "--format", "json"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::List));
    }

    #[test]
    fn test_enable_requires_an_id() {
        assert!(Cli::try_parse_from(["atrium", "enable"]).is_err());
        let cli = Cli::try_parse_from(["atrium", "enable", "a", "b"]).unwrap();
        match cli.command {
            Commands::Enable { ids } => assert_eq!(ids, vec!["a", "b"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_join_permissions() {
        assert_eq!(join_permissions(&[]), "(none)");
        assert_eq!(
            join_permissions(&[Permission::UiShow, Permission::ConfigRead]),
            "ui:show, config:read"
        );
    }
}
