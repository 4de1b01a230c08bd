use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use crabeye_credential_store::{Credential, CredentialStore};
use crabeye_mcp_bridge::client::{ReconnectSettings, UpstreamClientFactory};
use crabeye_mcp_bridge::config::{BridgeConfig, TransportConfig, load_config};
use crabeye_mcp_bridge::diff::diff_configs;
use crabeye_mcp_bridge::logging::{self, LoggingHandle};
use crabeye_mcp_bridge::manager::UpstreamManager;
use crabeye_mcp_bridge::policy::PolicyEngine;
use crabeye_mcp_bridge::registry::ToolRegistry;
use crabeye_mcp_bridge::search::ToolSearchService;
use crabeye_mcp_bridge::server::BridgeServer;
use crabeye_mcp_bridge::transport::RmcpTransportFactory;
use crabeye_mcp_bridge::watcher::{ConfigWatcher, ReloadListener};
use futures::FutureExt as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "crabeye-mcp-bridge",
    version,
    about = "Aggregate many MCP servers behind one small, searchable MCP endpoint"
)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, env = "MCP_BRIDGE_CONFIG", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Parse and resolve the configuration, print the upstream table, then exit
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Manage stored upstream credentials
    Credential {
        #[command(subcommand)]
        action: CredentialAction,
    },
}

#[derive(Subcommand)]
enum CredentialAction {
    /// Store a credential
    Set {
        key: String,
        /// Bearer token, or a JSON object when --kind oauth2
        secret: String,
        #[arg(long, value_enum, default_value = "bearer")]
        kind: CredentialKind,
    },
    /// Print a stored credential as JSON
    Get { key: String },
    /// Delete a stored credential
    Delete { key: String },
    /// List stored credential keys
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum CredentialKind {
    Bearer,
    Oauth2,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Credential { action }) = cli.command {
        return credential_command(action);
    }

    let config_path = cli
        .config
        .context("--config <path> is required (or set MCP_BRIDGE_CONFIG)")?;
    let config = load_config(&config_path)?;

    if cli.validate {
        print_upstream_table(&config);
        return Ok(());
    }

    let logging = logging::init(config.bridge.log_level, config.bridge.log_format);
    run(config_path, config, logging).await
}

async fn run(
    config_path: PathBuf,
    config: BridgeConfig,
    logging: LoggingHandle,
) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "starting bridge"
    );

    let registry = Arc::new(ToolRegistry::new());
    let policy = Arc::new(PolicyEngine::new(config.bridge.tool_policy));
    policy.update(config.bridge.tool_policy, &config.resolve_upstreams());
    let search = ToolSearchService::new(Arc::clone(&registry), Arc::clone(&policy));

    let transport = Arc::new(RmcpTransportFactory::new(
        Duration::from_secs(config.bridge.connection_timeout),
        open_credential_store_if_needed(&config),
    ));
    let client_factory = Arc::new(UpstreamClientFactory::new(
        transport,
        ReconnectSettings::default(),
    ));
    let manager = UpstreamManager::new(Arc::clone(&registry), client_factory, config.clone());

    let summary = manager.connect_all().await;
    tracing::info!(
        total = summary.total,
        connected = summary.connected,
        failed = summary.failed.len(),
        "upstream connections established"
    );
    for (name, error) in &summary.failed {
        tracing::warn!(server = %name, error = %error, "upstream unavailable at startup");
    }

    let listener: ReloadListener = {
        let manager = Arc::clone(&manager);
        let policy = Arc::clone(&policy);
        let logging = logging.clone();
        Arc::new(move |new_config: BridgeConfig| {
            let manager = Arc::clone(&manager);
            let policy = Arc::clone(&policy);
            let logging = logging.clone();
            async move {
                let old = manager.current_config();
                let diff = diff_configs(&old, &new_config);
                if diff.is_empty() {
                    return Ok(());
                }
                for key in &diff.bridge.requires_restart {
                    tracing::warn!(
                        setting = %key,
                        "changed setting takes effect on the next restart"
                    );
                }
                if let Some(level) = diff.bridge.log_level {
                    logging.set_level(level);
                }
                policy.update(
                    new_config.bridge.tool_policy,
                    &new_config.resolve_upstreams(),
                );
                manager.apply_config_diff(&diff, new_config).await;
                if let Some(interval) = diff.bridge.health_check_interval {
                    manager.restart_health_checks(interval);
                }
                Ok(())
            }
            .boxed()
        })
    };
    let watcher = ConfigWatcher::spawn(&config_path, &config, listener)?;

    let server = BridgeServer::new(
        registry,
        Some(search),
        Arc::clone(&manager),
        policy,
    );
    let result = server.serve_stdio().await;

    watcher.stop().await;
    manager.close_all().await;
    result?;
    Ok(())
}

/// Only touch the credential store when the config references it.
fn open_credential_store_if_needed(config: &BridgeConfig) -> Option<Arc<CredentialStore>> {
    let referenced = config
        .resolve_upstreams()
        .values()
        .any(|server| server.bridge.as_ref().is_some_and(|b| b.credential_key().is_some()));
    if !referenced {
        return None;
    }
    match CredentialStore::open_default() {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            tracing::warn!(error = %e, "credential store unavailable; upstream auth will fail");
            None
        }
    }
}

fn print_upstream_table(config: &BridgeConfig) {
    let resolved = config.resolve_upstreams();
    println!("{} upstream(s) configured", resolved.len());
    for (name, server) in &resolved {
        let target = match &server.transport {
            TransportConfig::Stdio(stdio) => {
                if stdio.args.is_empty() {
                    stdio.command.clone()
                } else {
                    format!("{} {}", stdio.command, stdio.args.join(" "))
                }
            }
            TransportConfig::Http(http) => http.url.clone(),
        };
        let category = server.category().unwrap_or("-");
        println!(
            "  {name:<24} {kind:<16} {target}  [{category}]",
            kind = server.transport.kind()
        );
    }
}

fn credential_command(action: CredentialAction) -> anyhow::Result<()> {
    let store = CredentialStore::open_default().context("open credential store")?;
    match action {
        CredentialAction::Set { key, secret, kind } => {
            let credential = match kind {
                CredentialKind::Bearer => Credential::Bearer { token: secret },
                CredentialKind::Oauth2 => {
                    let config = serde_json::from_str(&secret)
                        .context("oauth2 credentials must be a JSON object")?;
                    Credential::Oauth2 { config }
                }
            };
            store.set(&key, credential)?;
            println!("stored credential \"{key}\"");
        }
        CredentialAction::Get { key } => match store.get(&key)? {
            Some(credential) => println!("{}", serde_json::to_string_pretty(&credential)?),
            None => anyhow::bail!("no credential named \"{key}\""),
        },
        CredentialAction::Delete { key } => {
            if store.delete(&key)? {
                println!("deleted credential \"{key}\"");
            } else {
                anyhow::bail!("no credential named \"{key}\"");
            }
        }
        CredentialAction::List => {
            let entries = store.list()?;
            if entries.is_empty() {
                println!("no credentials stored");
            }
            for entry in entries {
                println!("{}\t{}", entry.key, entry.kind);
            }
        }
    }
    Ok(())
}
