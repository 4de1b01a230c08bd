//! Bridge configuration: file model, upstream resolution, and validation.
//!
//! The config file is JSON. Upstreams may live under any of four top-level
//! keys (`mcpUpstreams`, `servers`, `context_servers`, `mcpServers`, earlier
//! key wins on duplicate names) so the bridge can reuse a client's own MCP
//! config file directly. Entries read from the client-oriented keys are
//! filtered to exclude references to the bridge executable itself, which
//! would otherwise recurse.

use crate::error::{BridgeError, Result};
use crate::names::NAMESPACE_SEPARATOR;
use crate::policy::ToolPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Substring identifying the bridge's own executable in self-referencing
/// config entries.
pub const SELF_EXECUTABLE_MARKER: &str = "crabeye-mcp-bridge";

pub const DEFAULT_PORT: u16 = 19875;
pub const DEFAULT_MAX_UPSTREAM_CONNECTIONS: usize = 20;
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// STDIO upstream: spawn `command args...` and speak MCP over its pipes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Merged over the bridge's own environment when spawning.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// HTTP upstream: `streamable-http` (default) or `sse`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Raw transport discriminator. Anything other than `"sse"` selects
    /// streamable HTTP, matching the historical dispatch.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub transport_type: Option<String>,
    pub url: String,
    /// Static headers attached to every outbound request.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

pub const HTTP_TYPE_STREAMABLE: &str = "streamable-http";
pub const HTTP_TYPE_SSE: &str = "sse";

impl HttpConfig {
    #[must_use]
    pub fn is_sse(&self) -> bool {
        self.transport_type.as_deref() == Some(HTTP_TYPE_SSE)
    }

    /// True when `type` is present but neither known value.
    #[must_use]
    pub fn has_unknown_type(&self) -> bool {
        !matches!(
            self.transport_type.as_deref(),
            None | Some(HTTP_TYPE_STREAMABLE) | Some(HTTP_TYPE_SSE)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportConfig {
    Stdio(StdioConfig),
    Http(HttpConfig),
}

impl TransportConfig {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio(_) => "stdio",
            Self::Http(http) if http.is_sse() => HTTP_TYPE_SSE,
            Self::Http(_) => HTTP_TYPE_STREAMABLE,
        }
    }
}

/// Per-server `_bridge` metadata block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerBridgeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_policy: Option<ToolPolicy>,
    /// Per-tool policy overrides, keyed by the original tool name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tools: HashMap<String, ToolPolicy>,
    /// Auth configuration, stored as-is. A `credential` key names an entry
    /// in the credential store whose bearer token is attached to HTTP
    /// requests; anything else (OAuth2 client config) is passed through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<serde_json::Value>,
}

impl ServerBridgeMeta {
    #[must_use]
    pub fn credential_key(&self) -> Option<&str> {
        self.auth.as_ref()?.get("credential")?.as_str()
    }
}

/// One upstream server entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(rename = "_bridge", default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<ServerBridgeMeta>,
}

impl ServerConfig {
    #[must_use]
    pub fn category(&self) -> Option<&str> {
        self.bridge.as_ref()?.category.as_deref()
    }

    /// True when the entry spawns the bridge executable itself.
    #[must_use]
    pub fn is_self_reference(&self) -> bool {
        match &self.transport {
            TransportConfig::Stdio(stdio) => {
                stdio.command.contains(SELF_EXECUTABLE_MARKER)
                    || stdio.args.iter().any(|a| a.contains(SELF_EXECUTABLE_MARKER))
            }
            TransportConfig::Http(_) => false,
        }
    }
}

/// Global `_bridge` settings block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    pub port: u16,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    pub tool_policy: ToolPolicy,
    /// Health-check period in seconds; 0 disables the loop.
    pub health_check_interval: u64,
    pub max_upstream_connections: usize,
    /// Per-attempt connect timeout in seconds.
    pub connection_timeout: u64,
    pub idle_timeout: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
            tool_policy: ToolPolicy::default(),
            health_check_interval: 0,
            max_upstream_connections: DEFAULT_MAX_UPSTREAM_CONNECTIONS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT_SECS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(rename = "_bridge", default)]
    pub bridge: BridgeSettings,
    #[serde(rename = "mcpUpstreams", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mcp_upstreams: BTreeMap<String, ServerConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(rename = "context_servers", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context_servers: BTreeMap<String, ServerConfig>,
    #[serde(rename = "mcpServers", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mcp_servers: BTreeMap<String, ServerConfig>,
}

impl BridgeConfig {
    /// Merge the four upstream keys into one table.
    ///
    /// Priority: `mcpUpstreams` > `servers` > `context_servers` >
    /// `mcpServers`; the first key naming an upstream wins. Entries from the
    /// client-oriented keys that reference the bridge executable are dropped.
    #[must_use]
    pub fn resolve_upstreams(&self) -> BTreeMap<String, ServerConfig> {
        let mut resolved: BTreeMap<String, ServerConfig> = BTreeMap::new();

        for (name, config) in &self.mcp_upstreams {
            resolved.entry(name.clone()).or_insert_with(|| config.clone());
        }
        for (name, config) in &self.servers {
            resolved.entry(name.clone()).or_insert_with(|| config.clone());
        }
        for source in [&self.context_servers, &self.mcp_servers] {
            for (name, config) in source {
                if config.is_self_reference() {
                    tracing::debug!(server = %name, "skipping self-referencing config entry");
                    continue;
                }
                resolved.entry(name.clone()).or_insert_with(|| config.clone());
            }
        }
        resolved
    }
}

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    let bytes = std::fs::read(path).map_err(|e| {
        BridgeError::Config(format!("cannot read {}: {e}", path.display()))
    })?;
    let config: BridgeConfig = serde_json::from_slice(&bytes).map_err(|e| {
        BridgeError::Config(format!("cannot parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate the parsed config. Errors name the offending field.
pub fn validate_config(config: &BridgeConfig) -> Result<()> {
    let resolved = config.resolve_upstreams();

    if resolved.len() > config.bridge.max_upstream_connections {
        return Err(BridgeError::Config(format!(
            "{} upstreams configured but _bridge.maxUpstreamConnections is {}",
            resolved.len(),
            config.bridge.max_upstream_connections
        )));
    }

    for (name, server) in &resolved {
        if name.is_empty() {
            return Err(BridgeError::Config("upstream name must not be empty".into()));
        }
        if name.contains(NAMESPACE_SEPARATOR) {
            return Err(BridgeError::Config(format!(
                "upstream name \"{name}\" must not contain \"{NAMESPACE_SEPARATOR}\""
            )));
        }
        match &server.transport {
            TransportConfig::Stdio(stdio) => {
                if stdio.command.is_empty() {
                    return Err(BridgeError::Config(format!(
                        "{name}.command must not be empty"
                    )));
                }
            }
            TransportConfig::Http(http) => {
                reqwest::Url::parse(&http.url).map_err(|e| {
                    BridgeError::Config(format!("{name}.url is not a valid URL: {e}"))
                })?;
                if http.has_unknown_type() {
                    tracing::warn!(
                        server = %name,
                        transport_type = ?http.transport_type,
                        "unknown transport type, falling back to streamable-http"
                    );
                }
            }
        }
    }

    Ok(())
}
