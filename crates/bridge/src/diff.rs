//! Structured diffs between two configurations.
//!
//! The hot-reload pipeline loads the new file, diffs it against the running
//! config, and hands the manager a plan: which upstreams to add, drop,
//! reconnect (connection-identifying fields changed), or merely update
//! (metadata-only change, no connection churn). Bridge-level settings split
//! into hot-reloadable keys and keys that are reported but need a restart.

use crate::config::{BridgeConfig, LogLevel, ServerConfig, TransportConfig};
use crate::policy::ToolPolicy;
use serde_json::Value;
use sha2::{Digest as _, Sha256};

/// Per-upstream changes, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Connection-identifying fields changed; close the old client and open
    /// a new one.
    pub reconnect: Vec<String>,
    /// Only the `_bridge` metadata changed; no connection churn.
    pub updated: Vec<String>,
}

impl ServerDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.reconnect.is_empty()
            && self.updated.is_empty()
    }
}

/// Bridge-level setting changes. The `Option` fields are hot-reloadable;
/// `requires_restart` names keys that changed but only apply on restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeSettingsDiff {
    pub log_level: Option<LogLevel>,
    pub health_check_interval: Option<u64>,
    pub tool_policy: Option<ToolPolicy>,
    pub requires_restart: Vec<String>,
}

impl BridgeSettingsDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log_level.is_none()
            && self.health_check_interval.is_none()
            && self.tool_policy.is_none()
            && self.requires_restart.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub servers: ServerDiff,
    pub bridge: BridgeSettingsDiff,
}

impl ConfigDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty() && self.bridge.is_empty()
    }
}

/// Recursively sort object keys so semantically equal values serialize
/// identically.
#[must_use]
pub fn canonicalize_json(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                if let Some(val) = map.get(&k) {
                    out.insert(k, canonicalize_json(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize_json).collect()),
        other => other.clone(),
    }
}

/// Stable fingerprint of a whole config; used by the watcher to skip
/// reloads that parse to the same document.
#[must_use]
pub fn config_fingerprint(config: &BridgeConfig) -> String {
    let v = serde_json::to_value(config).unwrap_or(Value::Null);
    let serialized =
        serde_json::to_string(&canonicalize_json(&v)).unwrap_or_default();
    hex::encode(Sha256::digest(serialized.as_bytes()))
}

/// The fields whose change requires re-establishing the connection.
fn connection_identity(config: &ServerConfig) -> Value {
    match &config.transport {
        TransportConfig::Stdio(stdio) => serde_json::json!({
            "command": stdio.command,
            "args": stdio.args,
            "env": stdio.env,
        }),
        TransportConfig::Http(http) => serde_json::json!({
            "type": http.transport_type,
            "url": http.url,
            "headers": http.headers,
        }),
    }
}

fn same_json<T: serde::Serialize>(a: &T, b: &T) -> bool {
    let a = serde_json::to_value(a).unwrap_or(Value::Null);
    let b = serde_json::to_value(b).unwrap_or(Value::Null);
    canonicalize_json(&a) == canonicalize_json(&b)
}

/// Diff two configs over their resolved upstream sets.
#[must_use]
pub fn diff_configs(old: &BridgeConfig, new: &BridgeConfig) -> ConfigDiff {
    let old_servers = old.resolve_upstreams();
    let new_servers = new.resolve_upstreams();

    let mut servers = ServerDiff::default();
    for name in new_servers.keys() {
        if !old_servers.contains_key(name) {
            servers.added.push(name.clone());
        }
    }
    for (name, old_config) in &old_servers {
        let Some(new_config) = new_servers.get(name) else {
            servers.removed.push(name.clone());
            continue;
        };
        let old_identity = canonicalize_json(&connection_identity(old_config));
        let new_identity = canonicalize_json(&connection_identity(new_config));
        if old_identity != new_identity {
            servers.reconnect.push(name.clone());
        } else if !same_json(old_config, new_config) {
            servers.updated.push(name.clone());
        }
    }

    let mut bridge = BridgeSettingsDiff::default();
    let (ob, nb) = (&old.bridge, &new.bridge);
    if ob.log_level != nb.log_level {
        bridge.log_level = Some(nb.log_level);
    }
    if ob.health_check_interval != nb.health_check_interval {
        bridge.health_check_interval = Some(nb.health_check_interval);
    }
    if ob.tool_policy != nb.tool_policy {
        bridge.tool_policy = Some(nb.tool_policy);
    }
    if ob.port != nb.port {
        bridge.requires_restart.push("port".into());
    }
    if ob.log_format != nb.log_format {
        bridge.requires_restart.push("logFormat".into());
    }
    if ob.max_upstream_connections != nb.max_upstream_connections {
        bridge.requires_restart.push("maxUpstreamConnections".into());
    }
    if ob.connection_timeout != nb.connection_timeout {
        bridge.requires_restart.push("connectionTimeout".into());
    }
    if ob.idle_timeout != nb.idle_timeout {
        bridge.requires_restart.push("idleTimeout".into());
    }

    ConfigDiff { servers, bridge }
}
