//! Tool-call policy resolution and enforcement.
//!
//! Policies cascade per-tool -> per-server -> global. `prompt` asks the
//! downstream user through MCP elicitation before the call proceeds.

use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolPolicy {
    #[default]
    Always,
    Prompt,
    Never,
}

/// Outcome of asking the downstream user for confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElicitOutcome {
    Accepted,
    Declined,
    Cancelled,
}

/// Asks the downstream user to confirm a tool call.
///
/// The bridge server backs this with an MCP elicitation request; tests
/// script the answer.
#[async_trait]
pub trait ElicitUser: Send + Sync {
    /// Returns an error when the downstream client cannot answer (no
    /// elicitation support, transport failure).
    async fn confirm(&self, message: &str) -> Result<ElicitOutcome>;
}

#[derive(Debug, Default)]
struct ServerPolicies {
    default: Option<ToolPolicy>,
    tools: HashMap<String, ToolPolicy>,
}

#[derive(Debug, Default)]
struct PolicyState {
    global: ToolPolicy,
    servers: HashMap<String, ServerPolicies>,
}

/// Resolves and enforces tool-call policies.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    state: RwLock<PolicyState>,
}

impl PolicyEngine {
    #[must_use]
    pub fn new(global: ToolPolicy) -> Self {
        Self {
            state: RwLock::new(PolicyState {
                global,
                servers: HashMap::new(),
            }),
        }
    }

    /// Atomically replace all policy state from a resolved upstream table.
    pub fn update(&self, global: ToolPolicy, servers: &BTreeMap<String, ServerConfig>) {
        let mut next = PolicyState {
            global,
            servers: HashMap::new(),
        };
        for (name, config) in servers {
            let Some(meta) = &config.bridge else { continue };
            if meta.tool_policy.is_none() && meta.tools.is_empty() {
                continue;
            }
            next.servers.insert(
                name.clone(),
                ServerPolicies {
                    default: meta.tool_policy,
                    tools: meta.tools.clone(),
                },
            );
        }
        *self.state.write() = next;
    }

    /// Cascade lookup: per-tool entry, else per-server default, else global.
    #[must_use]
    pub fn resolve(&self, source: &str, tool_name: &str) -> ToolPolicy {
        let state = self.state.read();
        if let Some(server) = state.servers.get(source) {
            if let Some(policy) = server.tools.get(tool_name) {
                return *policy;
            }
            if let Some(policy) = server.default {
                return policy;
            }
        }
        state.global
    }

    /// Enforce the resolved policy for one call, prompting through `elicit`
    /// when required.
    pub async fn enforce(
        &self,
        source: &str,
        tool_name: &str,
        arguments: Option<&serde_json::Map<String, serde_json::Value>>,
        elicit: &dyn ElicitUser,
    ) -> Result<()> {
        match self.resolve(source, tool_name) {
            ToolPolicy::Always => Ok(()),
            ToolPolicy::Never => Err(BridgeError::Policy(format!(
                "tool \"{tool_name}\" on upstream \"{source}\" is disabled by policy"
            ))),
            ToolPolicy::Prompt => {
                let args_pretty = arguments
                    .map(|a| {
                        serde_json::to_string_pretty(a).unwrap_or_else(|_| "{}".to_string())
                    })
                    .unwrap_or_else(|| "{}".to_string());
                let message = format!(
                    "Allow tool call \"{tool_name}\" on upstream \"{source}\"?\n\nArguments:\n{args_pretty}"
                );
                match elicit.confirm(&message).await {
                    Ok(ElicitOutcome::Accepted) => Ok(()),
                    Ok(ElicitOutcome::Declined | ElicitOutcome::Cancelled) => {
                        Err(BridgeError::Policy(format!(
                            "tool call \"{tool_name}\" declined by user"
                        )))
                    }
                    Err(e) => Err(BridgeError::Policy(format!(
                        "tool \"{tool_name}\" requires confirmation but the client does not support elicitation: {e}"
                    ))),
                }
            }
        }
    }
}
