//! The upstream manager: owns the set of clients and the health loop.
//!
//! Wires every client's discoveries into the registry (under namespaced
//! tool names), fans connects and closes out concurrently, applies config
//! diffs phase by phase, and pings connected upstreams on a timer,
//! recycling any client that fails three pings in a row.

use crate::client::{ClientFactory, ConnectionStatus, ManagedClient};
use crate::config::{BridgeConfig, ServerConfig};
use crate::diff::ConfigDiff;
use crate::error::Result;
use crate::observers::Subscription;
use crate::registry::{ToolRegistry, namespace_tools};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Consecutive ping failures before a client is recycled.
pub const UNHEALTHY_THRESHOLD: u32 = 3;
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Result of `connect_all`.
#[derive(Debug, Default)]
pub struct ConnectSummary {
    pub total: usize,
    pub connected: usize,
    /// `(upstream name, error message)` per failed connect.
    pub failed: Vec<(String, String)>,
}

/// Read-only per-upstream snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub name: String,
    pub status: ConnectionStatus,
    pub health: HealthState,
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ping_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct HealthRecord {
    consecutive_failures: u32,
    health: HealthState,
    last_ping_at: Option<DateTime<Utc>>,
}

struct ClientEntry {
    client: Arc<dyn ManagedClient>,
    _subscriptions: Vec<Subscription>,
}

#[derive(Default)]
struct ManagerState {
    clients: HashMap<String, ClientEntry>,
    health: HashMap<String, HealthRecord>,
    health_task: Option<tokio::task::JoinHandle<()>>,
}

pub struct UpstreamManager {
    registry: Arc<ToolRegistry>,
    factory: Arc<dyn ClientFactory>,
    config: Mutex<BridgeConfig>,
    state: Mutex<ManagerState>,
    /// Upstreams with a ping outstanding; the next tick skips them.
    pings_in_flight: Arc<Mutex<HashSet<String>>>,
    this: Weak<UpstreamManager>,
}

impl UpstreamManager {
    pub fn new(
        registry: Arc<ToolRegistry>,
        factory: Arc<dyn ClientFactory>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            registry,
            factory,
            config: Mutex::new(config),
            state: Mutex::new(ManagerState::default()),
            pings_in_flight: Arc::new(Mutex::new(HashSet::new())),
            this: this.clone(),
        })
    }

    #[must_use]
    pub fn current_config(&self) -> BridgeConfig {
        self.config.lock().clone()
    }

    /// Create a client for `name`, wire its observers into the registry and
    /// store it. Does not connect.
    fn add_client(&self, name: &str, server: &ServerConfig) -> Arc<dyn ManagedClient> {
        let client = self.factory.create(name, server);

        let mut subscriptions = Vec::new();
        {
            let registry = Arc::clone(&self.registry);
            let source = name.to_string();
            subscriptions.push(client.on_tools_changed(Box::new(move |tools| {
                registry.set_tools_for_source(
                    &source,
                    namespace_tools(&source, tools.to_vec()),
                );
            })));
        }
        {
            let registry = Arc::clone(&self.registry);
            let source = name.to_string();
            subscriptions.push(client.on_status_change(Box::new(move |event| {
                if event.current == ConnectionStatus::Error {
                    tracing::error!(
                        server = %source,
                        error = ?event.error,
                        "upstream entered error state, dropping its tools"
                    );
                    registry.remove_source(&source);
                }
            })));
        }

        if let Some(category) = server.category() {
            self.registry.set_category_for_source(name, category);
        }

        let mut state = self.state.lock();
        state.health.insert(name.to_string(), HealthRecord::default());
        state.clients.insert(
            name.to_string(),
            ClientEntry {
                client: Arc::clone(&client),
                _subscriptions: subscriptions,
            },
        );
        client
    }

    /// Resolve the configured upstream set, create all clients and connect
    /// them concurrently. Individual failures never abort the rest.
    pub async fn connect_all(&self) -> ConnectSummary {
        let resolved = self.config.lock().resolve_upstreams();

        let mut clients = Vec::with_capacity(resolved.len());
        for (name, server) in &resolved {
            clients.push((name.clone(), self.add_client(name, server)));
        }

        let results = join_all(clients.iter().map(|(name, client)| {
            let client = Arc::clone(client);
            let name = name.clone();
            async move { (name, client.connect().await) }
        }))
        .await;

        let mut summary = ConnectSummary {
            total: results.len(),
            ..Default::default()
        };
        for (name, result) in results {
            match result {
                Ok(()) => summary.connected += 1,
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "initial connect failed");
                    summary.failed.push((name, e.to_string()));
                }
            }
        }

        let interval = self.config.lock().bridge.health_check_interval;
        self.start_health_checks(interval);
        summary
    }

    /// Stop the health loop, drop all observers, close every client
    /// concurrently and purge the registry.
    pub async fn close_all(&self) {
        self.stop_health_checks();

        let clients: Vec<(String, Arc<dyn ManagedClient>)> = {
            let mut state = self.state.lock();
            state.health.clear();
            state
                .clients
                .drain()
                .map(|(name, entry)| {
                    let ClientEntry {
                        client,
                        _subscriptions: subscriptions,
                    } = entry;
                    drop(subscriptions);
                    (name, client)
                })
                .collect()
        };

        join_all(clients.iter().map(|(_, client)| client.close())).await;

        for (name, _) in &clients {
            self.registry.remove_source(name);
            self.registry.remove_category_for_source(name);
        }
    }

    /// Apply a config diff: close removed upstreams, recycle reconnects,
    /// add new ones, then apply metadata-only updates.
    pub async fn apply_config_diff(&self, diff: &ConfigDiff, new_config: BridgeConfig) {
        let resolved = new_config.resolve_upstreams();

        for name in &diff.servers.removed {
            if let Some(entry) = self.remove_entry(name) {
                entry.client.close().await;
            }
            self.registry.remove_source(name);
            self.registry.remove_category_for_source(name);
            tracing::info!(server = %name, "upstream removed");
        }

        for name in &diff.servers.reconnect {
            if let Some(entry) = self.remove_entry(name) {
                entry.client.close().await;
            }
            self.registry.remove_source(name);
            let Some(server) = resolved.get(name) else { continue };
            let client = self.add_client(name, server);
            if let Err(e) = client.connect().await {
                tracing::warn!(server = %name, error = %e, "reconnect with new config failed");
            } else {
                tracing::info!(server = %name, "upstream reconnected with new config");
            }
        }

        for name in &diff.servers.added {
            let Some(server) = resolved.get(name) else { continue };
            let client = self.add_client(name, server);
            if let Err(e) = client.connect().await {
                tracing::warn!(server = %name, error = %e, "connect failed for added upstream");
            } else {
                tracing::info!(server = %name, "upstream added");
            }
        }

        for name in &diff.servers.updated {
            let Some(server) = resolved.get(name) else { continue };
            match server.category() {
                Some(category) => self.registry.set_category_for_source(name, category),
                None => self.registry.remove_category_for_source(name),
            }
            tracing::info!(server = %name, "upstream metadata updated");
        }

        *self.config.lock() = new_config;
    }

    fn remove_entry(&self, name: &str) -> Option<ClientEntry> {
        let mut state = self.state.lock();
        state.health.remove(name);
        state.clients.remove(name)
    }

    #[must_use]
    pub fn get_client(&self, name: &str) -> Option<Arc<dyn ManagedClient>> {
        self.state
            .lock()
            .clients
            .get(name)
            .map(|entry| Arc::clone(&entry.client))
    }

    #[must_use]
    pub fn get_statuses(&self) -> Vec<UpstreamStatus> {
        let state = self.state.lock();
        let mut statuses: Vec<UpstreamStatus> = state
            .clients
            .iter()
            .map(|(name, entry)| {
                let record = state.health.get(name);
                UpstreamStatus {
                    name: name.clone(),
                    status: entry.client.status(),
                    health: record.map_or(HealthState::Unknown, |r| r.health),
                    tool_count: entry.client.tools().len(),
                    last_ping_at: record.and_then(|r| r.last_ping_at),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Start the periodic health loop; `interval` in seconds, 0 disables.
    pub fn start_health_checks(&self, interval: u64) {
        if interval == 0 {
            return;
        }
        let mut state = self.state.lock();
        if state.health_task.is_some() {
            return;
        }
        let this = self.this.clone();
        tracing::info!(interval_secs = interval, "starting health checks");
        state.health_task = Some(tokio::spawn(async move {
            let period = Duration::from_secs(interval);
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(manager) = this.upgrade() else { return };
                manager.run_health_pass();
            }
        }));
    }

    pub fn stop_health_checks(&self) {
        if let Some(task) = self.state.lock().health_task.take() {
            task.abort();
        }
    }

    /// Stop and restart the loop with a new period.
    pub fn restart_health_checks(&self, interval: u64) {
        self.stop_health_checks();
        self.start_health_checks(interval);
    }

    /// One tick: ping every connected client without an outstanding ping.
    fn run_health_pass(&self) {
        let clients: Vec<(String, Arc<dyn ManagedClient>)> = {
            let state = self.state.lock();
            state
                .clients
                .iter()
                .map(|(name, entry)| (name.clone(), Arc::clone(&entry.client)))
                .collect()
        };

        for (name, client) in clients {
            if client.status() != ConnectionStatus::Connected {
                continue;
            }
            if !self.pings_in_flight.lock().insert(name.clone()) {
                // Previous ping still outstanding.
                continue;
            }

            let this = self.this.clone();
            let in_flight = Arc::clone(&self.pings_in_flight);
            tokio::spawn(async move {
                let result = client.ping(PING_TIMEOUT).await;
                in_flight.lock().remove(&name);
                let Some(manager) = this.upgrade() else { return };
                manager.record_ping_result(&name, client, result).await;
            });
        }
    }

    async fn record_ping_result(
        &self,
        name: &str,
        client: Arc<dyn ManagedClient>,
        result: Result<()>,
    ) {
        let reconnect_due = {
            let mut state = self.state.lock();
            let Some(record) = state.health.get_mut(name) else {
                // Client was removed while the ping was in flight.
                return;
            };
            match &result {
                Ok(()) => {
                    if record.health == HealthState::Unhealthy {
                        tracing::info!(server = %name, "upstream recovered");
                    }
                    record.consecutive_failures = 0;
                    record.health = HealthState::Healthy;
                    record.last_ping_at = Some(Utc::now());
                    false
                }
                Err(e) => {
                    record.consecutive_failures += 1;
                    record.health = HealthState::Unhealthy;
                    tracing::warn!(
                        server = %name,
                        failures = record.consecutive_failures,
                        error = %e,
                        "health ping failed"
                    );
                    if record.consecutive_failures >= UNHEALTHY_THRESHOLD {
                        tracing::error!(
                            server = %name,
                            "unhealthy threshold reached, recycling connection"
                        );
                        record.consecutive_failures = 0;
                        record.health = HealthState::Unknown;
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if reconnect_due && let Err(e) = client.reconnect().await {
            tracing::warn!(server = %name, error = %e, "health-triggered reconnect failed");
        }
    }
}
