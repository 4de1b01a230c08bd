//! Shared test doubles: scripted transports, sessions and clients.

use crate::client::{
    ConnectionStatus, ManagedClient, SessionEventSink, StatusChange,
};
use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};
use crate::observers::{Observers, Subscription};
use crate::transport::{TransportFactory, UpstreamSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use rmcp::model::{CallToolResult, Tool};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub fn tool(name: &str) -> Tool {
    tool_with_description(name, &format!("{name} test tool"))
}

pub fn tool_with_description(name: &str, description: &str) -> Tool {
    serde_json::from_value(json!({
        "name": name,
        "description": description,
        "inputSchema": { "type": "object", "properties": {} }
    }))
    .expect("test tool definition")
}

pub fn stdio_config(command: &str) -> ServerConfig {
    serde_json::from_value(json!({ "command": command })).expect("test server config")
}

/// Scripted session handed out by [`MockTransportFactory`].
pub struct MockSession {
    pub tools: Mutex<Vec<Tool>>,
    pub closed: AtomicBool,
    pub ping_count: AtomicUsize,
    pub ping_hangs: bool,
    pub calls: Mutex<Vec<(String, Option<serde_json::Map<String, serde_json::Value>>)>>,
}

#[async_trait]
impl UpstreamSession for MockSession {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        Ok(self.tools.lock().clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult> {
        self.calls.lock().push((name.to_string(), arguments));
        Ok(CallToolResult {
            content: vec![rmcp::model::Content::text(format!("called {name}"))],
            structured_content: None,
            is_error: Some(false),
            meta: None,
        })
    }

    async fn ping(&self) -> Result<()> {
        self.ping_count.fetch_add(1, Ordering::SeqCst);
        if self.ping_hangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Transport factory with scriptable behavior and full call accounting.
pub struct MockTransportFactory {
    tools: Mutex<Vec<Tool>>,
    failing: AtomicBool,
    connect_delay: Option<Duration>,
    ping_hangs: bool,
    connects: AtomicUsize,
    sinks: Mutex<Vec<SessionEventSink>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockTransportFactory {
    pub fn with_tools(tools: Vec<Tool>) -> Self {
        Self {
            tools: Mutex::new(tools),
            failing: AtomicBool::new(false),
            connect_delay: None,
            ping_hangs: false,
            connects: AtomicUsize::new(0),
            sinks: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        let factory = Self::with_tools(Vec::new());
        factory.failing.store(true, Ordering::SeqCst);
        factory
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn with_hanging_ping(mut self) -> Self {
        self.ping_hangs = true;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_tools(&self, tools: Vec<Tool>) {
        for session in self.sessions.lock().iter() {
            *session.tools.lock() = tools.clone();
        }
        *self.tools.lock() = tools;
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_sink(&self) -> Option<SessionEventSink> {
        self.sinks.lock().last().cloned()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().last().cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn connect(
        &self,
        _name: &str,
        _config: &ServerConfig,
        sink: SessionEventSink,
    ) -> Result<Arc<dyn UpstreamSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().push(sink);

        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection("scripted connect failure".into()));
        }

        let session = Arc::new(MockSession {
            tools: Mutex::new(self.tools.lock().clone()),
            closed: AtomicBool::new(false),
            ping_count: AtomicUsize::new(0),
            ping_hangs: self.ping_hangs,
            calls: Mutex::new(Vec::new()),
        });
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

/// Scripted [`ManagedClient`] for manager and server tests.
pub struct MockClient {
    pub name: String,
    pub status: Mutex<ConnectionStatus>,
    pub tools: Mutex<Vec<Tool>>,
    pub connect_fails: AtomicBool,
    pub call_fails: AtomicBool,
    pub ping_fails: AtomicBool,
    pub ping_hangs: AtomicBool,
    pub connect_count: AtomicUsize,
    pub reconnect_count: AtomicUsize,
    pub close_count: AtomicUsize,
    pub ping_count: AtomicUsize,
    pub calls: Mutex<Vec<(String, Option<serde_json::Map<String, serde_json::Value>>)>>,
    pub status_changed: Observers<StatusChange>,
    pub tools_changed: Observers<Vec<Tool>>,
}

impl MockClient {
    pub fn new(name: &str, tools: Vec<Tool>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            status: Mutex::new(ConnectionStatus::Disconnected),
            tools: Mutex::new(tools),
            connect_fails: AtomicBool::new(false),
            call_fails: AtomicBool::new(false),
            ping_fails: AtomicBool::new(false),
            ping_hangs: AtomicBool::new(false),
            connect_count: AtomicUsize::new(0),
            reconnect_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            ping_count: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            status_changed: Observers::new(),
            tools_changed: Observers::new(),
        })
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        let previous = {
            let mut current = self.status.lock();
            let previous = *current;
            *current = status;
            previous
        };
        self.status_changed.emit(&StatusChange {
            previous,
            current: status,
            error: None,
        });
    }
}

#[async_trait]
impl ManagedClient for MockClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    fn tools(&self) -> Vec<Tool> {
        self.tools.lock().clone()
    }

    async fn connect(&self) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        if self.connect_fails.load(Ordering::SeqCst) {
            *self.status.lock() = ConnectionStatus::Disconnected;
            return Err(BridgeError::Connection("scripted failure".into()));
        }
        *self.status.lock() = ConnectionStatus::Connected;
        self.tools_changed.emit(&self.tools.lock().clone());
        Ok(())
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnect_count.fetch_add(1, Ordering::SeqCst);
        self.connect().await
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        *self.status.lock() = ConnectionStatus::Disconnected;
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult> {
        if self.status() != ConnectionStatus::Connected {
            return Err(BridgeError::NotConnected(self.name.clone()));
        }
        if self.call_fails.load(Ordering::SeqCst) {
            return Err(BridgeError::Upstream {
                source: self.name.clone(),
                message: "scripted call failure".into(),
            });
        }
        self.calls.lock().push((name.to_string(), arguments.clone()));
        Ok(CallToolResult {
            content: vec![rmcp::model::Content::text(format!(
                "{}:{name}",
                self.name
            ))],
            structured_content: None,
            is_error: Some(false),
            meta: None,
        })
    }

    async fn ping(&self, _timeout: Duration) -> Result<()> {
        self.ping_count.fetch_add(1, Ordering::SeqCst);
        if self.ping_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.ping_fails.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection("scripted ping failure".into()));
        }
        Ok(())
    }

    fn on_status_change(
        &self,
        callback: Box<dyn Fn(&StatusChange) + Send + Sync>,
    ) -> Subscription {
        self.status_changed.subscribe(move |event| callback(event))
    }

    fn on_tools_changed(&self, callback: Box<dyn Fn(&[Tool]) + Send + Sync>) -> Subscription {
        self.tools_changed.subscribe(move |tools| callback(tools))
    }
}

/// Client factory returning pre-registered mocks, creating plain ones on
/// demand.
#[derive(Default)]
pub struct MockClientFactory {
    pub clients: Mutex<Vec<Arc<MockClient>>>,
    pub created: Mutex<Vec<String>>,
}

impl MockClientFactory {
    pub fn with_clients(clients: Vec<Arc<MockClient>>) -> Self {
        Self {
            clients: Mutex::new(clients),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn find(&self, name: &str) -> Option<Arc<MockClient>> {
        self.clients.lock().iter().find(|c| c.name == name).cloned()
    }
}

impl crate::client::ClientFactory for MockClientFactory {
    fn create(&self, name: &str, _config: &ServerConfig) -> Arc<dyn ManagedClient> {
        self.created.lock().push(name.to_string());
        if let Some(existing) = self.find(name) {
            return existing;
        }
        let client = MockClient::new(name, Vec::new());
        self.clients.lock().push(Arc::clone(&client));
        client
    }
}
