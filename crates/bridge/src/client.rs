//! One stateful connection to one upstream server.
//!
//! The client is a small state machine: `disconnected -> connecting ->
//! connected`, falling back to `disconnected` on any failure and entering a
//! terminal `error` state once reconnect attempts are exhausted. Every
//! connect attempt bumps an epoch counter; callbacks from a previous
//! session carry the old epoch and are dropped, so a late close or
//! tool-list notification can never corrupt the current session.

use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};
use crate::observers::{Observers, Subscription};
use crate::transport::{TransportFactory, UpstreamSession};
use async_trait::async_trait;
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use rmcp::model::{CallToolResult, Tool};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Delivered to status observers on every transition.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub previous: ConnectionStatus,
    pub current: ConnectionStatus,
    pub error: Option<String>,
}

/// Exponential backoff parameters for automatic reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Automatic attempts before the client enters the terminal `error`
    /// state. Explicit `reconnect()` resets the counter.
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectSettings {
    /// `min(base * 2^attempt, max)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// The surface the manager (and tests) program against.
#[async_trait]
pub trait ManagedClient: Send + Sync {
    fn name(&self) -> &str;
    fn status(&self) -> ConnectionStatus;
    fn tools(&self) -> Vec<Tool>;
    async fn connect(&self) -> Result<()>;
    /// Drop the current session (if any) and connect fresh. Clears the
    /// terminal `error` state.
    async fn reconnect(&self) -> Result<()>;
    /// Permanently close: cancels any pending reconnect and empties the
    /// tool list.
    async fn close(&self);
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult>;
    async fn ping(&self, timeout: Duration) -> Result<()>;
    fn on_status_change(&self, callback: Box<dyn Fn(&StatusChange) + Send + Sync>)
    -> Subscription;
    fn on_tools_changed(&self, callback: Box<dyn Fn(&[Tool]) + Send + Sync>) -> Subscription;
}

/// Builds clients; the manager goes through this so tests can substitute
/// scripted clients.
pub trait ClientFactory: Send + Sync {
    fn create(&self, name: &str, config: &ServerConfig) -> Arc<dyn ManagedClient>;
}

/// Production factory backed by [`UpstreamClient`].
pub struct UpstreamClientFactory {
    transport: Arc<dyn TransportFactory>,
    settings: ReconnectSettings,
}

impl UpstreamClientFactory {
    #[must_use]
    pub fn new(transport: Arc<dyn TransportFactory>, settings: ReconnectSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }
}

impl ClientFactory for UpstreamClientFactory {
    fn create(&self, name: &str, config: &ServerConfig) -> Arc<dyn ManagedClient> {
        UpstreamClient::new(
            name.to_string(),
            config.clone(),
            Arc::clone(&self.transport),
            self.settings.clone(),
        )
    }
}

/// Hands transport events back to the owning client, stamped with the epoch
/// of the session that produced them.
#[derive(Clone)]
pub struct SessionEventSink {
    client: Weak<UpstreamClient>,
    epoch: u64,
}

impl SessionEventSink {
    fn new(client: Weak<UpstreamClient>, epoch: u64) -> Self {
        Self { client, epoch }
    }

    /// The upstream announced `tools/list_changed`; re-fetch if the session
    /// is still current.
    pub fn tools_list_changed(&self) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let epoch = self.epoch;
        tokio::spawn(async move {
            client.refresh_tools(epoch).await;
        });
    }

    /// The transport went away.
    pub fn transport_closed(&self) {
        if let Some(client) = self.client.upgrade() {
            client.handle_transport_close(self.epoch);
        }
    }
}

type SharedConnect = Shared<BoxFuture<'static, std::result::Result<(), Arc<BridgeError>>>>;

struct ClientState {
    status: ConnectionStatus,
    epoch: u64,
    attempts: u32,
    closed: bool,
    tools: Vec<Tool>,
    session: Option<Arc<dyn UpstreamSession>>,
    pending_connect: Option<SharedConnect>,
    reconnect_timer: Option<tokio::task::JoinHandle<()>>,
}

pub struct UpstreamClient {
    name: String,
    config: ServerConfig,
    factory: Arc<dyn TransportFactory>,
    settings: ReconnectSettings,
    state: Mutex<ClientState>,
    status_changed: Observers<StatusChange>,
    tools_changed: Observers<Vec<Tool>>,
    this: Weak<UpstreamClient>,
}

impl UpstreamClient {
    pub fn new(
        name: String,
        config: ServerConfig,
        factory: Arc<dyn TransportFactory>,
        settings: ReconnectSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name,
            config,
            factory,
            settings,
            state: Mutex::new(ClientState {
                status: ConnectionStatus::Disconnected,
                epoch: 0,
                attempts: 0,
                closed: false,
                tools: Vec::new(),
                session: None,
                pending_connect: None,
                reconnect_timer: None,
            }),
            status_changed: Observers::new(),
            tools_changed: Observers::new(),
            this: this.clone(),
        })
    }

    /// Record a transition; returns the event to emit once the lock is
    /// released. Same-status transitions are silent.
    fn transition(
        &self,
        state: &mut ClientState,
        next: ConnectionStatus,
        error: Option<String>,
    ) -> Option<StatusChange> {
        let previous = state.status;
        if previous == next {
            return None;
        }
        state.status = next;
        tracing::debug!(
            server = %self.name,
            previous = ?previous,
            current = ?next,
            error = ?error,
            "status change"
        );
        Some(StatusChange {
            previous,
            current: next,
            error,
        })
    }

    async fn connect_impl(&self) -> Result<()> {
        let (shared, event) = {
            let mut state = self.state.lock();
            if state.status == ConnectionStatus::Connected {
                return Ok(());
            }
            if let Some(pending) = &state.pending_connect {
                // A second connect while one is in flight joins it; the
                // transport factory runs once per logical attempt.
                (pending.clone(), None)
            } else {
                let Some(this) = self.this.upgrade() else {
                    return Err(BridgeError::Connection("client is shutting down".into()));
                };
                state.closed = false;
                if let Some(timer) = state.reconnect_timer.take() {
                    timer.abort();
                }
                state.epoch += 1;
                let epoch = state.epoch;
                let event = self.transition(&mut state, ConnectionStatus::Connecting, None);
                let shared: SharedConnect = async move {
                    this.establish(epoch).await.map_err(Arc::new)
                }
                .boxed()
                .shared();
                state.pending_connect = Some(shared.clone());
                (shared, event)
            }
        };
        if let Some(event) = event {
            self.status_changed.emit(&event);
        }
        shared
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))
    }

    /// One logical connect attempt: transport, then immediate discovery.
    async fn establish(&self, epoch: u64) -> Result<()> {
        let sink = SessionEventSink::new(self.this.clone(), epoch);
        let attempt = self.factory.connect(&self.name, &self.config, sink).await;

        let outcome = match attempt {
            Ok(session) => match session.list_tools().await {
                Ok(tools) => Ok((session, tools)),
                Err(e) => {
                    session.close().await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok((session, tools)) => {
                let (event, stale, installed) = {
                    let mut state = self.state.lock();
                    if state.epoch != epoch || state.closed {
                        (None, Some(session), None)
                    } else {
                        state.pending_connect = None;
                        state.attempts = 0;
                        state.session = Some(session);
                        state.tools = tools.clone();
                        let event = self.transition(&mut state, ConnectionStatus::Connected, None);
                        (event, None, Some(tools))
                    }
                };
                if let Some(session) = stale {
                    session.close().await;
                    return Err(BridgeError::Connection("connect attempt superseded".into()));
                }
                if let Some(event) = event {
                    self.status_changed.emit(&event);
                }
                if let Some(tools) = installed {
                    tracing::info!(server = %self.name, tool_count = tools.len(), "connected");
                    self.tools_changed.emit(&tools);
                }
                Ok(())
            }
            Err(e) => {
                let (event, schedule) = {
                    let mut state = self.state.lock();
                    if state.epoch != epoch || state.closed {
                        (None, false)
                    } else {
                        state.pending_connect = None;
                        let event = self.transition(
                            &mut state,
                            ConnectionStatus::Disconnected,
                            Some(e.to_string()),
                        );
                        (event, true)
                    }
                };
                if let Some(event) = event {
                    self.status_changed.emit(&event);
                }
                if schedule {
                    tracing::warn!(server = %self.name, error = %e, "connect failed");
                    self.schedule_reconnect();
                }
                Err(e)
            }
        }
    }

    /// Arm the backoff timer, or enter the terminal `error` state when the
    /// attempt budget is spent. Never double-arms.
    fn schedule_reconnect(&self) {
        let (event, cleared) = {
            let mut state = self.state.lock();
            if state.closed
                || state.reconnect_timer.is_some()
                || state.status == ConnectionStatus::Error
            {
                return;
            }
            if state.attempts >= self.settings.max_attempts {
                state.session = None;
                let had_tools = !state.tools.is_empty();
                state.tools.clear();
                let event = self.transition(
                    &mut state,
                    ConnectionStatus::Error,
                    Some(format!(
                        "giving up after {} reconnect attempts",
                        self.settings.max_attempts
                    )),
                );
                (event, had_tools)
            } else {
                let delay = self.settings.delay_for_attempt(state.attempts);
                state.attempts += 1;
                let epoch = state.epoch;
                let this = self.this.clone();
                tracing::info!(
                    server = %self.name,
                    attempt = state.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                state.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(client) = this.upgrade() else { return };
                    let due = {
                        let mut state = client.state.lock();
                        if state.closed || state.epoch != epoch {
                            false
                        } else {
                            state.reconnect_timer = None;
                            true
                        }
                    };
                    if due {
                        let _ = client.connect_impl().await;
                    }
                }));
                return;
            }
        };
        if let Some(event) = event {
            self.status_changed.emit(&event);
        }
        if cleared {
            self.tools_changed.emit(&Vec::new());
        }
    }

    /// Transport-close callback from the session's waiting task.
    pub(crate) fn handle_transport_close(&self, epoch: u64) {
        let event = {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.closed {
                return;
            }
            if !matches!(
                state.status,
                ConnectionStatus::Connected | ConnectionStatus::Connecting
            ) {
                return;
            }
            state.session = None;
            self.transition(
                &mut state,
                ConnectionStatus::Disconnected,
                Some("transport closed".into()),
            )
        };
        if let Some(event) = event {
            self.status_changed.emit(&event);
        }
        self.schedule_reconnect();
    }

    /// `tools/list_changed` handler; re-fetches unless the epoch moved on.
    pub(crate) async fn refresh_tools(&self, epoch: u64) {
        let session = {
            let state = self.state.lock();
            if state.epoch != epoch || state.status != ConnectionStatus::Connected {
                return;
            }
            state.session.clone()
        };
        let Some(session) = session else { return };

        match session.list_tools().await {
            Ok(tools) => {
                let updated = {
                    let mut state = self.state.lock();
                    if state.epoch != epoch || state.status != ConnectionStatus::Connected {
                        None
                    } else {
                        state.tools = tools.clone();
                        Some(tools)
                    }
                };
                if let Some(tools) = updated {
                    self.tools_changed.emit(&tools);
                }
            }
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "tool refresh failed");
            }
        }
    }
}

#[async_trait]
impl ManagedClient for UpstreamClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    fn tools(&self) -> Vec<Tool> {
        self.state.lock().tools.clone()
    }

    async fn connect(&self) -> Result<()> {
        self.connect_impl().await
    }

    async fn reconnect(&self) -> Result<()> {
        let (session, timer, event) = {
            let mut state = self.state.lock();
            state.attempts = 0;
            state.closed = false;
            // Void callbacks from the session we are about to discard.
            state.epoch += 1;
            state.pending_connect = None;
            let session = state.session.take();
            let timer = state.reconnect_timer.take();
            let event = self.transition(&mut state, ConnectionStatus::Disconnected, None);
            (session, timer, event)
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(session) = session {
            session.close().await;
        }
        if let Some(event) = event {
            self.status_changed.emit(&event);
        }
        self.connect_impl().await
    }

    async fn close(&self) {
        let (session, timer, event, had_tools) = {
            let mut state = self.state.lock();
            state.closed = true;
            state.epoch += 1;
            state.pending_connect = None;
            state.attempts = 0;
            let timer = state.reconnect_timer.take();
            let session = state.session.take();
            let had_tools = !state.tools.is_empty();
            state.tools.clear();
            let event = self.transition(&mut state, ConnectionStatus::Disconnected, None);
            (session, timer, event, had_tools)
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(session) = session {
            session.close().await;
        }
        if let Some(event) = event {
            self.status_changed.emit(&event);
        }
        if had_tools {
            self.tools_changed.emit(&Vec::new());
        }
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult> {
        let session = {
            let state = self.state.lock();
            if state.status != ConnectionStatus::Connected {
                return Err(BridgeError::NotConnected(self.name.clone()));
            }
            state.session.clone()
        };
        let Some(session) = session else {
            return Err(BridgeError::NotConnected(self.name.clone()));
        };
        session.call_tool(name, arguments).await
    }

    async fn ping(&self, timeout: Duration) -> Result<()> {
        let session = {
            let state = self.state.lock();
            if state.status != ConnectionStatus::Connected {
                return Err(BridgeError::NotConnected(self.name.clone()));
            }
            state.session.clone()
        };
        let Some(session) = session else {
            return Err(BridgeError::NotConnected(self.name.clone()));
        };
        match tokio::time::timeout(timeout, session.ping()).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Connection(format!(
                "ping to \"{}\" timed out after {}ms",
                self.name,
                timeout.as_millis()
            ))),
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockSession, MockTransportFactory, stdio_config, tool};
    use std::sync::atomic::Ordering;

    fn test_settings() -> ReconnectSettings {
        ReconnectSettings {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            max_attempts: 2,
        }
    }

    fn client_with(factory: Arc<MockTransportFactory>) -> Arc<UpstreamClient> {
        UpstreamClient::new(
            "mock".to_string(),
            stdio_config("mock-server"),
            factory,
            test_settings(),
        )
    }

    #[tokio::test]
    async fn connect_discovers_tools_and_transitions() {
        let factory = Arc::new(MockTransportFactory::with_tools(vec![tool("a"), tool("b")]));
        let client = client_with(Arc::clone(&factory));

        let statuses = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let _sub = client.on_status_change(Box::new({
            let statuses = Arc::clone(&statuses);
            move |event| statuses.lock().push((event.previous, event.current))
        }));

        client.connect().await.expect("connect");

        assert_eq!(client.status(), ConnectionStatus::Connected);
        assert_eq!(client.tools().len(), 2);
        assert_eq!(factory.connect_count(), 1);
        assert_eq!(
            statuses.lock().clone(),
            vec![
                (ConnectionStatus::Disconnected, ConnectionStatus::Connecting),
                (ConnectionStatus::Connecting, ConnectionStatus::Connected),
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_factory_invocation() {
        let factory = Arc::new(
            MockTransportFactory::with_tools(vec![tool("a")])
                .with_connect_delay(Duration::from_millis(20)),
        );
        let client = client_with(Arc::clone(&factory));

        let (a, b, c) = tokio::join!(client.connect(), client.connect(), client.connect());
        a.expect("first connect");
        b.expect("second connect");
        c.expect("third connect");

        assert_eq!(factory.connect_count(), 1);
        assert_eq!(client.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn call_tool_fails_when_not_connected() {
        let factory = Arc::new(MockTransportFactory::with_tools(vec![]));
        let client = client_with(factory);

        let err = client
            .call_tool("anything", None)
            .await
            .expect_err("not connected");
        assert!(matches!(err, BridgeError::NotConnected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_close_triggers_backoff_reconnect() {
        let factory = Arc::new(MockTransportFactory::with_tools(vec![tool("a")]));
        let client = client_with(Arc::clone(&factory));

        client.connect().await.expect("connect");
        let sink = factory.last_sink().expect("sink captured");

        sink.transport_closed();
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        // Tools survive a transient disconnect.
        assert_eq!(client.tools().len(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(factory.connect_count(), 2);
        assert_eq!(client.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_epoch_callbacks_are_ignored() {
        let factory = Arc::new(MockTransportFactory::with_tools(vec![tool("a")]));
        let client = client_with(Arc::clone(&factory));

        client.connect().await.expect("connect");
        let old_sink = factory.last_sink().expect("first sink");

        client.close().await;
        client.connect().await.expect("second connect");
        assert_eq!(client.status(), ConnectionStatus::Connected);

        // Events stamped with the first epoch must not disturb the second
        // session.
        old_sink.transport_closed();
        old_sink.tools_list_changed();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(client.status(), ConnectionStatus::Connected);
        assert_eq!(client.tools().len(), 1);
        assert_eq!(factory.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_exhaustion_enters_terminal_error() {
        let factory = Arc::new(MockTransportFactory::failing());
        let client = client_with(Arc::clone(&factory));

        client.connect().await.expect_err("connect fails");
        assert_eq!(client.status(), ConnectionStatus::Disconnected);

        // base * 2^0 then base * 2^1, then the budget is spent.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(client.status(), ConnectionStatus::Error);
        assert_eq!(factory.connect_count(), 1 + test_settings().max_attempts as usize);

        // Terminal: no further attempts.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(factory.connect_count(), 1 + test_settings().max_attempts as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_reconnect_clears_error_state() {
        let factory = Arc::new(MockTransportFactory::failing());
        let client = client_with(Arc::clone(&factory));

        client.connect().await.expect_err("connect fails");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(client.status(), ConnectionStatus::Error);

        factory.set_failing(false);
        factory.set_tools(vec![tool("a")]);
        client.reconnect().await.expect("reconnect succeeds");
        assert_eq!(client.status(), ConnectionStatus::Connected);
        assert_eq!(client.tools().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_reconnect() {
        let factory = Arc::new(MockTransportFactory::failing());
        let client = client_with(Arc::clone(&factory));

        client.connect().await.expect_err("connect fails");
        assert_eq!(factory.connect_count(), 1);

        client.close().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(factory.connect_count(), 1);
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn close_empties_tools_and_notifies() {
        let factory = Arc::new(MockTransportFactory::with_tools(vec![tool("a")]));
        let client = client_with(factory);

        let last_tools = Arc::new(parking_lot::Mutex::new(None));
        let _sub = client.on_tools_changed(Box::new({
            let last_tools = Arc::clone(&last_tools);
            move |tools| *last_tools.lock() = Some(tools.len())
        }));

        client.connect().await.expect("connect");
        assert_eq!(*last_tools.lock(), Some(1));

        client.close().await;
        assert_eq!(*last_tools.lock(), Some(0));
        assert!(client.tools().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn list_changed_refreshes_tools_in_current_epoch() {
        let factory = Arc::new(MockTransportFactory::with_tools(vec![tool("a")]));
        let client = client_with(Arc::clone(&factory));

        client.connect().await.expect("connect");
        assert_eq!(client.tools().len(), 1);

        factory.set_tools(vec![tool("a"), tool("b")]);
        factory.last_sink().expect("sink").tools_list_changed();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(client.tools().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_applies_timeout() {
        let factory = Arc::new(MockTransportFactory::with_tools(vec![]).with_hanging_ping());
        let client = client_with(Arc::clone(&factory));
        client.connect().await.expect("connect");

        let err = client
            .ping(Duration::from_millis(50))
            .await
            .expect_err("ping must time out");
        assert!(err.to_string().contains("timed out"));

        let session = factory.last_session().expect("session");
        assert_eq!(session.ping_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_delays_are_monotonic_and_capped() {
        let settings = ReconnectSettings {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(750),
            max_attempts: 10,
        };
        let delays: Vec<Duration> = (0..8).map(|a| settings.delay_for_attempt(a)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "delays must be non-decreasing");
        }
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(750));
    }

    #[tokio::test]
    async fn second_session_tools_are_refetched_not_cached() {
        let factory = Arc::new(MockTransportFactory::with_tools(vec![tool("a")]));
        let client = client_with(Arc::clone(&factory));

        client.connect().await.expect("connect");
        client.close().await;

        factory.set_tools(vec![tool("x"), tool("y"), tool("z")]);
        client.connect().await.expect("reconnect");
        assert_eq!(client.tools().len(), 3);

        // The first session was explicitly closed.
        assert!(factory.sessions()[0].closed.load(Ordering::SeqCst));
    }
}
