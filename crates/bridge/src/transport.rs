//! Upstream transports.
//!
//! Builds one live MCP session per upstream from its config: a spawned
//! child process for STDIO servers, streamable HTTP or SSE for HTTP
//! servers. Sessions are produced through [`TransportFactory`] so tests can
//! inject scripted sessions into the client state machine.

use crate::client::SessionEventSink;
use crate::config::{ServerConfig, TransportConfig};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use crabeye_credential_store::{Credential, CredentialStore};
use rmcp::model::{
    CallToolRequestParams, CallToolResult, ClientInfo, ClientRequest, Extensions, PingRequest,
    PingRequestMethod, Tool,
};
use rmcp::service::{NotificationContext, RoleClient, RunningService};
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{ClientHandler, ServiceExt as _};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio_util::sync::CancellationToken;

/// One live MCP session with one upstream.
#[async_trait]
pub trait UpstreamSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<Tool>>;
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult>;
    /// One protocol round-trip; the caller applies the timeout.
    async fn ping(&self) -> Result<()>;
    async fn close(&self);
}

/// Creates sessions. Invoked exactly once per logical connect attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        config: &ServerConfig,
        sink: SessionEventSink,
    ) -> Result<Arc<dyn UpstreamSession>>;
}

/// Client handler for upstream connections: forwards `tools/list_changed`
/// notifications into the owning client, stamped with the session's epoch.
#[derive(Clone)]
struct BridgeClientHandler {
    sink: SessionEventSink,
}

impl ClientHandler for BridgeClientHandler {
    fn get_info(&self) -> ClientInfo {
        let mut info = ClientInfo::default();
        info.client_info.name = "crabeye-mcp-bridge".into();
        info.client_info.version = env!("CARGO_PKG_VERSION").into();
        info
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.sink.tools_list_changed();
    }
}

/// Session backed by an rmcp `RunningService`.
struct RmcpSession {
    source: String,
    peer: rmcp::service::Peer<RoleClient>,
    cancel: CancellationToken,
}

impl RmcpSession {
    fn new(
        source: &str,
        service: RunningService<RoleClient, BridgeClientHandler>,
        sink: SessionEventSink,
    ) -> Self {
        let peer = service.peer().clone();
        let cancel = service.cancellation_token();

        // The service future completes when the transport goes away, whether
        // the peer closed it or we cancelled it; the epoch stamp lets the
        // client tell the two apart.
        tokio::spawn(async move {
            let _ = service.waiting().await;
            sink.transport_closed();
        });

        Self {
            source: source.to_string(),
            peer,
            cancel,
        }
    }
}

#[async_trait]
impl UpstreamSession for RmcpSession {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        self.peer
            .list_all_tools()
            .await
            .map_err(|e| BridgeError::Connection(format!("tools/list failed: {e}")))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult> {
        self.peer
            .call_tool(CallToolRequestParams {
                name: name.to_string().into(),
                arguments,
                task: None,
                meta: None,
            })
            .await
            .map_err(|e| BridgeError::Upstream {
                source: self.source.clone(),
                message: e.to_string(),
            })
    }

    async fn ping(&self) -> Result<()> {
        self.peer
            .send_request(ClientRequest::PingRequest(PingRequest {
                method: PingRequestMethod,
                extensions: Extensions::default(),
            }))
            .await
            .map_err(|e| BridgeError::Connection(format!("ping failed: {e}")))?;
        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

/// Production factory: real rmcp transports per the server config.
pub struct RmcpTransportFactory {
    connect_timeout: Duration,
    credentials: Option<Arc<CredentialStore>>,
}

impl RmcpTransportFactory {
    #[must_use]
    pub fn new(connect_timeout: Duration, credentials: Option<Arc<CredentialStore>>) -> Self {
        Self {
            connect_timeout,
            credentials,
        }
    }

    fn bearer_token(&self, name: &str, key: &str) -> Result<String> {
        let Some(store) = &self.credentials else {
            return Err(BridgeError::Config(format!(
                "{name} references credential \"{key}\" but no credential store is available"
            )));
        };
        match store.get(key) {
            Ok(Some(Credential::Bearer { token })) => Ok(token),
            Ok(Some(Credential::Oauth2 { .. })) => Err(BridgeError::Config(format!(
                "credential \"{key}\" is an oauth2 credential; only bearer credentials can be attached as headers"
            ))),
            Ok(None) => Err(BridgeError::Config(format!(
                "credential \"{key}\" not found in the credential store"
            ))),
            Err(e) => Err(BridgeError::Config(format!(
                "cannot read credential \"{key}\": {e}"
            ))),
        }
    }

    fn build_headers(&self, name: &str, config: &ServerConfig) -> Result<reqwest::header::HeaderMap> {
        use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};

        let TransportConfig::Http(http) = &config.transport else {
            return Ok(HeaderMap::new());
        };

        let mut headers = HeaderMap::new();
        for (key, value) in &http.headers {
            if let Ok(n) = HeaderName::from_bytes(key.as_bytes())
                && let Ok(v) = HeaderValue::from_str(value)
            {
                headers.insert(n, v);
            } else {
                tracing::warn!(server = %name, header = %key, "skipping invalid header");
            }
        }

        if let Some(key) = config.bridge.as_ref().and_then(|b| b.credential_key()) {
            let token = self.bearer_token(name, key)?;
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, v);
            }
        }
        Ok(headers)
    }

    async fn connect_stdio(
        &self,
        name: &str,
        stdio: &crate::config::StdioConfig,
        sink: SessionEventSink,
    ) -> Result<RunningService<RoleClient, BridgeClientHandler>> {
        let mut cmd = tokio::process::Command::new(&stdio.command);
        cmd.args(&stdio.args);
        for (key, value) in &stdio.env {
            cmd.env(key, value);
        }

        let (transport, stderr) = TokioChildProcess::builder(cmd)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BridgeError::Connection(format!("failed to spawn {}: {e}", stdio.command))
            })?;

        if let Some(stderr) = stderr {
            spawn_stderr_logger(name.to_string(), stderr);
        }

        let handler = BridgeClientHandler { sink };
        self.serve_with_timeout(name, handler.serve(transport)).await
    }

    async fn connect_http(
        &self,
        name: &str,
        config: &ServerConfig,
        http: &crate::config::HttpConfig,
        sink: SessionEventSink,
    ) -> Result<RunningService<RoleClient, BridgeClientHandler>> {
        let headers = self.build_headers(name, config)?;
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| BridgeError::Connection(format!("failed to build HTTP client: {e}")))?;

        let handler = BridgeClientHandler { sink };
        if http.is_sse() {
            let transport = SseClientTransport::start_with_client(
                client,
                SseClientConfig {
                    sse_endpoint: http.url.clone().into(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BridgeError::Connection(format!("SSE transport failed: {e}")))?;
            self.serve_with_timeout(name, handler.serve(transport)).await
        } else {
            if http.has_unknown_type() {
                tracing::debug!(
                    server = %name,
                    transport_type = ?http.transport_type,
                    "unknown transport type, using streamable-http"
                );
            }
            let transport = StreamableHttpClientTransport::with_client(
                client,
                StreamableHttpClientTransportConfig::with_uri(http.url.clone()),
            );
            self.serve_with_timeout(name, handler.serve(transport)).await
        }
    }

    async fn serve_with_timeout<F, E>(
        &self,
        name: &str,
        serving: F,
    ) -> Result<RunningService<RoleClient, BridgeClientHandler>>
    where
        F: Future<Output = std::result::Result<RunningService<RoleClient, BridgeClientHandler>, E>>,
        E: std::fmt::Display,
    {
        match tokio::time::timeout(self.connect_timeout, serving).await {
            Ok(Ok(service)) => Ok(service),
            Ok(Err(e)) => Err(BridgeError::Connection(format!(
                "initialize failed for {name}: {e}"
            ))),
            Err(_) => Err(BridgeError::Connection(format!(
                "connect to {name} timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }
}

#[async_trait]
impl TransportFactory for RmcpTransportFactory {
    async fn connect(
        &self,
        name: &str,
        config: &ServerConfig,
        sink: SessionEventSink,
    ) -> Result<Arc<dyn UpstreamSession>> {
        let service = match &config.transport {
            TransportConfig::Stdio(stdio) => self.connect_stdio(name, stdio, sink.clone()).await?,
            TransportConfig::Http(http) => {
                self.connect_http(name, config, http, sink.clone()).await?
            }
        };
        Ok(Arc::new(RmcpSession::new(name, service, sink)))
    }
}

/// Forward a child's stderr to the log, one line at a time.
fn spawn_stderr_logger(name: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %name, "{line}");
        }
    });
}
