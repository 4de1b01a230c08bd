//! The downstream face of the bridge.
//!
//! Terminates one MCP session over stdio. Advertises the search service's
//! visible tool set, dispatches `search_tools` and `run_tool`, routes
//! namespaced tool calls to the owning upstream, and forwards list-changed
//! events downstream as `tools/list_changed` notifications.

use crate::error::{BridgeError, Result as BridgeResult};
use crate::manager::UpstreamManager;
use crate::names::split_namespaced;
use crate::observers::Subscription;
use crate::policy::{ElicitOutcome, ElicitUser, PolicyEngine};
use crate::registry::ToolRegistry;
use crate::search::{
    RUN_TOOL_NAME, SEARCH_TOOLS_NAME, SearchToolsParams, ToolSearchService, validate_params,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, CreateElicitationRequestParam, ErrorData,
    ElicitationAction, Implementation, InitializeRequestParams, InitializeResult, ListToolsResult,
    PaginatedRequestParams, ServerCapabilities, ServerInfo, Tool, ToolsCapability,
};
use rmcp::service::{Peer, RequestContext, RoleServer};
use serde_json::{Map, Value, json};
use std::sync::{Arc, Weak};

/// The MCP server the downstream client talks to.
#[derive(Clone)]
pub struct BridgeServer {
    inner: Arc<BridgeServerInner>,
}

struct BridgeServerInner {
    registry: Arc<ToolRegistry>,
    search: Option<Arc<ToolSearchService>>,
    manager: Arc<UpstreamManager>,
    policy: Arc<PolicyEngine>,
    peers: RwLock<Vec<Peer<RoleServer>>>,
    _subscriptions: Mutex<Vec<Subscription>>,
}

impl BridgeServer {
    /// Build the server and subscribe to whichever change feed is active:
    /// the search service's visible set, or the raw registry as fallback.
    pub fn new(
        registry: Arc<ToolRegistry>,
        search: Option<Arc<ToolSearchService>>,
        manager: Arc<UpstreamManager>,
        policy: Arc<PolicyEngine>,
    ) -> Self {
        let inner = Arc::new(BridgeServerInner {
            registry,
            search,
            manager,
            policy,
            peers: RwLock::new(Vec::new()),
            _subscriptions: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = match &inner.search {
            Some(search) => search.on_visible_tools_changed(move || {
                BridgeServerInner::schedule_list_changed(&weak);
            }),
            None => inner.registry.on_changed(move || {
                BridgeServerInner::schedule_list_changed(&weak);
            }),
        };
        inner._subscriptions.lock().push(subscription);

        Self { inner }
    }

    /// The tool list advertised via `tools/list`.
    #[must_use]
    pub fn advertised_tools(&self) -> Vec<Tool> {
        match &self.inner.search {
            Some(search) => search.visible_tools(),
            None => self.inner.registry.list_tools(),
        }
    }

    /// Serve the downstream MCP session on stdio until the client
    /// disconnects or the process receives a shutdown signal.
    pub async fn serve_stdio(self) -> BridgeResult<()> {
        use rmcp::ServiceExt as _;
        use rmcp::transport::io::stdio;

        let service = self.serve(stdio()).await.map_err(|e| {
            BridgeError::Connection(format!("failed to start downstream session: {e}"))
        })?;
        let cancel = service.cancellation_token();
        let mut waiting = tokio::spawn(service.waiting());

        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                cancel.cancel();
                let _ = waiting.await;
            }
            result = &mut waiting => {
                tracing::info!("downstream client disconnected");
                let _ = result;
            }
        }
        Ok(())
    }

    /// Dispatch one `tools/call`. Factored off the handler so tests can
    /// drive it with a scripted elicitation channel.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        elicit: &dyn ElicitUser,
    ) -> Result<CallToolResult, ErrorData> {
        match name {
            SEARCH_TOOLS_NAME => self.handle_search_tools(arguments),
            RUN_TOOL_NAME => {
                let Some(args) = arguments else {
                    return Err(ErrorData::invalid_params(
                        "run_tool requires a \"name\" argument",
                        None,
                    ));
                };
                let Some(target) = args.get("name").and_then(Value::as_str) else {
                    return Err(ErrorData::invalid_params(
                        "run_tool requires a \"name\" string argument",
                        None,
                    ));
                };
                let forwarded = match args.get("arguments") {
                    None | Some(Value::Null) => None,
                    Some(Value::Object(map)) => Some(map.clone()),
                    Some(_) => {
                        return Err(ErrorData::invalid_params(
                            "run_tool \"arguments\" must be an object",
                            None,
                        ));
                    }
                };
                self.route_call(target, forwarded, elicit).await
            }
            direct => {
                if self.inner.registry.get_tool(direct).is_none() {
                    return Err(ErrorData::invalid_params(
                        format!("unknown tool: {direct}"),
                        None,
                    ));
                }
                self.route_call(direct, arguments, elicit).await
            }
        }
    }

    fn handle_search_tools(
        &self,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, ErrorData> {
        // Parameter-shape problems come back as tool output, not protocol
        // errors, so the model can correct itself and retry.
        let Some(args) = arguments else {
            return Ok(error_text("search_tools requires a \"queries\" array"));
        };
        let params: SearchToolsParams = match serde_json::from_value(Value::Object(args)) {
            Ok(params) => params,
            Err(e) => {
                return Ok(error_text(format!("invalid search_tools parameters: {e}")));
            }
        };
        if let Err(message) = validate_params(&params) {
            return Ok(error_text(message));
        }
        let Some(search) = &self.inner.search else {
            return Ok(error_text("tool search is not enabled on this bridge"));
        };

        let response = search.search(&params);
        let text = serde_json::to_string(&response)
            .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
        Ok(success_text(text))
    }

    async fn route_call(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        elicit: &dyn ElicitUser,
    ) -> Result<CallToolResult, ErrorData> {
        let Some((source, tool_name)) = split_namespaced(name) else {
            return Err(ErrorData::invalid_params(
                format!("tool name \"{name}\" is not namespaced (expected <server>__<tool>)"),
                None,
            ));
        };

        self.inner
            .policy
            .enforce(source, tool_name, arguments.as_ref(), elicit)
            .await
            .map_err(|e| ErrorData::invalid_request(e.to_string(), None))?;

        let Some(client) = self.inner.manager.get_client(source) else {
            return Err(ErrorData::internal_error(
                format!("unknown upstream \"{source}\" for tool \"{name}\""),
                None,
            ));
        };

        // The upstream sees the original, non-namespaced tool name; its
        // response passes through verbatim.
        client
            .call_tool(tool_name, arguments)
            .await
            .map_err(|e| ErrorData::internal_error(e.to_string(), None))
    }
}

impl BridgeServerInner {
    /// Observers run synchronously; the notification itself is async, so
    /// hop onto the runtime and fan out there.
    fn schedule_list_changed(weak: &Weak<Self>) {
        let Some(inner) = weak.upgrade() else { return };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            inner.notify_tool_list_changed().await;
        });
    }

    async fn notify_tool_list_changed(&self) {
        let peers: Vec<Peer<RoleServer>> = self.peers.read().clone();
        let mut dead = Vec::new();
        for (i, peer) in peers.iter().enumerate() {
            if let Err(e) = peer.notify_tool_list_changed().await {
                // Expected while no downstream client is connected yet.
                tracing::debug!(error = %e, "failed to send tools/list_changed");
                dead.push(i);
            }
        }
        if !dead.is_empty() {
            let mut peers = self.peers.write();
            for i in dead.into_iter().rev() {
                if i < peers.len() {
                    peers.remove(i);
                }
            }
        }
    }
}

/// Asks the connected downstream client through MCP elicitation.
struct PeerElicitation {
    peer: Peer<RoleServer>,
}

#[async_trait]
impl ElicitUser for PeerElicitation {
    async fn confirm(&self, message: &str) -> BridgeResult<ElicitOutcome> {
        let params: CreateElicitationRequestParam = serde_json::from_value(json!({
            "message": message,
            "requestedSchema": { "type": "object", "properties": {} }
        }))
        .map_err(|e| BridgeError::Connection(format!("cannot build elicitation request: {e}")))?;

        match self.peer.create_elicitation(params).await {
            Ok(result) => Ok(match result.action {
                ElicitationAction::Accept => ElicitOutcome::Accepted,
                ElicitationAction::Decline => ElicitOutcome::Declined,
                ElicitationAction::Cancel => ElicitOutcome::Cancelled,
            }),
            Err(e) => Err(BridgeError::Connection(e.to_string())),
        }
    }
}

fn success_text(text: impl Into<String>) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(text.into())],
        structured_content: None,
        is_error: Some(false),
        meta: None,
    }
}

fn error_text(text: impl Into<String>) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(text.into())],
        structured_content: None,
        is_error: Some(true),
        meta: None,
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

impl ServerHandler for BridgeServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(true),
                }),
                ..Default::default()
            },
            server_info: Implementation {
                name: "crabeye-mcp-bridge".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            instructions: Some(
                "This bridge aggregates multiple MCP servers. Call search_tools to \
                 discover tools across all of them; matching tools become callable \
                 directly or through run_tool."
                    .into(),
            ),
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, ErrorData> {
        self.inner.peers.write().push(context.peer.clone());
        Ok(self.get_info())
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: self.advertised_tools(),
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let elicit = PeerElicitation {
            peer: context.peer.clone(),
        };
        self.dispatch(request.name.as_ref(), request.arguments, &elicit)
            .await
    }
}
