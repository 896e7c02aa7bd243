//! Request/response correlation over an opaque message channel
//!
//! Multiplexes concurrent logical requests over one bidirectional channel:
//! monotonic request ids, at-most-one settlement per id, cooperative
//! cancellation, cursor pagination, and routing of server-initiated
//! requests and notifications.

pub mod handlers;
pub mod pagination;
pub mod pending;

pub use handlers::{ClientHandlers, ElicitationHandler, SamplingHandler};
pub use pagination::PageStream;
pub use pending::{PendingTable, Settlement};

use crate::protocol::{
    codes, methods, ClientCapabilities, Implementation, InitializeParams, InitializeResult,
    JsonRpcRequest, JsonRpcResponse, LoggingLevel, RequestId, Root, ServerMessage,
    ServerNotification, ServerRequest,
};
use crate::utils::errors::{McpError, McpResult, ProtocolError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outbound half of the message channel. The transport behind it (stdio,
/// socket, ...) is supplied by the host; inbound messages are pumped into
/// [`RequestCorrelator::handle_message`] in arrival order.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send(&self, message: Value) -> McpResult<()>;
}

/// Events fanned out to refresh listeners.
#[derive(Debug, Clone)]
pub enum CorrelatorEvent {
    ToolsListChanged,
    PromptsListChanged,
    ResourcesListChanged,
    ResourceUpdated(String),
    ElicitationComplete(Value),
}

pub struct RequestCorrelator {
    channel: Arc<dyn MessageChannel>,
    pending: PendingTable,
    next_id: AtomicI64,
    handlers: ClientHandlers,
    progress: DashMap<String, mpsc::UnboundedSender<Value>>,
    events: broadcast::Sender<CorrelatorEvent>,
    roots: parking_lot::RwLock<Vec<Root>>,
    /// Set once the server has asked for `roots/list`; after that, root
    /// changes proactively notify.
    roots_announced: AtomicBool,
    /// Label used in log lines (typically the server id).
    label: String,
}

impl RequestCorrelator {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        handlers: ClientHandlers,
        roots: Vec<Root>,
        label: impl Into<String>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            channel,
            pending: PendingTable::new(),
            next_id: AtomicI64::new(1),
            handlers,
            progress: DashMap::new(),
            events,
            roots: parking_lot::RwLock::new(roots),
            roots_announced: AtomicBool::new(false),
            label: label.into(),
        })
    }

    /// Perform the handshake: send `initialize`, await the result, then
    /// send `notifications/initialized`. Sampling/elicitation capabilities
    /// are advertised only when the matching handler is registered.
    pub async fn initialize(&self, client_info: Implementation) -> McpResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: crate::protocol::PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::new(
                self.handlers.sampling.is_some(),
                self.handlers.elicitation.is_some(),
            ),
            client_info,
        };
        let result = self
            .send_request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params)?),
                &CancellationToken::new(),
            )
            .await
            .map_err(|e| McpError::HandshakeFailed(e.to_string()))?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::HandshakeFailed(format!("malformed initialize result: {e}")))?;
        self.send_notification(methods::INITIALIZED, None).await?;
        Ok(result)
    }

    /// Send a request and await its settlement. Exactly one of result,
    /// error or cancelled reaches the caller. Cancelling after the request
    /// was sent removes the pending entry, best-effort notifies the remote,
    /// and resolves locally as cancelled; if a remote settlement won the
    /// race, that settlement is honored instead.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> McpResult<Value> {
        if cancel.is_cancelled() {
            return Err(McpError::Cancelled);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.pending.register(id);
        debug!(server = %self.label, id, method, "sending request");

        let envelope = JsonRpcRequest::new(RequestId::Number(id), method, params);
        if let Err(e) = self.channel.send(serde_json::to_value(&envelope)?).await {
            self.pending.take(id);
            return Err(e);
        }

        tokio::select! {
            settled = &mut rx => Self::unwrap_settlement(settled),
            _ = cancel.cancelled() => {
                if self.pending.take(id) {
                    let params = json!({ "requestId": id });
                    if let Err(e) = self
                        .send_notification(methods::NOTIFY_CANCELLED, Some(params))
                        .await
                    {
                        debug!(server = %self.label, id, error = %e, "cancel notification failed");
                    }
                    Err(McpError::Cancelled)
                } else {
                    // A settlement claimed the entry first; honor it.
                    Self::unwrap_settlement(rx.await)
                }
            }
        }
    }

    fn unwrap_settlement(
        settled: Result<Settlement, tokio::sync::oneshot::error::RecvError>,
    ) -> McpResult<Value> {
        match settled {
            Ok(Settlement::Result(value)) => Ok(value),
            Ok(Settlement::Error(error)) => Err(McpError::Protocol(error)),
            Ok(Settlement::Cancelled) => Err(McpError::Cancelled),
            Err(_) => Err(McpError::connection("channel closed before settlement", false)),
        }
    }

    /// One-way message, no id, no settlement.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let envelope = JsonRpcRequest::notification(method, params);
        self.channel.send(serde_json::to_value(&envelope)?).await
    }

    /// Lazy, forward-only sequence of pages for a cursor-paginated list
    /// method whose result carries its items under `items_key`.
    pub fn paginated<T: serde::de::DeserializeOwned>(
        self: &Arc<Self>,
        method: impl Into<String>,
        params: Option<Value>,
        items_key: &'static str,
        cancel: CancellationToken,
    ) -> PageStream<T> {
        PageStream::list(Arc::clone(self), method, params, items_key, cancel)
    }

    /// Feed one raw inbound message. Must be called in arrival order;
    /// handlers that may suspend are spawned so later messages keep
    /// flowing while they run.
    pub fn handle_message(self: &Arc<Self>, raw: Value) {
        match ServerMessage::classify(raw) {
            Ok(ServerMessage::Response(response)) => self.handle_response(response),
            Ok(ServerMessage::Request(request)) => self.handle_server_request(request),
            Ok(ServerMessage::Notification(notification)) => {
                self.handle_notification(notification)
            }
            Err(e) => warn!(server = %self.label, error = %e, "dropping malformed message"),
        }
    }

    fn handle_response(&self, response: JsonRpcResponse) {
        let id = match response.id.as_ref().and_then(RequestId::as_number) {
            Some(id) => id,
            None => {
                warn!(server = %self.label, id = ?response.id, "response with non-numeric id");
                return;
            }
        };
        let settlement = match response.error {
            Some(error) => Settlement::Error(error),
            None => Settlement::Result(response.result.unwrap_or(Value::Null)),
        };
        self.pending.settle(id, settlement);
    }

    fn handle_server_request(self: &Arc<Self>, request: JsonRpcRequest) {
        let id = match request.id.clone() {
            Some(id) => id,
            None => return,
        };
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let response = match me.answer_server_request(&request).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                // The remote is never left hanging: handler failures come
                // back as a well-formed error response.
                Err(e) => JsonRpcResponse::error(id, e.to_protocol_error()),
            };
            match serde_json::to_value(&response) {
                Ok(raw) => {
                    if let Err(e) = me.channel.send(raw).await {
                        debug!(server = %me.label, error = %e, "failed to answer server request");
                    }
                }
                Err(e) => warn!(server = %me.label, error = %e, "unserializable response"),
            }
        });
    }

    async fn answer_server_request(&self, request: &JsonRpcRequest) -> McpResult<Value> {
        match ServerRequest::parse(&request.method, request.params.clone()) {
            ServerRequest::Ping => Ok(json!({})),
            ServerRequest::RootsList => {
                self.roots_announced.store(true, Ordering::SeqCst);
                let roots = self.roots.read().clone();
                Ok(json!({ "roots": roots }))
            }
            ServerRequest::SamplingCreateMessage(params) => match &self.handlers.sampling {
                Some(handler) => handler.create_message(params).await,
                None => Err(Self::method_not_found(&request.method)),
            },
            ServerRequest::ElicitationCreate(params) => match &self.handlers.elicitation {
                Some(handler) => handler.elicit(params).await,
                None => Err(Self::method_not_found(&request.method)),
            },
            ServerRequest::Other(method) => Err(Self::method_not_found(&method)),
        }
    }

    fn method_not_found(method: &str) -> McpError {
        McpError::Protocol(ProtocolError::new(
            codes::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
        ))
    }

    fn handle_notification(&self, notification: JsonRpcRequest) {
        match ServerNotification::parse(&notification.method, notification.params) {
            ServerNotification::Cancelled { request_id } => {
                match request_id.as_ref().and_then(RequestId::as_number) {
                    Some(id) => {
                        self.pending.settle(id, Settlement::Cancelled);
                    }
                    None => debug!(server = %self.label, "cancelled notification without id"),
                }
            }
            ServerNotification::Progress { token, params } => {
                let key = match token.as_ref().map(progress_key) {
                    Some(key) => key,
                    None => {
                        debug!(server = %self.label, "progress notification without token");
                        return;
                    }
                };
                match self.progress.get(&key) {
                    Some(sink) => {
                        let _ = sink.send(params);
                    }
                    None => debug!(server = %self.label, token = %key, "progress for unknown token"),
                }
            }
            ServerNotification::ToolsListChanged => {
                let _ = self.events.send(CorrelatorEvent::ToolsListChanged);
            }
            ServerNotification::PromptsListChanged => {
                let _ = self.events.send(CorrelatorEvent::PromptsListChanged);
            }
            ServerNotification::ResourcesListChanged => {
                let _ = self.events.send(CorrelatorEvent::ResourcesListChanged);
            }
            ServerNotification::ResourcesUpdated { uri } => match uri {
                Some(uri) => {
                    let _ = self.events.send(CorrelatorEvent::ResourceUpdated(uri));
                }
                None => debug!(server = %self.label, "resources/updated without uri"),
            },
            ServerNotification::ElicitationComplete(params) => {
                let _ = self.events.send(CorrelatorEvent::ElicitationComplete(params));
            }
            ServerNotification::LogMessage(params) => self.forward_log_message(params),
            ServerNotification::Other(method) => {
                debug!(server = %self.label, method, "unhandled notification");
            }
        }
    }

    fn forward_log_message(&self, params: Value) {
        let level = params
            .get("level")
            .cloned()
            .and_then(|v| serde_json::from_value::<LoggingLevel>(v).ok())
            .unwrap_or(LoggingLevel::Info);
        let logger = params
            .get("logger")
            .and_then(Value::as_str)
            .unwrap_or("server")
            .to_string();
        let data = params.get("data").cloned().unwrap_or(Value::Null);
        match level.as_tracing_level() {
            tracing::Level::DEBUG => debug!(server = %self.label, %logger, %data, "server log"),
            tracing::Level::INFO => tracing::info!(server = %self.label, %logger, %data, "server log"),
            tracing::Level::WARN => warn!(server = %self.label, %logger, %data, "server log"),
            _ => tracing::error!(server = %self.label, %logger, %data, "server log"),
        }
    }

    /// Register a progress sink for a caller-supplied opaque token.
    /// Notifications carrying that token are forwarded to the sink;
    /// everything else is filtered out.
    pub fn register_progress(&self, token: impl Into<String>, sink: mpsc::UnboundedSender<Value>) {
        self.progress.insert(token.into(), sink);
    }

    pub fn unregister_progress(&self, token: &str) {
        self.progress.remove(token);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CorrelatorEvent> {
        self.events.subscribe()
    }

    /// Replace the configured roots; proactively notifies the server once
    /// it has asked for them at least once.
    pub async fn set_roots(&self, roots: Vec<Root>) -> McpResult<()> {
        *self.roots.write() = roots;
        if self.roots_announced.load(Ordering::SeqCst) {
            self.send_notification(methods::NOTIFY_ROOTS_LIST_CHANGED, None)
                .await?;
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Teardown: force-cancel every pending request as a batch. Idempotent.
    pub fn dispose(&self) {
        self.pending.cancel_all();
    }
}

fn progress_key(token: &Value) -> String {
    match token {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
