//! Shared test doubles: a recording channel and a scripted server

#![allow(dead_code)]

use async_trait::async_trait;
use mcplink::correlator::MessageChannel;
use mcplink::runtime::{Connection, ConnectionResolver, ConnectionState, StartOptions};
use mcplink::{McpError, McpResult, ProtocolError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Records every outbound message and mirrors it to a receiver so tests
/// can await sends.
pub struct MockChannel {
    pub sent: parking_lot::Mutex<Vec<Value>>,
    tx: mpsc::UnboundedSender<Value>,
}

impl MockChannel {
    pub fn new() -> (Arc<MockChannel>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(MockChannel {
                sent: parking_lot::Mutex::new(Vec::new()),
                tx,
            }),
            rx,
        )
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| m.get("method").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl MessageChannel for MockChannel {
    async fn send(&self, message: Value) -> McpResult<()> {
        self.sent.lock().push(message.clone());
        let _ = self.tx.send(message);
        Ok(())
    }
}

pub type Responder =
    Arc<dyn Fn(&str, Value) -> Result<Value, ProtocolError> + Send + Sync + 'static>;

/// Channel that answers every request through a scripted responder,
/// feeding the response back through the inbound side of a connection.
/// Notifications are recorded but unanswered.
pub struct RespondingChannel {
    responder: Responder,
    inbound: mpsc::Sender<Value>,
    pub requests: AtomicUsize,
    /// `(method, remaining)`: sends of that method fail with a retryable
    /// connection error until the budget runs out.
    pub fail_method: parking_lot::Mutex<Option<(String, usize)>>,
    /// Methods whose requests are accepted and counted but never answered.
    pub muted: parking_lot::Mutex<Vec<String>>,
    pub notifications: parking_lot::Mutex<Vec<Value>>,
}

impl RespondingChannel {
    pub fn fail_method(&self, method: &str, times: usize) {
        *self.fail_method.lock() = Some((method.to_string(), times));
    }

    pub fn mute_method(&self, method: &str) {
        self.muted.lock().push(method.to_string());
    }
}

#[async_trait]
impl MessageChannel for RespondingChannel {
    async fn send(&self, message: Value) -> McpResult<()> {
        let method = message.get("method").and_then(Value::as_str);
        let id = message.get("id").cloned();
        match (id, method) {
            (Some(id), Some(method)) => {
                {
                    let mut budget = self.fail_method.lock();
                    if let Some((failing, remaining)) = budget.as_mut() {
                        if failing == method && *remaining > 0 {
                            *remaining -= 1;
                            return Err(McpError::Connection {
                                message: "stream reset".to_string(),
                                retryable: true,
                            });
                        }
                    }
                }
                self.requests.fetch_add(1, Ordering::SeqCst);
                if self.muted.lock().iter().any(|m| m == method) {
                    return Ok(());
                }
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                let response = match (self.responder)(method, params) {
                    Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                    Err(e) => json!({ "jsonrpc": "2.0", "id": id, "error": e }),
                };
                let _ = self.inbound.send(response).await;
            }
            _ => self.notifications.lock().push(message),
        }
        Ok(())
    }
}

/// Build a live scripted connection. The returned state sender lets tests
/// kill the connection; the channel handle exposes counters.
pub fn scripted_connection(
    responder: Responder,
) -> (Connection, watch::Sender<ConnectionState>, Arc<RespondingChannel>) {
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Running);
    let channel = Arc::new(RespondingChannel {
        responder,
        inbound: inbound_tx,
        requests: AtomicUsize::new(0),
        fail_method: parking_lot::Mutex::new(None),
        muted: parking_lot::Mutex::new(Vec::new()),
        notifications: parking_lot::Mutex::new(Vec::new()),
    });
    (
        Connection {
            channel: channel.clone(),
            incoming: inbound_rx,
            state: state_rx,
        },
        state_tx,
        channel,
    )
}

/// Resolver handing out scripted connections; keeps handles to the most
/// recent one so tests can poke at it.
pub struct ScriptedResolver {
    responder: Responder,
    pub last_state: parking_lot::Mutex<Option<watch::Sender<ConnectionState>>>,
    pub last_channel: parking_lot::Mutex<Option<Arc<RespondingChannel>>>,
    pub inbound_tx: parking_lot::Mutex<Option<mpsc::Sender<Value>>>,
    mute_from_connect: parking_lot::Mutex<Vec<String>>,
}

impl ScriptedResolver {
    pub fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            responder,
            last_state: parking_lot::Mutex::new(None),
            last_channel: parking_lot::Mutex::new(None),
            inbound_tx: parking_lot::Mutex::new(None),
            mute_from_connect: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Mute a method on every connection handed out from now on, so even
    /// the first request of a session can be left unanswered.
    pub fn mute_from_connect(&self, method: &str) {
        self.mute_from_connect.lock().push(method.to_string());
    }

    /// Inject a server-initiated message into the live connection.
    pub async fn push_inbound(&self, message: Value) {
        let tx = self.inbound_tx.lock().clone().expect("no live connection");
        tx.send(message).await.expect("inbound closed");
    }
}

#[async_trait]
impl ConnectionResolver for ScriptedResolver {
    async fn connect(&self, _options: &StartOptions) -> McpResult<Connection> {
        let (connection, state_tx, channel) = scripted_connection(self.responder.clone());
        for method in self.mute_from_connect.lock().iter() {
            channel.mute_method(method);
        }
        *self.inbound_tx.lock() = Some(channel.inbound.clone());
        *self.last_state.lock() = Some(state_tx);
        *self.last_channel.lock() = Some(channel);
        Ok(connection)
    }
}

/// Resolver that always fails to connect.
pub struct FailingResolver(pub McpError);

#[async_trait]
impl ConnectionResolver for FailingResolver {
    async fn connect(&self, _options: &StartOptions) -> McpResult<Connection> {
        Err(match &self.0 {
            McpError::Io(e) => McpError::Io(std::io::Error::new(e.kind(), e.to_string())),
            McpError::Connection { message, retryable } => McpError::Connection {
                message: message.clone(),
                retryable: *retryable,
            },
            other => McpError::connection(other.to_string(), false),
        })
    }
}

/// Standard initialize result used by scripted responders.
pub fn initialize_result(capabilities: Value) -> Value {
    json!({
        "protocolVersion": "2025-06-18",
        "capabilities": capabilities,
        "serverInfo": { "name": "scripted", "version": "1.0.0" },
        "instructions": "be nice",
    })
}
