//! Connection seams between the runtime and an injected transport

use crate::correlator::MessageChannel;
use crate::utils::errors::{InteractionKind, McpResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// The client asked for it.
    Requested,
    /// The server cannot proceed without user interaction.
    NeedsInteraction(InteractionKind),
    /// The underlying process exited on its own.
    ProcessExited(Option<i32>),
}

/// Connection lifecycle state. Leaving `Running` abnormally force-cancels
/// every pending request on the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Stopped(Option<StopReason>),
    Running,
    Error { message: String, retryable: bool },
}

impl ConnectionState {
    pub fn is_running(&self) -> bool {
        matches!(self, ConnectionState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_running()
    }
}

/// A live transport connection: the outbound channel half, the inbound
/// message feed (strictly in arrival order), and the state watch.
pub struct Connection {
    pub channel: Arc<dyn MessageChannel>,
    pub incoming: mpsc::Receiver<Value>,
    pub state: watch::Receiver<ConnectionState>,
}

/// Whether an interactive prompt surfacing during startup is tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InteractionPolicy {
    /// Let the transport surface whatever interaction it needs.
    #[default]
    Allow,
    /// Fail fast with `NeedsUserInteraction` instead of letting a prompt
    /// appear unexpectedly.
    Fail,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub interaction: InteractionPolicy,
}

/// Resolves a transport connection for one server. The mechanics (process
/// spawn, socket dial, sandboxing) live entirely with the host.
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn connect(&self, options: &StartOptions) -> McpResult<Connection>;
}
