use serde_json::Value;
use thiserror::Error;

/// Error object carried by a JSON-RPC error response, or synthesized locally
/// when a handler fails.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[error("server error {code}: {message}")]
pub struct ProtocolError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProtocolError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// True for the implementation-specific "URL elicitation required" shape:
    /// a code in the server-reserved range whose data carries the URL to open.
    pub fn is_url_elicitation_required(&self) -> bool {
        crate::protocol::codes::is_server_error(self.code)
            && self
                .data
                .as_ref()
                .and_then(|d| d.get("url"))
                .map_or(false, Value::is_string)
    }
}

/// Kind of user interaction a server needs before it can proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    /// Structured form input.
    Form,
    /// Opening a URL (e.g. an OAuth flow) in the user's browser.
    Url,
    /// The launched process wants an interactive terminal.
    Terminal,
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InteractionKind::Form => write!(f, "form"),
            InteractionKind::Url => write!(f, "url"),
            InteractionKind::Terminal => write!(f, "terminal"),
        }
    }
}

#[derive(Error, Debug)]
pub enum McpError {
    /// Error response received from the remote, or synthesized for one.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Channel or transport level failure.
    #[error("connection error: {message}")]
    Connection { message: String, retryable: bool },

    /// The initialize round-trip did not complete.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server cannot proceed without user interaction.
    #[error("user interaction required ({0})")]
    NeedsUserInteraction(InteractionKind),

    /// A tool declared an input schema that is not valid JSON Schema.
    /// Scoped to one tool, never fatal for the rest of the list.
    #[error("invalid schema for tool '{tool}': {reason}")]
    ToolSchemaInvalid { tool: String, reason: String },

    /// A tools/call request failed with a remote error.
    #[error("tool call failed: {0}")]
    CallFailed(ProtocolError),

    /// The request was cancelled before it settled.
    #[error("request cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl McpError {
    pub fn connection(message: impl Into<String>, retryable: bool) -> Self {
        McpError::Connection {
            message: message.into(),
            retryable,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, McpError::Cancelled)
    }

    pub fn is_retryable_connection(&self) -> bool {
        matches!(self, McpError::Connection { retryable: true, .. })
    }

    /// Normalize for an outbound error response on the server-request path.
    pub fn to_protocol_error(&self) -> ProtocolError {
        match self {
            McpError::Protocol(e) | McpError::CallFailed(e) => e.clone(),
            other => {
                ProtocolError::new(crate::protocol::codes::INTERNAL_ERROR, other.to_string())
            }
        }
    }
}

pub type McpResult<T> = Result<T, McpError>;
