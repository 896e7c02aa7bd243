//! JSON-RPC 2.0 envelopes and inbound message classification

use crate::utils::errors::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard and reserved JSON-RPC error codes consumed by the engine.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Implementation-defined server errors live in [-32099, -32000].
    pub fn is_server_error(code: i64) -> bool {
        (-32099..=-32000).contains(&code)
    }
}

/// Protocol method names.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const LOGGING_SET_LEVEL: &str = "logging/setLevel";
    pub const COMPLETION_COMPLETE: &str = "completion/complete";
    pub const ROOTS_LIST: &str = "roots/list";
    pub const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";
    pub const ELICITATION_CREATE: &str = "elicitation/create";

    pub const NOTIFY_CANCELLED: &str = "notifications/cancelled";
    pub const NOTIFY_PROGRESS: &str = "notifications/progress";
    pub const NOTIFY_MESSAGE: &str = "notifications/message";
    pub const NOTIFY_ROOTS_LIST_CHANGED: &str = "notifications/roots/list_changed";
    pub const NOTIFY_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const NOTIFY_PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
    pub const NOTIFY_RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const NOTIFY_RESOURCES_UPDATED: &str = "notifications/resources/updated";
    pub const NOTIFY_ELICITATION_COMPLETE: &str = "notifications/elicitation/complete";
}

/// Request ID can be string or number. The engine allocates monotonic
/// numbers; inbound server ids are echoed back in whichever shape arrived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl RequestId {
    pub fn as_number(&self) -> Option<i64> {
        match self {
            RequestId::Number(n) => Some(*n),
            RequestId::String(_) => None,
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

/// JSON-RPC 2.0 request (also used for notifications, with `id: None`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProtocolError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, error: ProtocolError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: None,
            error: Some(error),
        }
    }
}

/// Inbound message after classification: server request (has id and
/// method), response to one of ours (has id, no method), or notification
/// (method, no id).
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcRequest),
}

impl ServerMessage {
    /// Classify a raw inbound value. Shapes that are neither request,
    /// response nor notification are invalid.
    pub fn classify(raw: Value) -> Result<ServerMessage, ProtocolError> {
        let has_id = raw.get("id").map_or(false, |id| !id.is_null());
        let has_method = raw.get("method").map_or(false, Value::is_string);

        match (has_id, has_method) {
            (true, true) => serde_json::from_value(raw).map(ServerMessage::Request),
            (true, false) => serde_json::from_value(raw).map(ServerMessage::Response),
            (false, true) => serde_json::from_value(raw).map(ServerMessage::Notification),
            (false, false) => {
                return Err(ProtocolError::new(
                    codes::INVALID_REQUEST,
                    "message is neither request, response nor notification",
                ))
            }
        }
        .map_err(|e| ProtocolError::new(codes::PARSE_ERROR, e.to_string()))
    }
}

/// Server-initiated requests the client is expected to answer.
#[derive(Debug, Clone)]
pub enum ServerRequest {
    Ping,
    RootsList,
    SamplingCreateMessage(Value),
    ElicitationCreate(Value),
    Other(String),
}

impl ServerRequest {
    pub fn parse(method: &str, params: Option<Value>) -> ServerRequest {
        let params = params.unwrap_or(Value::Null);
        match method {
            methods::PING => ServerRequest::Ping,
            methods::ROOTS_LIST => ServerRequest::RootsList,
            methods::SAMPLING_CREATE_MESSAGE => ServerRequest::SamplingCreateMessage(params),
            methods::ELICITATION_CREATE => ServerRequest::ElicitationCreate(params),
            other => ServerRequest::Other(other.to_string()),
        }
    }
}

/// Notifications the server may push. `Other` degrades to a logged no-op.
#[derive(Debug, Clone)]
pub enum ServerNotification {
    Cancelled { request_id: Option<RequestId> },
    Progress { token: Option<Value>, params: Value },
    ToolsListChanged,
    PromptsListChanged,
    ResourcesListChanged,
    ResourcesUpdated { uri: Option<String> },
    ElicitationComplete(Value),
    LogMessage(Value),
    Other(String),
}

impl ServerNotification {
    pub fn parse(method: &str, params: Option<Value>) -> ServerNotification {
        let params = params.unwrap_or(Value::Null);
        match method {
            methods::NOTIFY_CANCELLED => ServerNotification::Cancelled {
                request_id: params
                    .get("requestId")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok()),
            },
            methods::NOTIFY_PROGRESS => ServerNotification::Progress {
                token: params.get("progressToken").cloned(),
                params,
            },
            methods::NOTIFY_TOOLS_LIST_CHANGED => ServerNotification::ToolsListChanged,
            methods::NOTIFY_PROMPTS_LIST_CHANGED => ServerNotification::PromptsListChanged,
            methods::NOTIFY_RESOURCES_LIST_CHANGED => ServerNotification::ResourcesListChanged,
            methods::NOTIFY_RESOURCES_UPDATED => ServerNotification::ResourcesUpdated {
                uri: params
                    .get("uri")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            methods::NOTIFY_ELICITATION_COMPLETE => {
                ServerNotification::ElicitationComplete(params)
            }
            methods::NOTIFY_MESSAGE => ServerNotification::LogMessage(params),
            other => ServerNotification::Other(other.to_string()),
        }
    }
}
