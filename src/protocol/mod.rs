pub mod capabilities;
pub mod messages;
pub mod types;

pub use capabilities::{
    CapabilityFlags, ClientCapabilities, Implementation, InitializeParams, InitializeResult,
    ServerCapabilities, PROTOCOL_VERSION,
};
pub use messages::{
    codes, methods, JsonRpcRequest, JsonRpcResponse, RequestId, ServerMessage, ServerNotification,
    ServerRequest, JSONRPC_VERSION,
};
pub use types::{
    LoggingLevel, PromptArgument, PromptDefinition, Resource, ResourceTemplate, Root,
    ServerMetadata, ToolDefinition,
};
