pub mod errors;

pub use errors::{InteractionKind, McpError, McpResult, ProtocolError};
