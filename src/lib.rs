//! mcplink: client-side engine for the MCP tool/resource protocol
//!
//! Three pillars, each usable on its own:
//! - [`correlator`]: typed request/response/notification semantics over an
//!   opaque bidirectional message channel, with cancellation, pagination
//!   and exactly-once settlement.
//! - [`runtime`]: per-server lifecycle (handshake, capability bitmask,
//!   staleness-aware tool/prompt/resource projections, call dispatch with
//!   bounded retry) on top of the correlator and [`cache`].
//! - [`uri_template`]: RFC 6570 template engine used to address resources.
//!
//! Transports, UI and persistence mechanics are injected by the host via
//! the [`correlator::MessageChannel`], [`runtime::ConnectionResolver`] and
//! [`cache::BlobStore`] seams.

pub mod cache;
pub mod correlator;
pub mod protocol;
pub mod runtime;
pub mod uri_template;
pub mod utils;

pub use cache::{BlobStore, CapabilityCache, MemoryStore, Staleness};
pub use correlator::{ClientHandlers, CorrelatorEvent, MessageChannel, PageStream, RequestCorrelator};
pub use protocol::{CapabilityFlags, Implementation, InitializeResult};
pub use runtime::{
    ConnectionResolver, ConnectionState, RuntimeConfig, ServerRuntime, StartOptions, StartOutcome,
};
pub use uri_template::{TemplateError, UriTemplate};
pub use utils::errors::{InteractionKind, McpError, McpResult, ProtocolError};
