//! Injected handlers for server-initiated requests

use crate::utils::errors::McpResult;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Handles `sampling/createMessage`: the server asks the client to generate
/// a message via its own model access.
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    async fn create_message(&self, params: Value) -> McpResult<Value>;
}

/// Handles `elicitation/create`: the server asks for additional user input
/// (form or URL flow) before it can proceed.
#[async_trait]
pub trait ElicitationHandler: Send + Sync {
    async fn elicit(&self, params: Value) -> McpResult<Value>;
}

/// Optional client-side handlers. Capabilities for sampling/elicitation are
/// advertised during the handshake only when the matching handler is set;
/// without one the engine answers those requests with method-not-found.
#[derive(Default, Clone)]
pub struct ClientHandlers {
    pub sampling: Option<Arc<dyn SamplingHandler>>,
    pub elicitation: Option<Arc<dyn ElicitationHandler>>,
}

impl ClientHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sampling(mut self, handler: Arc<dyn SamplingHandler>) -> Self {
        self.sampling = Some(handler);
        self
    }

    pub fn with_elicitation(mut self, handler: Arc<dyn ElicitationHandler>) -> Self {
        self.elicitation = Some(handler);
        self
    }
}
