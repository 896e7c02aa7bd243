//! Per-server runtime: lifecycle, handshake, projections, call dispatch
//!
//! A [`ServerRuntime`] owns one server connection end-to-end. Starting
//! resolves a transport (injected), performs the handshake, records the
//! capability bitmask, and wires list-changed notifications to targeted
//! cache refreshes. Tool, prompt, metadata and capability projections are
//! each a [`CapabilityCache`] over the persisted per-server record.

pub mod connection;
pub mod schema;

pub use connection::{
    Connection, ConnectionResolver, ConnectionState, InteractionPolicy, StartOptions, StopReason,
};

use crate::cache::{record_keys, BlobStore, CapabilityCache, ServerRecordStore};
use crate::correlator::{
    ClientHandlers, CorrelatorEvent, PageStream, RequestCorrelator,
};
use crate::protocol::{
    methods, CapabilityFlags, Implementation, LoggingLevel, PromptDefinition, Resource,
    ResourceTemplate, Root, ServerMetadata, ToolDefinition,
};
use crate::utils::errors::{McpError, McpResult};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Construction-time wiring for one server.
pub struct RuntimeConfig {
    /// Stable identity; namespaces the persisted record.
    pub server_id: String,
    pub resolver: Arc<dyn ConnectionResolver>,
    pub store: Arc<dyn BlobStore>,
    pub handlers: ClientHandlers,
    pub roots: Vec<Root>,
    pub client_info: Implementation,
    /// Opaque version token of the server's launch definition; live
    /// fetches are recorded against it for staleness comparison.
    pub definition_nonce: Option<String>,
    /// Declaration-time tool entries, available without a live fetch.
    pub static_tools: Option<Vec<ToolDefinition>>,
    pub static_prompts: Option<Vec<PromptDefinition>>,
    /// Unmet precondition gate (e.g. pending extension activation);
    /// `start` waits until it reads true.
    pub activation: Option<watch::Receiver<bool>>,
}

/// Outcome of `start`. Expected failures come back as diagnostics rather
/// than errors so hosts can render them directly.
#[derive(Debug)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    Failed(StartDiagnostic),
}

#[derive(Debug, Clone)]
pub struct StartDiagnostic {
    pub message: String,
    pub docs_url: Option<String>,
}

/// Dismissible diagnostic surfaced to the host (e.g. dropped tools).
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
}

struct ActiveConnection {
    correlator: Arc<RequestCorrelator>,
    capabilities: CapabilityFlags,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ServerRuntime {
    server_id: String,
    resolver: Arc<dyn ConnectionResolver>,
    handlers: ClientHandlers,
    roots: Vec<Root>,
    client_info: Implementation,
    definition_nonce: Option<String>,
    activation: Option<watch::Receiver<bool>>,

    /// Serializes concurrent `start` calls into one outcome at a time.
    start_lock: tokio::sync::Mutex<()>,
    active: parking_lot::Mutex<Option<ActiveConnection>>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<CorrelatorEvent>,

    tools: CapabilityCache<Vec<ToolDefinition>>,
    prompts: CapabilityCache<Vec<PromptDefinition>>,
    metadata: CapabilityCache<ServerMetadata>,
    capabilities: CapabilityCache<CapabilityFlags>,

    diagnostics: parking_lot::Mutex<Vec<Diagnostic>>,
    /// Calls currently in flight; disambiguates reentrant sampling.
    outstanding_calls: AtomicUsize,
    progress_seq: AtomicU64,
}

impl ServerRuntime {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let record_store: Arc<dyn BlobStore> = Arc::new(ServerRecordStore::new(
            Arc::clone(&config.store),
            config.server_id.clone(),
        ));

        let tools = CapabilityCache::persisted_json(
            record_keys::TOOLS,
            Arc::clone(&record_store),
            config.static_tools,
            Vec::new(),
        );
        let prompts = CapabilityCache::persisted_json(
            record_keys::PROMPTS,
            Arc::clone(&record_store),
            config.static_prompts,
            Vec::new(),
        );
        let metadata = CapabilityCache::persisted_json(
            record_keys::SERVER_METADATA,
            Arc::clone(&record_store),
            None,
            ServerMetadata {
                name: config.server_id.clone(),
                ..Default::default()
            },
        );
        let capabilities = CapabilityCache::persisted_json(
            record_keys::CAPABILITIES,
            Arc::clone(&record_store),
            None,
            CapabilityFlags::NONE,
        );
        tools.set_current_nonce(config.definition_nonce.clone());
        prompts.set_current_nonce(config.definition_nonce.clone());
        metadata.set_current_nonce(config.definition_nonce.clone());
        capabilities.set_current_nonce(config.definition_nonce.clone());

        let (state_tx, _) = watch::channel(ConnectionState::Stopped(None));
        let (events, _) = broadcast::channel(64);

        Arc::new(Self {
            server_id: config.server_id,
            resolver: config.resolver,
            handlers: config.handlers,
            roots: config.roots,
            client_info: config.client_info,
            definition_nonce: config.definition_nonce,
            activation: config.activation,
            start_lock: tokio::sync::Mutex::new(()),
            active: parking_lot::Mutex::new(None),
            state_tx,
            events,
            tools,
            prompts,
            metadata,
            capabilities,
            diagnostics: parking_lot::Mutex::new(Vec::new()),
            outstanding_calls: AtomicUsize::new(0),
            progress_seq: AtomicU64::new(0),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state_tx.borrow().is_running()
    }

    pub fn tools(&self) -> &CapabilityCache<Vec<ToolDefinition>> {
        &self.tools
    }

    pub fn prompts(&self) -> &CapabilityCache<Vec<PromptDefinition>> {
        &self.prompts
    }

    pub fn metadata(&self) -> &CapabilityCache<ServerMetadata> {
        &self.metadata
    }

    pub fn capabilities(&self) -> &CapabilityCache<CapabilityFlags> {
        &self.capabilities
    }

    /// Refresh and list-changed events observed on the active connection.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CorrelatorEvent> {
        self.events.subscribe()
    }

    /// Drain pending dismissible diagnostics.
    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock())
    }

    pub fn has_outstanding_call(&self) -> bool {
        self.outstanding_calls.load(Ordering::SeqCst) > 0
    }

    /// Start the server connection. Idempotent under concurrency:
    /// callers queue on one lock and whoever finds the connection already
    /// running observes that outcome.
    pub async fn start(self: &Arc<Self>, options: StartOptions) -> McpResult<StartOutcome> {
        let _gate = self.start_lock.lock().await;
        if self.is_running() {
            return Ok(StartOutcome::AlreadyRunning);
        }

        if let Some(mut activation) = self.activation.clone() {
            while !*activation.borrow_and_update() {
                if activation.changed().await.is_err() {
                    break;
                }
            }
        }

        let connection = match self.resolver.connect(&options).await {
            Ok(connection) => connection,
            Err(e) => return self.classify_start_failure(e),
        };
        let Connection {
            channel,
            mut incoming,
            state,
        } = connection;

        let correlator = RequestCorrelator::new(
            channel,
            self.handlers.clone(),
            self.roots.clone(),
            self.server_id.clone(),
        );

        let pump = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                while let Some(raw) = incoming.recv().await {
                    correlator.handle_message(raw);
                }
            })
        };

        // Handshake raced against the connection dying first, so a
        // needs-interaction stop fails fast instead of hanging.
        let mut handshake_state = state.clone();
        let init = tokio::select! {
            init = correlator.initialize(self.client_info.clone()) => init,
            terminal = wait_until_terminal(&mut handshake_state) => {
                pump.abort();
                correlator.dispose();
                return self.handshake_interrupted(terminal, options.interaction);
            }
        };
        let init = match init {
            Ok(init) => init,
            Err(e) => {
                pump.abort();
                correlator.dispose();
                warn!(server = %self.server_id, error = %e, "handshake failed");
                return Ok(StartOutcome::Failed(StartDiagnostic {
                    message: format!(
                        "could not start server '{}': {e}; check the server logs",
                        self.server_id
                    ),
                    docs_url: None,
                }));
            }
        };

        let flags = CapabilityFlags::from_capabilities(&init.capabilities);
        info!(server = %self.server_id, capabilities = %flags, "handshake complete");
        self.capabilities
            .resolve_fetch(flags, self.definition_nonce.clone());
        self.metadata.resolve_fetch(
            ServerMetadata {
                name: init.server_info.name,
                title: init.server_info.title,
                version: init.server_info.version,
                instructions: init.instructions,
                icons: init.icons,
            },
            self.definition_nonce.clone(),
        );

        let event_task = {
            let me = Arc::clone(self);
            let mut events = correlator.subscribe_events();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match &event {
                        CorrelatorEvent::ToolsListChanged => me.spawn_refresh_tools(),
                        CorrelatorEvent::PromptsListChanged => me.spawn_refresh_prompts(),
                        _ => {}
                    }
                    let _ = me.events.send(event);
                }
            })
        };

        *self.active.lock() = Some(ActiveConnection {
            correlator: Arc::clone(&correlator),
            capabilities: flags,
            tasks: vec![pump, event_task],
        });
        let _ = self.state_tx.send_replace(ConnectionState::Running);

        // Spawned only after the connection is installed and published:
        // its first read re-checks the watch, so a terminal state that
        // arrived during setup still tears the connection down instead of
        // leaving a dead connection reported as Running.
        let state_task = {
            let me = Arc::clone(self);
            let correlator = Arc::clone(&correlator);
            let mut rx = state;
            tokio::spawn(async move {
                loop {
                    let current = rx.borrow_and_update().clone();
                    let terminal = current.is_terminal();
                    let _ = me.state_tx.send_replace(current);
                    if terminal {
                        // Leaving Running abnormally: batch-cancel every
                        // pending request on this connection.
                        correlator.dispose();
                        me.active.lock().take();
                        break;
                    }
                    if rx.changed().await.is_err() {
                        correlator.dispose();
                        let _ = me.state_tx.send_replace(ConnectionState::Stopped(None));
                        me.active.lock().take();
                        break;
                    }
                }
            })
        };
        if let Some(active) = self.active.lock().as_mut() {
            active.tasks.push(state_task);
        }

        if flags.contains(CapabilityFlags::TOOLS) {
            self.spawn_refresh_tools();
        }
        if flags.contains(CapabilityFlags::PROMPTS) {
            self.spawn_refresh_prompts();
        }

        Ok(StartOutcome::Started)
    }

    fn handshake_interrupted(
        &self,
        terminal: ConnectionState,
        policy: InteractionPolicy,
    ) -> McpResult<StartOutcome> {
        if let ConnectionState::Stopped(Some(StopReason::NeedsInteraction(kind))) = &terminal {
            if policy == InteractionPolicy::Fail {
                return Err(McpError::NeedsUserInteraction(*kind));
            }
        }
        Ok(StartOutcome::Failed(StartDiagnostic {
            message: format!(
                "could not start server '{}': connection ended during handshake ({terminal:?})",
                self.server_id
            ),
            docs_url: None,
        }))
    }

    fn classify_start_failure(&self, error: McpError) -> McpResult<StartOutcome> {
        let missing_executable = match &error {
            McpError::Io(io) => io.kind() == std::io::ErrorKind::NotFound,
            McpError::Connection { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("not found") || lower.contains("no such file")
            }
            _ => return Err(error),
        };
        if missing_executable {
            let message = error.to_string();
            let docs_url = ["npx", "uvx", "docker"]
                .iter()
                .any(|runner| message.contains(runner))
                .then(|| "https://modelcontextprotocol.io/docs".to_string());
            return Ok(StartOutcome::Failed(StartDiagnostic {
                message: format!(
                    "could not start server '{}': executable missing ({message}); \
                     install it or fix the configured command",
                    self.server_id
                ),
                docs_url,
            }));
        }
        Ok(StartOutcome::Failed(StartDiagnostic {
            message: format!(
                "could not start server '{}': {error}; check the server logs",
                self.server_id
            ),
            docs_url: None,
        }))
    }

    /// Tear down the active connection if present. Idempotent.
    pub fn stop(&self) {
        let active = self.active.lock().take();
        if let Some(active) = active {
            info!(server = %self.server_id, "stopping server connection");
            active.correlator.dispose();
            for task in active.tasks {
                task.abort();
            }
        }
        let _ = self
            .state_tx
            .send_replace(ConnectionState::Stopped(Some(StopReason::Requested)));
    }

    /// Clear in-memory live tool/prompt state (persisted entries survive).
    pub fn reset_live_data(&self) {
        self.tools.reset_live();
        self.prompts.reset_live();
    }

    fn correlator(&self) -> McpResult<Arc<RequestCorrelator>> {
        self.active
            .lock()
            .as_ref()
            .map(|active| Arc::clone(&active.correlator))
            .ok_or_else(|| McpError::connection("server is not running", false))
    }

    fn active_capabilities(&self) -> CapabilityFlags {
        self.active
            .lock()
            .as_ref()
            .map(|active| active.capabilities)
            .unwrap_or(CapabilityFlags::NONE)
    }

    fn spawn_refresh_tools(self: &Arc<Self>) {
        let me = Arc::clone(self);
        tokio::spawn(async move { me.refresh_tools().await });
    }

    fn spawn_refresh_prompts(self: &Arc<Self>) {
        let me = Arc::clone(self);
        tokio::spawn(async move { me.refresh_prompts().await });
    }

    /// Fetch the live tool list, dropping schema-invalid tools.
    pub async fn refresh_tools(self: &Arc<Self>) {
        let correlator = match self.correlator() {
            Ok(correlator) => correlator,
            Err(_) => return,
        };
        self.tools.begin_fetch();
        let pages: PageStream<ToolDefinition> = correlator.paginated(
            methods::TOOLS_LIST,
            None,
            "tools",
            CancellationToken::new(),
        );
        match pages.collect().await {
            Ok(fetched) => {
                let (valid, rejected) = schema::validate_tools(fetched);
                if !rejected.is_empty() {
                    let names: Vec<String> = rejected
                        .iter()
                        .map(|e| match e {
                            McpError::ToolSchemaInvalid { tool, .. } => tool.clone(),
                            other => other.to_string(),
                        })
                        .collect();
                    self.diagnostics.lock().push(Diagnostic {
                        message: format!(
                            "{} tool(s) from '{}' have invalid schemas and were hidden: {}",
                            names.len(),
                            self.server_id,
                            names.join(", ")
                        ),
                    });
                }
                self.tools
                    .resolve_fetch(valid, self.definition_nonce.clone());
            }
            Err(e) if e.is_cancelled() => self.tools.fail_fetch(),
            Err(e) => {
                warn!(server = %self.server_id, error = %e, "tools/list failed");
                self.tools.fail_fetch();
            }
        }
    }

    pub async fn refresh_prompts(self: &Arc<Self>) {
        let correlator = match self.correlator() {
            Ok(correlator) => correlator,
            Err(_) => return,
        };
        self.prompts.begin_fetch();
        let pages: PageStream<PromptDefinition> = correlator.paginated(
            methods::PROMPTS_LIST,
            None,
            "prompts",
            CancellationToken::new(),
        );
        match pages.collect().await {
            Ok(fetched) => {
                self.prompts
                    .resolve_fetch(fetched, self.definition_nonce.clone());
            }
            Err(e) => {
                if !e.is_cancelled() {
                    warn!(server = %self.server_id, error = %e, "prompts/list failed");
                }
                self.prompts.fail_fetch();
            }
        }
    }

    /// Invoke a tool. Progress notifications correlated to this call's
    /// fresh token are forwarded to `progress`. On a "URL elicitation
    /// required" error the elicitation flow runs once and the call retries
    /// exactly once; a connection-layer retryable error also retries
    /// exactly once. Everything else propagates.
    pub async fn call(
        &self,
        name: &str,
        arguments: Option<Value>,
        progress: Option<mpsc::UnboundedSender<Value>>,
        cancel: &CancellationToken,
    ) -> McpResult<Value> {
        let correlator = self.correlator()?;

        self.outstanding_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = CallGuard(&self.outstanding_calls);

        let token = format!(
            "{}-call-{}",
            self.server_id,
            self.progress_seq.fetch_add(1, Ordering::SeqCst)
        );
        if let Some(sink) = progress {
            correlator.register_progress(&token, sink);
        }

        let params = json!({
            "name": name,
            "arguments": arguments.unwrap_or(Value::Null),
            "_meta": { "progressToken": token },
        });

        let mut elicited = false;
        let mut retried_connection = false;
        let result = loop {
            match correlator
                .send_request(methods::TOOLS_CALL, Some(params.clone()), cancel)
                .await
            {
                Ok(result) => break Ok(result),
                Err(McpError::Protocol(e)) if e.is_url_elicitation_required() && !elicited => {
                    elicited = true;
                    match &self.handlers.elicitation {
                        Some(handler) => {
                            debug!(server = %self.server_id, tool = name, "running url elicitation before retry");
                            let data = e.data.clone().unwrap_or(Value::Null);
                            if let Err(elicit_err) = handler.elicit(data).await {
                                break Err(elicit_err);
                            }
                        }
                        None => break Err(McpError::CallFailed(e)),
                    }
                }
                Err(e) if e.is_retryable_connection() && !retried_connection => {
                    retried_connection = true;
                    debug!(server = %self.server_id, tool = name, "retrying call after retryable connection error");
                }
                Err(McpError::Protocol(e)) => break Err(McpError::CallFailed(e)),
                Err(e) => break Err(e),
            }
        };

        correlator.unregister_progress(&token);
        result
    }

    /// Lazy, cancellable iteration over the server's resources.
    pub fn resources(&self, cancel: CancellationToken) -> McpResult<PageStream<Resource>> {
        let correlator = self.correlator()?;
        Ok(correlator.paginated(methods::RESOURCES_LIST, None, "resources", cancel))
    }

    /// Resource templates, materialized as a list.
    pub async fn resource_templates(
        &self,
        cancel: CancellationToken,
    ) -> McpResult<Vec<ResourceTemplate>> {
        let correlator = self.correlator()?;
        let pages: PageStream<ResourceTemplate> = correlator.paginated(
            methods::RESOURCES_TEMPLATES_LIST,
            None,
            "resourceTemplates",
            cancel,
        );
        pages.collect().await
    }

    pub async fn read_resource(&self, uri: &str, cancel: &CancellationToken) -> McpResult<Value> {
        self.correlator()?
            .send_request(methods::RESOURCES_READ, Some(json!({ "uri": uri })), cancel)
            .await
    }

    pub async fn subscribe_resource(&self, uri: &str) -> McpResult<()> {
        self.require_capability(CapabilityFlags::RESOURCES_SUBSCRIBE)?;
        self.correlator()?
            .send_request(
                methods::RESOURCES_SUBSCRIBE,
                Some(json!({ "uri": uri })),
                &CancellationToken::new(),
            )
            .await
            .map(|_| ())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> McpResult<()> {
        self.require_capability(CapabilityFlags::RESOURCES_SUBSCRIBE)?;
        self.correlator()?
            .send_request(
                methods::RESOURCES_UNSUBSCRIBE,
                Some(json!({ "uri": uri })),
                &CancellationToken::new(),
            )
            .await
            .map(|_| ())
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> McpResult<Value> {
        self.correlator()?
            .send_request(
                methods::PROMPTS_GET,
                Some(json!({ "name": name, "arguments": arguments.unwrap_or(Value::Null) })),
                &CancellationToken::new(),
            )
            .await
    }

    pub async fn set_log_level(&self, level: LoggingLevel) -> McpResult<()> {
        self.require_capability(CapabilityFlags::LOGGING)?;
        self.correlator()?
            .send_request(
                methods::LOGGING_SET_LEVEL,
                Some(json!({ "level": level.as_str() })),
                &CancellationToken::new(),
            )
            .await
            .map(|_| ())
    }

    pub async fn complete(&self, reference: Value, argument: Value) -> McpResult<Value> {
        self.require_capability(CapabilityFlags::COMPLETIONS)?;
        self.correlator()?
            .send_request(
                methods::COMPLETION_COMPLETE,
                Some(json!({ "ref": reference, "argument": argument })),
                &CancellationToken::new(),
            )
            .await
    }

    fn require_capability(&self, flag: CapabilityFlags) -> McpResult<()> {
        if self.active_capabilities().contains(flag) {
            Ok(())
        } else {
            Err(McpError::connection(
                format!("server '{}' does not support {flag}", self.server_id),
                false,
            ))
        }
    }
}

impl Drop for ServerRuntime {
    fn drop(&mut self) {
        if let Some(active) = self.active.lock().take() {
            active.correlator.dispose();
            for task in active.tasks {
                task.abort();
            }
        }
    }
}

struct CallGuard<'a>(&'a AtomicUsize);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wait for the connection to leave `Running`; a closed watch counts as a
/// plain stop.
async fn wait_until_terminal(rx: &mut watch::Receiver<ConnectionState>) -> ConnectionState {
    loop {
        let current = rx.borrow_and_update().clone();
        if current.is_terminal() {
            return current;
        }
        if rx.changed().await.is_err() {
            return ConnectionState::Stopped(None);
        }
    }
}
