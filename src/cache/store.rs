//! Persistence contract and the on-disk blob layout
//!
//! The engine never owns a storage mechanism; hosts inject a narrow
//! get/set key-value contract. Everything the engine persists lives in
//! one blob under [`STORAGE_KEY`], namespaced per server inside it.

use crate::protocol::{PromptDefinition, ServerMetadata, ToolDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Fixed key of the engine's single persisted blob.
pub const STORAGE_KEY: &str = "mcp.cachedServers";

/// Narrow persistence contract injected by the host. Writes occur only on
/// the single logical thread; `flush` is the shutdown hook.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn flush(&self) {}
}

/// In-memory store for hosts without persistence and for tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: parking_lot::RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.entries.write().insert(key.to_string(), value);
    }
}

/// Persisted state: collection metadata plus per-server cached data.
/// Serialized as ordered pair lists so the blob stays stable across runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoredState {
    pub extension_servers: Vec<(String, Value)>,
    pub server_tools: Vec<(String, StoredServerData)>,
}

/// Cached data for one server, surviving restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoredServerData {
    pub tools: Option<Vec<ToolDefinition>>,
    pub prompts: Option<Vec<PromptDefinition>>,
    pub server_name: Option<String>,
    pub server_instructions: Option<String>,
    pub server_icons: Option<Value>,
    pub capabilities: Option<u32>,
    pub trusted_at_nonce: Option<String>,
    pub nonce: Option<String>,
}

impl StoredState {
    /// Load from the store. Corrupt or missing blobs degrade to empty
    /// state, never fail.
    pub fn load(store: &dyn BlobStore) -> StoredState {
        match store.get(STORAGE_KEY) {
            Some(raw) => serde_json::from_value(raw).unwrap_or_else(|e| {
                warn!(error = %e, "discarding corrupt persisted state");
                StoredState::default()
            }),
            None => StoredState::default(),
        }
    }

    pub fn save(&self, store: &dyn BlobStore) {
        match serde_json::to_value(self) {
            Ok(raw) => store.set(STORAGE_KEY, raw),
            Err(e) => warn!(error = %e, "failed to serialize persisted state"),
        }
    }

    pub fn server(&self, server_id: &str) -> Option<&StoredServerData> {
        self.server_tools
            .iter()
            .find(|(id, _)| id == server_id)
            .map(|(_, data)| data)
    }

    pub fn set_server(&mut self, server_id: &str, data: StoredServerData) {
        match self.server_tools.iter_mut().find(|(id, _)| id == server_id) {
            Some((_, slot)) => *slot = data,
            None => self.server_tools.push((server_id.to_string(), data)),
        }
    }
}

/// Cache keys a [`ServerRecordStore`] maps onto blob fields.
pub mod record_keys {
    pub const TOOLS: &str = "tools";
    pub const PROMPTS: &str = "prompts";
    pub const SERVER_METADATA: &str = "serverMetadata";
    pub const CAPABILITIES: &str = "capabilities";
}

/// Per-server view over the aggregate blob. Each capability cache reads
/// and writes `{data, nonce}` entries through this adapter; the adapter
/// maps them onto the corresponding [`StoredServerData`] fields.
pub struct ServerRecordStore {
    store: Arc<dyn BlobStore>,
    server_id: String,
}

impl ServerRecordStore {
    pub fn new(store: Arc<dyn BlobStore>, server_id: impl Into<String>) -> Self {
        Self {
            store,
            server_id: server_id.into(),
        }
    }

    fn read_record(&self) -> Option<StoredServerData> {
        StoredState::load(self.store.as_ref())
            .server(&self.server_id)
            .cloned()
    }

    fn update_record(&self, apply: impl FnOnce(&mut StoredServerData)) {
        let mut state = StoredState::load(self.store.as_ref());
        let mut record = state.server(&self.server_id).cloned().unwrap_or_default();
        apply(&mut record);
        state.set_server(&self.server_id, record);
        state.save(self.store.as_ref());
    }

    fn entry(data: Option<Value>, nonce: &Option<String>) -> Option<Value> {
        data.map(|data| json!({ "data": data, "nonce": nonce }))
    }
}

impl BlobStore for ServerRecordStore {
    fn get(&self, key: &str) -> Option<Value> {
        let record = self.read_record()?;
        match key {
            record_keys::TOOLS => Self::entry(
                record
                    .tools
                    .as_ref()
                    .and_then(|t| serde_json::to_value(t).ok()),
                &record.nonce,
            ),
            record_keys::PROMPTS => Self::entry(
                record
                    .prompts
                    .as_ref()
                    .and_then(|p| serde_json::to_value(p).ok()),
                &record.nonce,
            ),
            record_keys::SERVER_METADATA => {
                let name = record.server_name.clone()?;
                let metadata = ServerMetadata {
                    name,
                    title: None,
                    version: String::new(),
                    instructions: record.server_instructions.clone(),
                    icons: record.server_icons.clone(),
                };
                Self::entry(serde_json::to_value(&metadata).ok(), &record.nonce)
            }
            record_keys::CAPABILITIES => {
                Self::entry(record.capabilities.map(|c| json!(c)), &record.nonce)
            }
            _ => None,
        }
    }

    fn set(&self, key: &str, value: Value) {
        let data = value.get("data").cloned();
        let nonce = value
            .get("nonce")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.update_record(|record| {
            match key {
                record_keys::TOOLS => {
                    record.tools = data.and_then(|d| serde_json::from_value(d).ok());
                }
                record_keys::PROMPTS => {
                    record.prompts = data.and_then(|d| serde_json::from_value(d).ok());
                }
                record_keys::SERVER_METADATA => {
                    let metadata: Option<ServerMetadata> =
                        data.and_then(|d| serde_json::from_value(d).ok());
                    record.server_name = metadata.as_ref().map(|m| m.name.clone());
                    record.server_instructions =
                        metadata.as_ref().and_then(|m| m.instructions.clone());
                    record.server_icons = metadata.and_then(|m| m.icons);
                }
                record_keys::CAPABILITIES => {
                    record.capabilities = data.and_then(|d| serde_json::from_value(d).ok());
                }
                other => {
                    warn!(key = other, "ignoring write to unknown cache key");
                    return;
                }
            }
            if nonce.is_some() {
                record.nonce = nonce;
            }
        });
    }

    fn flush(&self) {
        self.store.flush();
    }
}
