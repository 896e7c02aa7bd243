//! Staleness-aware reconciliation of static, persisted and live values
//!
//! A [`CapabilityCache`] presents one value per capability, assembled from
//! three possibly-absent sources, plus a derived staleness class. Callers
//! never see which source won.

use crate::cache::store::BlobStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// A cached value together with the server-side version token it was
/// fetched under. The nonce is opaque; it exists only for staleness
/// comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry<T> {
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Derived freshness classification. Never stored; recomputed from the
/// current sources on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// No source has ever produced a value.
    Unknown,
    /// Serving a static definition or a persisted entry whose nonce still
    /// matches the current one.
    Cached,
    /// Serving a value recorded under a different nonce.
    Outdated,
    /// A live fetch is in flight; a persisted entry is served meanwhile.
    RefreshingFromCached,
    /// A live fetch is in flight with nothing to serve meanwhile.
    RefreshingFromUnknown,
    /// The live fetch resolved under the current nonce.
    Live,
}

enum LiveState<T> {
    Idle,
    Fetching,
    Resolved { data: T, nonce: Option<String> },
    Failed,
}

struct Inner<T> {
    static_definition: Option<T>,
    persisted: Option<CachedEntry<T>>,
    live: LiveState<T>,
    current_nonce: Option<String>,
}

type Projector<T> = Box<dyn Fn(Value) -> Option<CachedEntry<T>> + Send + Sync>;
type Persister<T> = Box<dyn Fn(&CachedEntry<T>) -> Value + Send + Sync>;
type Decorator<T> = Box<dyn Fn(T) -> T + Send + Sync>;

pub struct CapabilityCache<T: Clone> {
    key: String,
    store: Arc<dyn BlobStore>,
    persist: Persister<T>,
    decorate: Decorator<T>,
    default: T,
    inner: parking_lot::Mutex<Inner<T>>,
    changed: watch::Sender<u64>,
}

impl<T: Clone> CapabilityCache<T> {
    /// Build a cache over a namespaced store. The projector maps the
    /// persisted blob (loaded once here) back into an entry; the persister
    /// is the inverse; the decorator runs on every exposed value.
    pub fn new(
        key: impl Into<String>,
        store: Arc<dyn BlobStore>,
        static_definition: Option<T>,
        project: Projector<T>,
        persist: Persister<T>,
        decorate: Decorator<T>,
        default: T,
    ) -> Self {
        let key = key.into();
        let persisted = store.get(&key).and_then(&project);
        let (changed, _) = watch::channel(0);
        Self {
            key,
            store,
            persist,
            decorate,
            default,
            inner: parking_lot::Mutex::new(Inner {
                static_definition,
                persisted,
                live: LiveState::Idle,
                current_nonce: None,
            }),
            changed,
        }
    }

    fn bump(&self) {
        self.changed.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Watch for change ticks; pair with [`value`]/[`staleness`] getters.
    ///
    /// [`value`]: CapabilityCache::value
    /// [`staleness`]: CapabilityCache::staleness
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    /// Replace the static definition. When present it is served whenever
    /// no live fetch has resolved.
    pub fn set_static(&self, definition: Option<T>) {
        self.inner.lock().static_definition = definition;
        self.bump();
    }

    /// Update the latest known server-side version token.
    pub fn set_current_nonce(&self, nonce: Option<String>) {
        self.inner.lock().current_nonce = nonce;
        self.bump();
    }

    /// Mark a live fetch as in flight.
    pub fn begin_fetch(&self) {
        self.inner.lock().live = LiveState::Fetching;
        self.bump();
    }

    /// Record a successful live fetch. The entry is persisted before the
    /// value is exposed, so a later cold start serves `Cached` rather than
    /// `Unknown`.
    pub fn resolve_fetch(&self, data: T, nonce: Option<String>) {
        let entry = CachedEntry {
            data: data.clone(),
            nonce: nonce.clone(),
        };
        self.store.set(&self.key, (self.persist)(&entry));
        let mut inner = self.inner.lock();
        inner.persisted = Some(entry);
        inner.live = LiveState::Resolved { data, nonce };
        drop(inner);
        self.bump();
    }

    /// Record a failed live fetch; staleness falls back to the idle rule.
    pub fn fail_fetch(&self) {
        self.inner.lock().live = LiveState::Failed;
        self.bump();
    }

    /// Drop live state only (persisted and static survive).
    pub fn reset_live(&self) {
        self.inner.lock().live = LiveState::Idle;
        self.bump();
    }

    /// Full reset, including the persisted entry.
    pub fn clear(&self) {
        self.store.set(&self.key, Value::Null);
        let mut inner = self.inner.lock();
        inner.persisted = None;
        inner.static_definition = None;
        inner.live = LiveState::Idle;
        inner.current_nonce = None;
        drop(inner);
        self.bump();
    }

    /// The exposed value: live (resolved) over static over persisted over
    /// default, decorated.
    pub fn value(&self) -> T {
        let inner = self.inner.lock();
        let effective = match &inner.live {
            LiveState::Resolved { data, .. } => data.clone(),
            _ => inner
                .static_definition
                .clone()
                .or_else(|| inner.persisted.as_ref().map(|p| p.data.clone()))
                .unwrap_or_else(|| self.default.clone()),
        };
        drop(inner);
        (self.decorate)(effective)
    }

    pub fn staleness(&self) -> Staleness {
        let inner = self.inner.lock();
        match &inner.live {
            LiveState::Fetching => {
                if inner.persisted.is_some() {
                    Staleness::RefreshingFromCached
                } else {
                    Staleness::RefreshingFromUnknown
                }
            }
            LiveState::Resolved { nonce, .. } => {
                if *nonce == inner.current_nonce {
                    Staleness::Live
                } else {
                    Staleness::Outdated
                }
            }
            LiveState::Idle | LiveState::Failed => {
                let persisted_fresh = inner
                    .persisted
                    .as_ref()
                    .map_or(false, |p| p.nonce == inner.current_nonce);
                if inner.static_definition.is_some() || persisted_fresh {
                    Staleness::Cached
                } else if inner.persisted.is_some() {
                    Staleness::Outdated
                } else {
                    Staleness::Unknown
                }
            }
        }
    }

    pub fn snapshot(&self) -> (T, Staleness) {
        (self.value(), self.staleness())
    }
}

impl<T: Clone + Serialize + DeserializeOwned> CapabilityCache<T> {
    /// Convenience constructor for values persisted via serde, with an
    /// identity decorator.
    pub fn persisted_json(
        key: impl Into<String>,
        store: Arc<dyn BlobStore>,
        static_definition: Option<T>,
        default: T,
    ) -> Self {
        Self::new(
            key,
            store,
            static_definition,
            Box::new(|raw| serde_json::from_value(raw).ok()),
            Box::new(|entry| {
                serde_json::to_value(entry).unwrap_or_else(|e| {
                    warn!(error = %e, "unserializable cache entry");
                    Value::Null
                })
            }),
            Box::new(|value| value),
            default,
        )
    }
}
