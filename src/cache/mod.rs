pub mod capability_cache;
pub mod store;

pub use capability_cache::{CachedEntry, CapabilityCache, Staleness};
pub use store::{
    record_keys, BlobStore, MemoryStore, ServerRecordStore, StoredServerData, StoredState,
    STORAGE_KEY,
};
