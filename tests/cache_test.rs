use mcplink::cache::{
    record_keys, BlobStore, CapabilityCache, MemoryStore, ServerRecordStore, Staleness,
    StoredState, STORAGE_KEY,
};
use mcplink::protocol::ToolDefinition;
use serde_json::json;
use std::sync::Arc;

fn tool(name: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        title: None,
        description: None,
        input_schema: None,
        annotations: None,
    }
}

fn tools_cache(store: Arc<dyn BlobStore>) -> CapabilityCache<Vec<ToolDefinition>> {
    CapabilityCache::persisted_json(record_keys::TOOLS, store, None, Vec::new())
}

fn record_store(store: &Arc<MemoryStore>, server: &str) -> Arc<dyn BlobStore> {
    Arc::new(ServerRecordStore::new(
        store.clone() as Arc<dyn BlobStore>,
        server,
    ))
}

#[test]
fn staleness_unknown_without_any_source() {
    let store = Arc::new(MemoryStore::new());
    let cache = tools_cache(record_store(&store, "s1"));
    assert_eq!(cache.staleness(), Staleness::Unknown);
    assert!(cache.value().is_empty());
}

#[test]
fn staleness_cached_when_persisted_nonce_matches() {
    let store = Arc::new(MemoryStore::new());
    {
        let cache = tools_cache(record_store(&store, "s1"));
        cache.set_current_nonce(Some("N".to_string()));
        cache.resolve_fetch(vec![tool("a")], Some("N".to_string()));
        assert_eq!(cache.staleness(), Staleness::Live);
    }
    // Cold start over the same store: persisted nonce N, current nonce N.
    let cache = tools_cache(record_store(&store, "s1"));
    cache.set_current_nonce(Some("N".to_string()));
    assert_eq!(cache.staleness(), Staleness::Cached);
    assert_eq!(cache.value(), vec![tool("a")]);
}

#[test]
fn staleness_outdated_when_nonce_differs() {
    let store = Arc::new(MemoryStore::new());
    {
        let cache = tools_cache(record_store(&store, "s1"));
        cache.resolve_fetch(vec![tool("a")], Some("N".to_string()));
    }
    let cache = tools_cache(record_store(&store, "s1"));
    cache.set_current_nonce(Some("M".to_string()));
    assert_eq!(cache.staleness(), Staleness::Outdated);
}

#[test]
fn staleness_while_refreshing_depends_on_persisted_entry() {
    let store = Arc::new(MemoryStore::new());
    let cache = tools_cache(record_store(&store, "s1"));
    cache.begin_fetch();
    assert_eq!(cache.staleness(), Staleness::RefreshingFromUnknown);

    cache.resolve_fetch(vec![tool("a")], Some("N".to_string()));
    cache.begin_fetch();
    assert_eq!(cache.staleness(), Staleness::RefreshingFromCached);
}

#[test]
fn failed_fetch_falls_back_to_the_idle_rule() {
    let store = Arc::new(MemoryStore::new());
    let cache = tools_cache(record_store(&store, "s1"));
    cache.begin_fetch();
    cache.fail_fetch();
    assert_eq!(cache.staleness(), Staleness::Unknown);

    cache.resolve_fetch(vec![tool("a")], Some("N".to_string()));
    cache.set_current_nonce(Some("N".to_string()));
    cache.begin_fetch();
    cache.fail_fetch();
    assert_eq!(cache.staleness(), Staleness::Cached);
}

#[test]
fn resolved_fetch_is_live_only_under_the_current_nonce() {
    let store = Arc::new(MemoryStore::new());
    let cache = tools_cache(record_store(&store, "s1"));
    cache.set_current_nonce(Some("N".to_string()));
    cache.resolve_fetch(vec![tool("a")], Some("N".to_string()));
    assert_eq!(cache.staleness(), Staleness::Live);

    cache.set_current_nonce(Some("M".to_string()));
    assert_eq!(cache.staleness(), Staleness::Outdated);
}

#[test]
fn static_definition_reads_cached_and_loses_to_live() {
    let store = Arc::new(MemoryStore::new());
    let cache = CapabilityCache::persisted_json(
        record_keys::TOOLS,
        record_store(&store, "s1"),
        Some(vec![tool("declared")]),
        Vec::new(),
    );
    assert_eq!(cache.staleness(), Staleness::Cached);
    assert_eq!(cache.value(), vec![tool("declared")]);

    cache.resolve_fetch(vec![tool("live")], None);
    assert_eq!(cache.value(), vec![tool("live")]);

    cache.reset_live();
    assert_eq!(cache.value(), vec![tool("declared")]);
}

#[test]
fn successful_fetch_persists_before_exposing() {
    let store = Arc::new(MemoryStore::new());
    let cache = tools_cache(record_store(&store, "s1"));
    cache.resolve_fetch(vec![tool("a")], Some("N".to_string()));

    // The aggregate blob was written synchronously.
    let state = StoredState::load(store.as_ref());
    let record = state.server("s1").expect("record persisted");
    assert_eq!(record.tools.as_ref().unwrap()[0].name, "a");
    assert_eq!(record.nonce.as_deref(), Some("N"));
}

#[test]
fn decorator_runs_on_every_exposed_value() {
    let store: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());
    let cache: CapabilityCache<Vec<ToolDefinition>> = CapabilityCache::new(
        "tools",
        store,
        None,
        Box::new(|raw| serde_json::from_value(raw).ok()),
        Box::new(|entry| serde_json::to_value(entry).unwrap()),
        Box::new(|mut tools: Vec<ToolDefinition>| {
            for t in &mut tools {
                t.name = format!("srv.{}", t.name);
            }
            tools
        }),
        Vec::new(),
    );
    cache.resolve_fetch(vec![tool("a")], None);
    assert_eq!(cache.value()[0].name, "srv.a");
}

#[test]
fn clear_resets_everything_including_persisted() {
    let store = Arc::new(MemoryStore::new());
    let cache = tools_cache(record_store(&store, "s1"));
    cache.resolve_fetch(vec![tool("a")], Some("N".to_string()));
    cache.clear();
    assert_eq!(cache.staleness(), Staleness::Unknown);
    assert!(cache.value().is_empty());
}

#[test]
fn corrupt_blob_degrades_to_empty_state() {
    let store = Arc::new(MemoryStore::new());
    store.set(STORAGE_KEY, json!("definitely not an object"));

    let state = StoredState::load(store.as_ref());
    assert!(state.server_tools.is_empty());
    assert!(state.extension_servers.is_empty());

    let cache = tools_cache(record_store(&store, "s1"));
    assert_eq!(cache.staleness(), Staleness::Unknown);
}

#[test]
fn records_are_namespaced_per_server() {
    let store = Arc::new(MemoryStore::new());
    let one = tools_cache(record_store(&store, "alpha"));
    let two = tools_cache(record_store(&store, "beta"));
    one.resolve_fetch(vec![tool("a")], Some("N".to_string()));
    two.resolve_fetch(vec![tool("b")], Some("M".to_string()));

    let fresh_one = tools_cache(record_store(&store, "alpha"));
    let fresh_two = tools_cache(record_store(&store, "beta"));
    assert_eq!(fresh_one.value(), vec![tool("a")]);
    assert_eq!(fresh_two.value(), vec![tool("b")]);
}

#[test]
fn persisted_layout_uses_camel_case_pair_lists() {
    let store = Arc::new(MemoryStore::new());
    let cache = tools_cache(record_store(&store, "s1"));
    cache.resolve_fetch(vec![tool("a")], Some("N".to_string()));

    let raw = store.get(STORAGE_KEY).unwrap();
    assert!(raw.get("serverTools").is_some());
    assert!(raw.get("extensionServers").is_some());
    assert_eq!(raw["serverTools"][0][0], json!("s1"));
    assert_eq!(raw["serverTools"][0][1]["nonce"], json!("N"));
}

#[tokio::test]
async fn subscribers_see_change_ticks() {
    let store = Arc::new(MemoryStore::new());
    let cache = tools_cache(record_store(&store, "s1"));
    let mut changes = cache.subscribe();
    let before = *changes.borrow_and_update();

    cache.begin_fetch();
    changes.changed().await.unwrap();
    assert_ne!(*changes.borrow_and_update(), before);

    cache.resolve_fetch(vec![tool("a")], None);
    changes.changed().await.unwrap();
    assert_eq!(cache.snapshot().0, vec![tool("a")]);
}
