//! Tests for queries: parameter tracking, pagination continuity and
//! persistence.

mod common;

use common::{settle_tasks, Gate};
use resource_flow::{
    CacheConfig, MemoryStore, PaginationPlaceholder, PersistenceStore, Persister, Query,
    ResourceCache, ResourceStatus, Runtime,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Pagination {
    page: u32,
    page_size: u32,
}

fn page_key(p: &Pagination) -> String {
    format!("{}-{}", p.page, p.page_size)
}

// ============================================================================
// Parameter tracking
// ============================================================================

#[tokio::test]
async fn test_params_change_switches_key() {
    let runtime = Runtime::new();
    let pagination = runtime.cell(Pagination {
        page: 1,
        page_size: 4,
    });
    let gate: Gate<Pagination, Vec<u32>> = Gate::new();
    let users = Query::builder(&runtime, "users", gate.loader())
        .params(&pagination)
        .identifier(page_key)
        .build()
        .unwrap();

    assert_eq!(users.key().as_deref(), Some("1-4"));
    assert_eq!(users.status(), ResourceStatus::Loading);
    assert!(!users.has_value());

    gate.wait_for_calls(1).await;
    gate.resolve(0, vec![1, 2, 3, 4]);
    let state = users.until_settled().await;
    assert!(state.is_resolved());
    assert_eq!(state.value, Some(vec![1, 2, 3, 4]));
    assert_eq!(users.signal().get(), state);

    // Without a display strategy the next page shows no value while loading.
    pagination.update(|p| p.page = 2);
    assert_eq!(users.key().as_deref(), Some("2-4"));
    assert_eq!(users.status(), ResourceStatus::Loading);
    assert!(users.value().is_none());
    assert_eq!(users.params().map(|p| p.page), Some(2));

    // Going back to a resolved page is served from the cache.
    pagination.update(|p| p.page = 1);
    assert_eq!(users.status(), ResourceStatus::Resolved);
    assert_eq!(users.value(), Some(vec![1, 2, 3, 4]));
    settle_tasks().await;
    assert_eq!(gate.calls(), 2);
}

#[tokio::test]
async fn test_absent_params_load_nothing() {
    let runtime = Runtime::new();
    let user_id = runtime.cell(None::<u32>);
    let gate: Gate<u32, String> = Gate::new();
    let user = Query::builder(&runtime, "user", gate.loader())
        .optional_params(&user_id)
        .build()
        .unwrap();

    settle_tasks().await;
    assert_eq!(gate.calls(), 0);
    assert_eq!(user.status(), ResourceStatus::Idle);
    assert!(user.reload().is_none());

    user_id.set(Some(7));
    gate.wait_for_calls(1).await;
    assert_eq!(gate.params(0), 7);
    assert_eq!(user.key().as_deref(), Some("7"));
}

#[tokio::test]
async fn test_shared_cache_dedups_queries() {
    let runtime = Runtime::new();
    let cache: ResourceCache<u32, String> = ResourceCache::new(&runtime, "users");
    let gate: Gate<u32, String> = Gate::new();
    let a = Query::builder(&runtime, "a", gate.loader())
        .fixed_params(1)
        .cache(cache.clone())
        .build()
        .unwrap();
    let b = Query::builder(&runtime, "b", gate.loader())
        .fixed_params(1)
        .cache(cache.clone())
        .build()
        .unwrap();

    settle_tasks().await;
    assert_eq!(gate.calls(), 1);
    gate.resolve(0, "alice".to_string());
    a.until_settled().await;
    assert_eq!(b.value().as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_reload_and_invalidate() {
    let runtime = Runtime::new();
    let gate: Gate<u32, String> = Gate::new();
    let user = Query::builder(&runtime, "user", gate.loader())
        .fixed_params(1)
        .build()
        .unwrap();
    gate.wait_for_calls(1).await;
    gate.resolve(0, "v1".to_string());
    user.until_settled().await;

    let reload = user.reload().unwrap();
    assert_eq!(user.status(), ResourceStatus::Loading);
    assert_eq!(user.value().as_deref(), Some("v1"));
    gate.wait_for_calls(2).await;
    gate.resolve(1, "v2".to_string());
    assert_eq!(reload.await.unwrap(), "v2");
    assert_eq!(user.value().as_deref(), Some("v2"));

    user.invalidate();
    gate.wait_for_calls(3).await;
    gate.fail(2, "offline");
    let state = user.until_settled().await;
    assert_eq!(state.status, ResourceStatus::Error);
    assert_eq!(state.value.as_deref(), Some("v2"));
    assert_eq!(user.error().map(|e| e.to_string()).as_deref(), Some("offline"));
}

#[tokio::test]
async fn test_reload_joins_initial_load() {
    let runtime = Runtime::new();
    let gate: Gate<u32, String> = Gate::new();
    let user = Query::builder(&runtime, "user", gate.loader())
        .fixed_params(1)
        .build()
        .unwrap();

    let reload = user.reload().unwrap();
    assert_eq!(reload.generation(), 1);
    settle_tasks().await;
    assert_eq!(gate.calls(), 1);
    gate.resolve(0, "v1".to_string());
    assert_eq!(reload.await.unwrap(), "v1");

    // An invalidated key is never joined.
    let pending = user.reload().unwrap();
    user.invalidate();
    gate.wait_for_calls(3).await;
    gate.resolve(2, "v3".to_string());
    gate.resolve(1, "v2".to_string());
    assert_eq!(pending.await.unwrap(), "v2");
    let state = user.until_settled().await;
    assert_eq!(state.value.as_deref(), Some("v3"));
}

// ============================================================================
// Pagination continuity
// ============================================================================

#[tokio::test]
async fn test_preserve_previous_value_while_next_page_loads() {
    let runtime = Runtime::new();
    let pagination = runtime.cell(Pagination {
        page: 1,
        page_size: 4,
    });
    let gate: Gate<Pagination, Vec<u32>> = Gate::new();
    let users = Query::builder(&runtime, "users", gate.loader())
        .params(&pagination)
        .identifier(page_key)
        .preserve_previous_value(true)
        .build()
        .unwrap();
    gate.wait_for_calls(1).await;
    gate.resolve(0, vec![1, 2, 3, 4]);
    users.until_settled().await;

    pagination.update(|p| p.page = 2);
    let state = users.state();
    assert_eq!(state.status, ResourceStatus::Loading);
    assert_eq!(state.value, Some(vec![1, 2, 3, 4]));
    assert!(state.is_placeholder);
    assert_eq!(users.signal().get(), state);

    gate.wait_for_calls(2).await;
    gate.resolve(1, vec![5, 6, 7, 8]);
    let state = users.until_settled().await;
    assert_eq!(state.status, ResourceStatus::Resolved);
    assert_eq!(state.value, Some(vec![5, 6, 7, 8]));
    assert!(!state.is_placeholder);
}

#[tokio::test]
async fn test_placeholder_data() {
    let runtime = Runtime::new();
    let pagination = runtime.cell(Pagination {
        page: 1,
        page_size: 2,
    });
    let gate: Gate<Pagination, Vec<u32>> = Gate::new();
    let users = Query::builder(&runtime, "users", gate.loader())
        .params(&pagination)
        .placeholder(
            |previous: Option<&Vec<u32>>,
             _: Option<&Pagination>,
             next: &Pagination|
             -> Option<Vec<u32>> {
                previous.map(|items| items.iter().map(|id| id + next.page_size).collect())
            },
        )
        .build()
        .unwrap();
    gate.wait_for_calls(1).await;
    gate.resolve(0, vec![1, 2]);
    users.until_settled().await;

    pagination.update(|p| p.page = 2);
    assert!(users.is_placeholder());
    assert_eq!(users.value(), Some(vec![3, 4]));
    assert!(users.is_loading());
}

#[tokio::test]
async fn test_pagination_placeholder_extension() {
    let runtime = Runtime::new();
    let page = runtime.cell(1u32);
    let gate: Gate<u32, Vec<u32>> = Gate::new();
    let users = Query::builder(&runtime, "users", gate.loader())
        .params(&page)
        .extend(PaginationPlaceholder)
        .build()
        .unwrap();
    gate.wait_for_calls(1).await;
    gate.resolve(0, vec![1, 2]);
    users.until_settled().await;

    page.set(2);
    assert_eq!(users.value(), Some(vec![1, 2]));
    assert!(users.is_placeholder());

    // A failed page shows no provisional value.
    gate.wait_for_calls(2).await;
    gate.fail(1, "boom");
    let state = users.until_settled().await;
    assert_eq!(state.status, ResourceStatus::Error);
    assert!(state.value.is_none());
    assert!(!state.is_placeholder);
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn test_persisted_value_restores_as_local() {
    let store = MemoryStore::new();
    let params = Pagination {
        page: 1,
        page_size: 2,
    };

    {
        let runtime = Runtime::new();
        let users = Query::builder(&runtime, "users", |p: Pagination| async move {
            anyhow::Ok(vec![p.page * 10, p.page * 10 + 1])
        })
        .fixed_params(params)
        .identifier(page_key)
        .extend(Persister::new(store.clone(), "demo-app", "granular"))
        .build()
        .unwrap();
        let state = users.until_settled().await;
        assert_eq!(state.status, ResourceStatus::Resolved);
    }
    assert_eq!(store.keys(), vec!["demo-app:granular:1-2".to_string()]);

    let runtime = Runtime::new();
    let gate: Gate<Pagination, Vec<u32>> = Gate::new();
    let users = Query::builder(&runtime, "users", gate.loader())
        .fixed_params(params)
        .identifier(page_key)
        .extend(Persister::new(store.clone(), "demo-app", "granular"))
        .build()
        .unwrap();

    // Seeded before the loader has had a chance to run.
    assert_eq!(gate.calls(), 0);
    assert_eq!(users.status(), ResourceStatus::Local);
    assert_eq!(users.value(), Some(vec![10, 11]));
    assert!(!users.is_placeholder());

    gate.wait_for_calls(1).await;
    assert_eq!(users.status(), ResourceStatus::Local);
    gate.resolve(0, vec![12]);
    let state = users.until_settled().await;
    assert_eq!(state.status, ResourceStatus::Resolved);
    assert_eq!(state.value, Some(vec![12]));
    assert_eq!(
        store.get("demo-app:granular:1-2").unwrap().as_deref(),
        Some(r#"{"value":[12],"params":{"page":1,"page_size":2}}"#)
    );
}

#[tokio::test]
async fn test_corrupt_persisted_entry_is_a_miss() {
    let store = MemoryStore::new();
    store.set("demo-app:users:1", "not json").unwrap();

    let runtime = Runtime::new();
    let gate: Gate<u32, String> = Gate::new();
    let user = Query::builder(&runtime, "user", gate.loader())
        .fixed_params(1)
        .extend(Persister::new(store.clone(), "demo-app", "users"))
        .build()
        .unwrap();
    assert_eq!(user.status(), ResourceStatus::Loading);
    assert!(!user.has_value());

    gate.wait_for_calls(1).await;
    gate.resolve(0, "alice".to_string());
    user.until_settled().await;
    assert_eq!(
        store.get("demo-app:users:1").unwrap().as_deref(),
        Some(r#"{"value":"alice","params":1}"#)
    );
}

#[tokio::test]
async fn test_persistence_disabled_by_config() {
    let store = MemoryStore::new();
    store
        .set("demo-app:users:1", r#"{"value":"stale","params":1}"#)
        .unwrap();

    let config = CacheConfig::from_toml_str("enable_persistence = false").unwrap();
    let runtime = Runtime::builder().config(config).build();
    let gate: Gate<u32, String> = Gate::new();
    let user = Query::builder(&runtime, "user", gate.loader())
        .fixed_params(1)
        .extend(Persister::new(store.clone(), "demo-app", "users"))
        .build()
        .unwrap();

    assert_eq!(user.status(), ResourceStatus::Loading);
    assert!(!user.has_value());
}
