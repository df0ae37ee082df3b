//! Cache behavior across components sharing one store
//!
//! TTL expiry, schema-version scoping, remote-store fallback and the way
//! the semantic cache, plan cache and prompt builder coexist on the same
//! namespace.

use std::sync::Arc;
use std::time::Duration;

use sluice::ai::semantic::{Embedder, KeywordProvider, SemanticCache};
use sluice::cache::{CacheLevel, CacheStore, HealthStatus};
use sluice::config::{CacheConfig, PlanCacheConfig, SemanticConfig, SqlDialect};
use sluice::schema::{ColumnInfo, SchemaDefinition, TableInfo};
use sluice::sql::plan::QueryPlanCache;
use sluice::sql::prompt::PromptBuilder;

fn semantic_cache(store: Arc<CacheStore>) -> SemanticCache {
    let config = SemanticConfig::default();
    let embedder = Arc::new(Embedder::new(
        Arc::new(KeywordProvider::new(config.embedding_dim)),
        &config,
    ));
    SemanticCache::new(store, embedder, config)
}

fn users_schema() -> SchemaDefinition {
    SchemaDefinition::new().with_table(
        "users",
        TableInfo::new(vec![
            ColumnInfo::new("id", "INTEGER").primary_key(),
            ColumnInfo::new("name", "TEXT"),
        ]),
    )
}

#[test]
fn test_entries_expire_after_ttl() {
    let store = CacheStore::in_memory();
    assert!(store.set(
        "answer",
        &"SELECT 1",
        CacheLevel::Sql,
        Some(Duration::from_millis(50)),
        None
    ));
    assert_eq!(
        store.get::<String>("answer", CacheLevel::Sql, true),
        Some("SELECT 1".to_string())
    );

    std::thread::sleep(Duration::from_millis(120));
    assert_eq!(store.get::<String>("answer", CacheLevel::Sql, true), None);
}

#[test]
fn test_schema_change_clears_only_schema_scoped_levels() {
    let store = CacheStore::in_memory();
    store.update_schema_version("v1");

    store.set("rendered", &"Table: users", CacheLevel::Schema, None, None);
    store.set("components", &"prompt", CacheLevel::Prompt, None, None);
    store.set("answer", &"SELECT 1", CacheLevel::Sql, None, None);
    store.cache_system_prompt("base", "You are a SQL expert");

    assert!(store.update_schema_version("v2"));
    assert!(!store.update_schema_version("v2"));

    assert_eq!(store.get::<String>("rendered", CacheLevel::Schema, true), None);
    assert_eq!(store.get::<String>("components", CacheLevel::Prompt, true), None);
    assert!(store.get::<String>("answer", CacheLevel::Sql, true).is_some());
    assert_eq!(
        store.get_system_prompt("base").as_deref(),
        Some("You are a SQL expert")
    );
    assert_eq!(
        store.metrics().current_schema_version.as_deref(),
        Some("v2")
    );
}

#[test]
fn test_stale_schema_entry_is_dropped_on_read() {
    let store = CacheStore::in_memory();
    store.update_schema_version("v2");
    store.set("rendered", &"old", CacheLevel::Schema, None, Some("v1"));

    assert_eq!(store.get::<String>("rendered", CacheLevel::Schema, true), None);
    // the mismatching entry was removed, not just skipped
    assert_eq!(store.get::<String>("rendered", CacheLevel::Schema, false), None);
}

#[test]
fn test_unreachable_remote_falls_back_to_memory() {
    let store = CacheStore::new(CacheConfig {
        redis_url: Some("redis://127.0.0.1:1".to_string()),
        connect_timeout_ms: 200,
        ..CacheConfig::default()
    });

    let health = store.health_check();
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(store.metrics().backend, "memory");
    assert!(!store.metrics().redis_connected);

    assert!(store.set("k", &42u32, CacheLevel::Sql, None, None));
    assert_eq!(store.get::<u32>("k", CacheLevel::Sql, true), Some(42));
}

#[test]
fn test_disabled_cache_is_a_no_op() {
    let store = CacheStore::new(CacheConfig {
        enabled: false,
        ..CacheConfig::default()
    });
    assert!(!store.set("k", &1u8, CacheLevel::Sql, None, None));
    assert_eq!(store.get::<u8>("k", CacheLevel::Sql, true), None);
    assert_eq!(store.health_check().status, HealthStatus::Disabled);
}

#[tokio::test]
async fn test_semantic_answers_scoped_to_schema_version() {
    let store = Arc::new(CacheStore::in_memory());
    let cache = semantic_cache(store.clone());
    let tables = vec!["users".to_string()];

    assert!(
        cache
            .store(
                "How many users are there?",
                "SELECT COUNT(*) FROM users",
                "counts users",
                "count",
                &tables,
                Some("v1"),
            )
            .await
    );

    let (hit, similarity) = cache
        .lookup("how many users are there?", Some("v1"), true)
        .await
        .expect("exact hit under the same version");
    assert_eq!(hit.sql, "SELECT COUNT(*) FROM users");
    assert_eq!(similarity, 1.0);

    assert!(cache
        .lookup("How many users are there?", Some("v2"), true)
        .await
        .is_none());
}

#[tokio::test]
async fn test_plan_and_semantic_caches_share_the_sql_level() {
    let store = Arc::new(CacheStore::in_memory());
    let cache = semantic_cache(store.clone());
    let plans = QueryPlanCache::new(store.clone(), PlanCacheConfig::default());
    let tables = vec!["users".to_string()];

    cache
        .store(
            "top 5 users by age",
            "SELECT name FROM users ORDER BY age DESC LIMIT 5",
            "oldest users",
            "max",
            &tables,
            None,
        )
        .await;
    let key = plans.put(
        "top 5 users by age",
        "SELECT name FROM users ORDER BY age DESC LIMIT 5",
        &tables,
        &[],
        0.9,
    );
    assert!(key.is_some());
    assert!(store.metrics().total_entries >= 2);

    // dropping plans leaves cached answers in place
    assert_eq!(plans.invalidate(None), 1);
    assert!(plans.get("top 8 users by age", Some(&tables)).is_none());
    assert!(cache.lookup("top 5 users by age", None, false).await.is_some());

    assert!(cache.invalidate_all() >= 1);
    assert!(cache.lookup("top 5 users by age", None, false).await.is_none());
}

#[test]
fn test_prompt_components_rebuilt_after_schema_change() {
    let store = Arc::new(CacheStore::in_memory());
    store.update_schema_version("v1");
    let builder = PromptBuilder::new(store.clone(), SqlDialect::Sqlite, 4);
    let schema = users_schema();

    let (first, cached) = builder.components(&schema, Some("v1"));
    assert!(!cached);
    let (_, cached) = builder.components(&schema, Some("v1"));
    assert!(cached);

    store.update_schema_version("v2");
    let (rebuilt, cached) = builder.components(&schema, Some("v1"));
    assert!(!cached, "prompt level is dropped on schema change");
    assert_eq!(rebuilt.schema_text, first.schema_text);
}
