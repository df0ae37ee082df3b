//! Property-based tests for pipeline invariants
//!
//! Uses proptest to verify that schema hashing, normalization,
//! post-processing, validation and plan templates behave consistently
//! across randomly generated inputs.
#![allow(clippy::unwrap_used)]

use proptest::prelude::*;

use std::collections::BTreeSet;
use std::sync::Arc;

use sluice::ai::semantic::{cosine_similarity, EmbeddingProvider, KeywordProvider, QueryNormalizer};
use sluice::cache::CacheStore;
use sluice::config::PlanCacheConfig;
use sluice::schema::{ColumnInfo, SchemaDefinition, TableInfo};
use sluice::sql::plan::QueryPlanCache;
use sluice::sql::validate::{SqlPostProcessor, SqlValidator, ValidationErrorKind};

// ============================================================================
// Test Strategies
// ============================================================================

/// Strategy for identifier-like table and column names
fn ident_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z_]{0,11}"
}

/// Strategy for SQL column types
fn type_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("INTEGER".to_string()),
        Just("TEXT".to_string()),
        Just("REAL".to_string()),
        Just("TIMESTAMP".to_string()),
    ]
}

/// Strategy for a table's columns, unique by name
fn columns_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::btree_map(ident_strategy(), type_strategy(), 1..8)
        .prop_map(|cols| cols.into_iter().collect())
}

/// Strategy for questions built from realistic vocabulary
fn question_strategy() -> impl Strategy<Value = String> {
    let word = prop_oneof![
        Just("how".to_string()),
        Just("many".to_string()),
        Just("Users".to_string()),
        Just("ORDERS".to_string()),
        Just("top".to_string()),
        Just("five".to_string()),
        Just("twenty".to_string()),
        Just("since".to_string()),
        Just("2024-01-31".to_string()),
        Just("by".to_string()),
        Just("a.b@example.com".to_string()),
        Just("total?".to_string()),
        (0u32..5000).prop_map(|n| n.to_string()),
    ];
    let gap = prop_oneof![Just(" "), Just("  "), Just("\t")];
    prop::collection::vec((word, gap), 1..12).prop_map(|parts| {
        parts
            .into_iter()
            .map(|(w, g)| format!("{}{}", w, g))
            .collect::<String>()
    })
}

/// Strategy for simple SELECT statements with random keyword case and spacing
fn select_strategy() -> impl Strategy<Value = String> {
    let kw = |word: &'static str| {
        prop_oneof![
            Just(word.to_string()),
            Just(word.to_lowercase()),
            Just(word.to_uppercase())
        ]
    };
    let space = prop_oneof![Just(" "), Just("  "), Just("\n  ")];
    (
        kw("Select"),
        prop::sample::select(vec!["name", "*", "COUNT(*)", "id, name"]),
        space.clone(),
        kw("From"),
        ident_strategy(),
        prop::option::of((kw("Where"), 0u32..1000)),
        prop::option::of(kw("Order By")),
        prop::option::of((kw("Limit"), 1u32..500)),
        space,
    )
        .prop_map(
            |(select, cols, gap, from, table, filter, order, limit, tail)| {
                let mut sql = format!("{} {}{}{} {}", select, cols, gap, from, table);
                if let Some((kw, n)) = filter {
                    sql.push_str(&format!(" {} id > {}", kw, n));
                }
                if let Some(kw) = order {
                    sql.push_str(&format!(" {} id", kw));
                }
                if let Some((kw, n)) = limit {
                    sql.push_str(&format!(" {} {}", kw, n));
                }
                sql.push_str(tail);
                sql
            },
        )
}

// ============================================================================
// Schema Properties
// ============================================================================

proptest! {
    /// Column declaration order never changes the schema version
    #[test]
    fn prop_schema_hash_ignores_column_order(table in ident_strategy(), columns in columns_strategy()) {
        let forward: Vec<ColumnInfo> = columns.iter().map(|(n, t)| ColumnInfo::new(n, t)).collect();
        let reversed: Vec<ColumnInfo> = forward.iter().rev().cloned().collect();

        let a = SchemaDefinition::new().with_table(table.clone(), TableInfo::new(forward));
        let b = SchemaDefinition::new().with_table(table, TableInfo::new(reversed));
        prop_assert_eq!(a.version_hash(), b.version_hash());
    }

    /// Changing any column's type changes the schema version
    #[test]
    fn prop_schema_hash_tracks_types(table in ident_strategy(), columns in columns_strategy()) {
        let original: Vec<ColumnInfo> = columns.iter().map(|(n, t)| ColumnInfo::new(n, t)).collect();
        let mut changed = original.clone();
        changed[0].data_type = format!("{}_CHANGED", changed[0].data_type);

        let a = SchemaDefinition::new().with_table(table.clone(), TableInfo::new(original));
        let b = SchemaDefinition::new().with_table(table, TableInfo::new(changed));
        prop_assert_ne!(a.version_hash(), b.version_hash());
    }
}

// ============================================================================
// Normalization and Embedding Properties
// ============================================================================

proptest! {
    /// normalize(normalize(q)) == normalize(q)
    #[test]
    fn prop_normalize_is_idempotent(question in question_strategy()) {
        let once = QueryNormalizer::normalize(&question);
        let twice = QueryNormalizer::normalize(&once);
        prop_assert_eq!(once, twice);
    }

    /// Normalized questions have no surrounding or repeated whitespace
    #[test]
    fn prop_normalize_collapses_whitespace(question in question_strategy()) {
        let normalized = QueryNormalizer::normalize(&question);
        prop_assert_eq!(normalized.trim(), normalized.as_str());
        prop_assert!(!normalized.contains("  "));
        prop_assert!(!normalized.contains('\t'));
    }

    /// Keyword embeddings are unit length, so self-similarity is 1
    #[test]
    fn prop_keyword_embedding_self_similarity(question in question_strategy()) {
        let provider = KeywordProvider::new(128);
        let normalized = QueryNormalizer::normalize(&question);
        let v = provider.embed(&normalized).unwrap();
        prop_assert_eq!(v.len(), 128);
        let s = cosine_similarity(&v, &v);
        prop_assert!((s - 1.0).abs() < 1e-4 || s == 0.0, "self similarity {}", s);
    }
}

// ============================================================================
// SQL Properties
// ============================================================================

proptest! {
    /// Post-processing is idempotent
    #[test]
    fn prop_postprocess_is_idempotent(sql in select_strategy()) {
        let pp = SqlPostProcessor::new(100);
        let once = pp.process(&sql);
        let twice = pp.process(&once);
        prop_assert_eq!(once, twice);
    }

    /// Post-processed SELECTs are bounded by a LIMIT or an aggregate
    #[test]
    fn prop_postprocess_bounds_rows(sql in select_strategy()) {
        let processed = SqlPostProcessor::new(100).process(&sql);
        prop_assert!(processed.contains("LIMIT") || processed.contains("COUNT(*)"),
            "unbounded: {}", processed);
    }

    /// Data-modifying statements are never valid
    #[test]
    fn prop_writes_always_rejected(
        table in ident_strategy(),
        verb in prop::sample::select(vec!["DELETE FROM", "DROP TABLE", "TRUNCATE TABLE", "delete from"]),
    ) {
        let tables: BTreeSet<String> = [table.clone()].into_iter().collect();
        let validator = SqlValidator::new(tables, std::collections::BTreeMap::<String, Vec<String>>::new());
        let result = validator.validate(&format!("{} {}", verb, table));
        prop_assert!(!result.is_valid);
        prop_assert!(result.has_error(ValidationErrorKind::DangerousQuery));
    }

    /// A cached top-N plan refills with the new question's N
    #[test]
    fn prop_plan_template_refill(first in 2u32..500, second in 2u32..500) {
        let plans = QueryPlanCache::new(Arc::new(CacheStore::in_memory()), PlanCacheConfig::default());
        let tables = vec!["users".to_string()];
        let sql = format!("SELECT name, age FROM users ORDER BY age DESC LIMIT {}", first);

        let first_question = format!("top {} users by age", first);
        prop_assert!(plans.put(&first_question, &sql, &tables, &[], 0.9).is_some());

        let (plan, params) = plans
            .get(&format!("top {} users by age", second), Some(&tables))
            .expect("plan for the same pattern and tables");
        let filled = QueryPlanCache::fill_template(&plan, &params);
        prop_assert!(!QueryPlanCache::is_unfilled(&filled));
        prop_assert_eq!(filled, format!("SELECT name, age FROM users ORDER BY age DESC LIMIT {}", second));
    }
}
