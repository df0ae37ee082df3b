//! End-to-end pipeline tests with in-process collaborators
//!
//! Drives [`RequestOrchestrator`] through the public API only: generation,
//! caching, schema changes and execution with feedback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sluice::ai::semantic::{Embedder, KeywordProvider};
use sluice::cache::CacheStore;
use sluice::config::Config;
use sluice::schema::{ColumnInfo, SchemaDefinition, TableInfo};
use sluice::sql::StaticSchemaProvider;
use sluice::{
    ChatMessage, Collaborators, Completion, QueryResult, RequestOrchestrator, SqlExecutor,
    SqlQuery,
};

// ============================================================================
// Collaborators
// ============================================================================

fn shop_schema() -> SchemaDefinition {
    SchemaDefinition::new()
        .with_table(
            "users",
            TableInfo::new(vec![
                ColumnInfo::new("id", "INTEGER").primary_key(),
                ColumnInfo::new("name", "TEXT").not_null(),
                ColumnInfo::new("email", "TEXT"),
            ]),
        )
        .with_table(
            "orders",
            TableInfo::new(vec![
                ColumnInfo::new("id", "INTEGER").primary_key(),
                ColumnInfo::new("user_id", "INTEGER"),
                ColumnInfo::new("total_amount", "REAL"),
            ])
            .with_foreign_key("user_id", "users", "id"),
        )
}

/// Replays answers in order and repeats the last one
struct ScriptedModel {
    answers: Mutex<VecDeque<SqlQuery>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    fn new(answers: &[(&str, f32)]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(
                answers
                    .iter()
                    .map(|(sql, confidence)| SqlQuery::new(*sql, "scripted", *confidence))
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Completion for ScriptedModel {
    async fn generate(
        &self,
        _system_prompt: &str,
        _messages: &[ChatMessage],
        _temperature: f32,
    ) -> sluice::Result<SqlQuery> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut answers = self.answers.lock().unwrap();
        let next = if answers.len() > 1 {
            answers.pop_front()
        } else {
            answers.front().cloned()
        };
        next.ok_or_else(|| sluice::SluiceError::Collaborator("nothing scripted".to_string()))
    }
}

/// Fails any statement mentioning a column it does not know
struct ShopDatabase {
    executed: Mutex<Vec<String>>,
}

impl ShopDatabase {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            executed: Mutex::new(Vec::new()),
        })
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SqlExecutor for ShopDatabase {
    async fn execute(&self, sql: &str) -> sluice::Result<QueryResult> {
        self.executed.lock().unwrap().push(sql.to_string());
        if sql.contains("nme") {
            return Ok(QueryResult::error("no such column: nme"));
        }
        let mut row = serde_json::Map::new();
        row.insert("name".to_string(), serde_json::json!("Ada"));
        Ok(QueryResult::ok(vec!["name".to_string()], vec![row], 2))
    }
}

struct Harness {
    orchestrator: RequestOrchestrator,
    model: Arc<ScriptedModel>,
    schema: Arc<StaticSchemaProvider>,
    database: Arc<ShopDatabase>,
}

fn harness(answers: &[(&str, f32)], with_executor: bool) -> Harness {
    let config = Config::default();
    let model = ScriptedModel::new(answers);
    let schema = Arc::new(StaticSchemaProvider::new(shop_schema()));
    let database = ShopDatabase::new();
    let embedder = Arc::new(Embedder::new(
        Arc::new(KeywordProvider::new(config.semantic.embedding_dim)),
        &config.semantic,
    ));

    let orchestrator = RequestOrchestrator::new(
        &config,
        Arc::new(CacheStore::in_memory()),
        Collaborators {
            completion: model.clone(),
            schema_provider: schema.clone(),
            embedder,
            executor: with_executor.then(|| database.clone() as Arc<dyn SqlExecutor>),
        },
    );

    Harness {
        orchestrator,
        model,
        schema,
        database,
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_repeat_question_served_from_cache() {
    let h = harness(&[("SELECT COUNT(*) FROM orders", 0.9)], false);

    let first = h
        .orchestrator
        .generate("How many orders are there?", &[])
        .await
        .unwrap();
    assert_eq!(first.query, "SELECT COUNT(*) FROM orders");
    h.orchestrator.shutdown(true).await;

    let again = h
        .orchestrator
        .generate("  how many ORDERS are there? ", &[])
        .await
        .unwrap();
    assert_eq!(h.model.calls(), 1);
    assert_eq!(again.query, first.query);
    assert!(again.potential_issues.contains(&"From cache".to_string()));

    let stats = h.orchestrator.semantic_stats();
    assert_eq!(stats.exact_hits, 1);
    assert!(h.orchestrator.cache_metrics().hits >= 1);
}

#[tokio::test]
async fn test_schema_change_invalidates_cached_answers() {
    let h = harness(&[("SELECT COUNT(*) FROM orders", 0.9)], false);

    h.orchestrator
        .generate("How many orders are there?", &[])
        .await
        .unwrap();
    h.orchestrator.shutdown(true).await;
    let before = h.orchestrator.schema_version_info();

    h.schema.replace(shop_schema().with_table(
        "products",
        TableInfo::new(vec![ColumnInfo::new("id", "INTEGER").primary_key()]),
    ));
    assert!(h.orchestrator.refresh_schema().await.unwrap());

    let after = h.orchestrator.schema_version_info();
    assert_ne!(before.version, after.version);
    assert_eq!(after.table_count, 3);
    assert_eq!(h.orchestrator.cache_metrics().current_schema_version, after.version);

    h.orchestrator
        .generate("How many orders are there?", &[])
        .await
        .unwrap();
    assert_eq!(h.model.calls(), 2, "answer from the old schema must not be reused");
}

#[tokio::test]
async fn test_execution_failure_is_corrected() {
    let h = harness(
        &[
            ("SELECT nme FROM users", 0.9),
            ("SELECT name FROM users LIMIT 100", 0.9),
        ],
        true,
    );

    let executed = h
        .orchestrator
        .execute_and_generate("list user names", &[])
        .await
        .unwrap();

    let result = executed.result.expect("query was executed");
    assert!(result.success);
    assert_eq!(result.row_count, 1);
    assert_eq!(executed.answer.query, "SELECT name FROM users LIMIT 100");
    assert!(executed
        .answer
        .potential_issues
        .contains(&"Corrected after 1 failed execution(s)".to_string()));

    let outcome = executed.feedback.expect("feedback trace");
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.history.len(), 1);
    assert_eq!(
        h.database.executed(),
        vec![
            "SELECT nme FROM users LIMIT 100".to_string(),
            "SELECT name FROM users LIMIT 100".to_string(),
        ]
    );

    let stats = h.orchestrator.feedback_stats().unwrap();
    assert_eq!(stats.runs, 1);
    assert_eq!(stats.recovered, 1);
}

#[tokio::test]
async fn test_low_confidence_answer_not_executed() {
    let h = harness(&[("SELECT name FROM users", 0.3)], true);

    let executed = h
        .orchestrator
        .execute_and_generate("names maybe?", &[])
        .await
        .unwrap();

    assert!(executed.result.is_none());
    assert!(executed.feedback.is_none());
    assert!(executed
        .answer
        .potential_issues
        .contains(&"Not executed: confidence below threshold".to_string()));
    assert!(h.database.executed().is_empty());
}

#[tokio::test]
async fn test_generation_without_executor_skips_execution() {
    let h = harness(&[("SELECT name FROM users", 0.9)], false);

    let executed = h
        .orchestrator
        .execute_and_generate("list user names", &[])
        .await
        .unwrap();

    assert!(executed.result.is_none());
    assert!(h.orchestrator.feedback_stats().is_none());
    assert_eq!(executed.answer.query, "SELECT name FROM users LIMIT 100");
}

#[tokio::test]
async fn test_dangerous_sql_never_returned_as_valid() {
    let h = harness(&[("DELETE FROM users", 0.95)], false);

    let answer = h
        .orchestrator
        .generate("remove everyone", &[])
        .await
        .unwrap();

    // one generation plus one self-correction attempt
    assert_eq!(h.model.calls(), 2);
    assert!(answer.confidence < 0.5);
    assert!(answer
        .potential_issues
        .iter()
        .any(|issue| issue.starts_with("dangerous_query")));

    h.orchestrator.shutdown(true).await;
    assert_eq!(h.orchestrator.semantic_stats().index.total_vectors, 0);
}

#[tokio::test]
async fn test_batch_shares_the_pipeline() {
    let h = harness(&[("SELECT COUNT(*) FROM users", 0.9)], false);

    let questions = vec![
        "How many users are there?".to_string(),
        "what tables exist?".to_string(),
    ];
    let answers = h.orchestrator.generate_batch(&questions, Some(2)).await;

    assert_eq!(answers.len(), 2);
    assert_eq!(answers[0].query, "SELECT COUNT(*) FROM users");
    assert_eq!(answers[1].confidence, 1.0);
    assert!(answers[1].explanation.contains("Database has 2 tables"));
}
