//! Request orchestration
//!
//! [`RequestOrchestrator`] turns one question into one [`SqlQuery`]:
//!
//! ```text
//! metadata question? ──yes──▶ canned catalog query
//!        │ no
//!        ▼
//! semantic cache ──hit──▶ cached SQL
//!        │ miss
//!        ▼
//! plan cache + fill ──hit & valid──▶ filled template
//!        │ miss
//!        ▼
//! prompt ─▶ LLM ─▶ validate ─▶ (one self-correction) ─▶ post-process
//!                                                          │
//!                       background cache writes ◀──────────┘
//! ```
//!
//! LLM calls share a semaphore and every collaborator call has a deadline.
//! Cache writes run on tracked background tasks and never delay or fail a
//! response; [`RequestOrchestrator::shutdown`] drains them.
//!
//! The orchestrator is a cheap handle around shared state; clone it into
//! tasks freely.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use regex::RegexSet;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use sluice_ai::semantic::{Embedder, QueryNormalizer, SemanticCache, SemanticStats};
use sluice_core::cache::{CacheHealth, CacheLevel, CacheMetrics, CacheStore};
use sluice_core::config::{Config, OrchestratorConfig, SqlDialect};
use sluice_core::schema::{SchemaSnapshot, SchemaVersionManager, VersionInfo};
use sluice_core::{Result, SluiceError};

use crate::collab::{Completion, SchemaProvider, SqlExecutor};
use crate::feedback::{ExecutionFeedbackLoop, FeedbackOutcome, FeedbackStats};
use crate::plan::{PlanStats, QueryPattern, QueryPlanCache};
use crate::prompt::{PromptBuilder, PromptRequest};
use crate::types::{ChatMessage, QueryResult, SqlQuery};
use crate::validate::{
    qualified_columns, referenced_tables, SqlPostProcessor, SqlValidator, ValidationResult,
};

/// Confidence multiplier for answers that stay invalid after correction
const INVALID_CONFIDENCE_FACTOR: f32 = 0.3;

/// Warnings copied into an answer's issues
const MAX_SURFACED_WARNINGS: usize = 3;

static SCHEMA_QUESTION: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)\b(schema|structure)\b",
        r"(?i)\b(what|which)\s+tables?\b",
        r"(?i)\btables?\b.*\b(list|exist|available)\b",
        r"(?i)\bdescribe\b.*\b(database|db)\b",
        r"(?i)\b(columns?|fields?)\b.*\bin\b.*\btable\b",
        r"(?i)\b(database|db)\b.*\b(info|information)\b",
        r"(?i)\bshow\s+(tables?|databases?)\b",
        r"(?i)^\s*desc(ribe)?\s+\w+\s*\??\s*$",
    ])
    .expect("valid schema question regexes")
});

/// Whether `question` asks about the database structure itself
pub fn is_schema_question(question: &str) -> bool {
    SCHEMA_QUESTION.is_match(question)
}

/// Catalog query listing user tables in `dialect`
pub fn metadata_sql(dialect: SqlDialect) -> &'static str {
    match dialect {
        SqlDialect::Mysql => {
            "SELECT TABLE_NAME, TABLE_ROWS, TABLE_COMMENT FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() ORDER BY TABLE_NAME"
        }
        SqlDialect::Postgres => {
            "SELECT tablename, schemaname FROM pg_catalog.pg_tables \
             WHERE schemaname NOT IN ('pg_catalog', 'information_schema') ORDER BY tablename"
        }
        SqlDialect::Sqlite => {
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name"
        }
    }
}

/// Schema tables named in `question`, singular or plural, sorted
pub fn mentioned_tables(question: &str, snapshot: &SchemaSnapshot) -> Vec<String> {
    let words: BTreeSet<String> = question
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();

    snapshot
        .tables()
        .keys()
        .filter(|name| {
            let lower = name.to_lowercase();
            let singular = lower.strip_suffix('s').unwrap_or(&lower);
            words.contains(&lower)
                || words.contains(singular)
                || words.contains(&format!("{}s", lower))
        })
        .cloned()
        .collect()
}

/// External services the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    /// SQL generation
    pub completion: Arc<dyn Completion>,
    /// Schema source
    pub schema_provider: Arc<dyn SchemaProvider>,
    /// Question embedding
    pub embedder: Arc<Embedder>,
    /// Query execution, if the caller wants results
    pub executor: Option<Arc<dyn SqlExecutor>>,
}

/// A generated answer together with its execution
#[derive(Debug, Clone)]
pub struct ExecutedAnswer {
    /// The answer; its SQL is the last executed statement
    pub answer: SqlQuery,
    /// Execution result, absent when execution was skipped
    pub result: Option<QueryResult>,
    /// Feedback loop trace, absent when execution was skipped
    pub feedback: Option<FeedbackOutcome>,
}

struct Inner {
    config: OrchestratorConfig,
    temperature: f32,
    store: Arc<CacheStore>,
    schema: SchemaVersionManager,
    semantic: Arc<SemanticCache>,
    plans: Arc<QueryPlanCache>,
    prompts: PromptBuilder,
    validator: RwLock<Arc<SqlValidator>>,
    similarity_threshold: f32,
    postprocessor: SqlPostProcessor,
    completion: Arc<dyn Completion>,
    schema_provider: Arc<dyn SchemaProvider>,
    feedback: Option<ExecutionFeedbackLoop>,
    llm_slots: Arc<Semaphore>,
    background: Mutex<JoinSet<()>>,
}

/// Coordinates caches, generation, validation and execution
#[derive(Clone)]
pub struct RequestOrchestrator {
    inner: Arc<Inner>,
}

impl RequestOrchestrator {
    /// Wire the pipeline. The schema is loaded on first use or by
    /// [`refresh_schema`](Self::refresh_schema).
    pub fn new(config: &Config, store: Arc<CacheStore>, collaborators: Collaborators) -> Self {
        let semantic = Arc::new(SemanticCache::new(
            store.clone(),
            collaborators.embedder,
            config.semantic.clone(),
        ));
        let plans = Arc::new(QueryPlanCache::new(
            store.clone(),
            config.plan_cache.clone(),
        ));
        let prompts = PromptBuilder::new(
            store.clone(),
            config.orchestrator.dialect,
            config.orchestrator.history_window,
        );
        let llm_slots = Arc::new(Semaphore::new(config.orchestrator.max_concurrent.max(1)));
        let feedback = collaborators.executor.map(|executor| {
            ExecutionFeedbackLoop::new(
                executor,
                collaborators.completion.clone(),
                &config.feedback,
            )
            .with_llm_slots(llm_slots.clone())
        });
        let validator = SqlValidator::new(Vec::<String>::new(), BTreeMap::<String, Vec<String>>::new())
            .with_similarity_threshold(config.validation.similarity_threshold);

        info!(
            dialect = %config.orchestrator.dialect,
            max_concurrent = config.orchestrator.max_concurrent,
            completion = collaborators.completion.name(),
            execution = feedback.is_some(),
            "request orchestrator initialized"
        );

        Self {
            inner: Arc::new(Inner {
                config: config.orchestrator.clone(),
                temperature: config.llm.temperature,
                store,
                schema: SchemaVersionManager::new(),
                semantic,
                plans,
                prompts,
                validator: RwLock::new(Arc::new(validator)),
                similarity_threshold: config.validation.similarity_threshold,
                postprocessor: SqlPostProcessor::from_config(&config.validation),
                completion: collaborators.completion,
                schema_provider: collaborators.schema_provider,
                feedback,
                llm_slots,
                background: Mutex::new(JoinSet::new()),
            }),
        }
    }

    // ========================================================================
    // Schema
    // ========================================================================

    /// Reload the schema from the provider. Returns whether its version
    /// changed; a change invalidates schema-scoped cache levels and plans.
    pub async fn refresh_schema(&self) -> Result<bool> {
        let inner = &self.inner;
        let schema = inner.schema_provider.get_schema().await?;
        let validator = SqlValidator::from_schema(&schema)
            .with_similarity_threshold(inner.similarity_threshold);
        let had_version = inner.schema.current_version().is_some();

        if !inner.schema.update(schema) {
            return Ok(false);
        }
        *inner.validator.write() = Arc::new(validator);

        if let Some(version) = inner.schema.current_version() {
            inner.store.update_schema_version(&version);
        }
        if had_version {
            inner.plans.invalidate(None);
        }
        Ok(true)
    }

    async fn snapshot(&self) -> Result<Arc<SchemaSnapshot>> {
        if let Some(snapshot) = self.inner.schema.current() {
            return Ok(snapshot);
        }
        self.refresh_schema().await?;
        self.inner
            .schema
            .current()
            .ok_or_else(|| SluiceError::Internal("schema unavailable after refresh".to_string()))
    }

    fn validator(&self) -> Arc<SqlValidator> {
        self.inner.validator.read().clone()
    }

    // ========================================================================
    // Generation
    // ========================================================================

    /// Generate SQL for `question`.
    ///
    /// Conversation `history` bypasses the caches, since the answer depends
    /// on it. Invalid SQL is returned with lowered confidence and the
    /// problems listed in `potential_issues`; `Err` means a collaborator
    /// failed or timed out.
    pub async fn generate(&self, question: &str, history: &[ChatMessage]) -> Result<SqlQuery> {
        let span = info_span!(
            "nl2sql",
            request_id = %Uuid::new_v4(),
            question_len = question.len()
        );
        self.generate_inner(question, history).instrument(span).await
    }

    async fn generate_inner(&self, question: &str, history: &[ChatMessage]) -> Result<SqlQuery> {
        let inner = &self.inner;

        if is_schema_question(question) {
            info!("metadata question, answering from catalog");
            let snapshot = self.snapshot().await?;
            return Ok(self.metadata_answer(&snapshot));
        }

        let snapshot = self.snapshot().await?;
        let version = snapshot.version_hash().to_string();
        let use_cache = history.is_empty();

        if use_cache {
            if let Some((cached, similarity)) = inner
                .semantic
                .lookup(question, Some(&version), true)
                .await
            {
                return Ok(SqlQuery {
                    query: cached.sql,
                    explanation: format!(
                        "{}\n(Cached, similarity: {:.2})",
                        cached.explanation, similarity
                    ),
                    confidence: inner.semantic.hit_confidence(cached.hit_count),
                    tables_used: cached.tables_used,
                    potential_issues: vec!["From cache".to_string()],
                });
            }
        }

        let tables_hint = mentioned_tables(question, &snapshot);
        let validator = self.validator();

        if use_cache && !tables_hint.is_empty() {
            if let Some(answer) = self.from_plan(question, &tables_hint, &validator) {
                self.spawn_cache_write(question, &answer, &version);
                return Ok(answer);
            }
        }

        let detected = inner.plans.detector().detect(question);
        let pattern = (detected.pattern != QueryPattern::Unknown).then_some(detected.pattern);
        let prompt = inner.prompts.build(PromptRequest {
            question,
            schema: snapshot.definition(),
            schema_version: Some(&version),
            pattern,
            relevant_tables: &tables_hint,
            history,
        });
        debug!(
            tokens = prompt.estimated_tokens,
            components_cached = prompt.components_cached,
            "prompt built"
        );

        let mut answer = self
            .complete(&prompt.system, &prompt.messages, inner.config.llm_timeout())
            .await?;
        answer.clamp_confidence();

        let mut validation = validator.validate(&answer.query);
        if !validation.is_valid {
            warn!(errors = validation.errors.len(), "generated SQL failed validation");
            let feedback = validator.generate_error_feedback(&validation);
            let mut messages = prompt.messages.clone();
            messages.extend(
                inner
                    .prompts
                    .correction_turns(&answer.query, &feedback, snapshot.definition()),
            );

            match self
                .complete(&prompt.system, &messages, inner.config.correction_timeout())
                .await
            {
                Ok(mut corrected) => {
                    let recheck = validator.validate(&corrected.query);
                    if recheck.is_valid {
                        info!("self-correction produced valid SQL");
                        corrected.clamp_confidence();
                        corrected
                            .potential_issues
                            .push("Auto-corrected from previous error".to_string());
                        answer = corrected;
                        validation = recheck;
                    } else {
                        Self::degrade(&mut answer, &validation);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "self-correction failed");
                    Self::degrade(&mut answer, &validation);
                }
            }
        }

        Self::surface_warnings(&mut answer, &validation);
        answer.query = inner.postprocessor.process(&answer.query);
        if answer.tables_used.is_empty() {
            answer.tables_used = referenced_tables(&answer.query);
        }

        if use_cache && validation.is_valid {
            self.spawn_cache_write(question, &answer, &version);
        }
        info!(confidence = answer.confidence, "SQL generated");
        Ok(answer)
    }

    fn metadata_answer(&self, snapshot: &SchemaSnapshot) -> SqlQuery {
        let mut lines = vec![format!("Database has {} tables:", snapshot.table_count())];
        for (name, table) in snapshot.tables() {
            let keys: Vec<&str> = table
                .columns
                .iter()
                .filter(|c| c.is_primary_key)
                .map(|c| c.name.as_str())
                .collect();
            let key_info = if keys.is_empty() {
                String::new()
            } else {
                format!(" (PK: {})", keys.join(", "))
            };
            lines.push(format!(
                "  - {}: {} columns{}",
                name,
                table.columns.len(),
                key_info
            ));
        }

        SqlQuery {
            query: metadata_sql(self.inner.config.dialect).to_string(),
            explanation: lines.join("\n"),
            confidence: 1.0,
            tables_used: vec!["INFORMATION_SCHEMA".to_string()],
            potential_issues: vec!["Metadata query".to_string()],
        }
    }

    fn from_plan(
        &self,
        question: &str,
        tables_hint: &[String],
        validator: &SqlValidator,
    ) -> Option<SqlQuery> {
        let (plan, params) = self.inner.plans.get(question, Some(tables_hint))?;
        let sql = QueryPlanCache::fill_template(&plan, &params);
        if QueryPlanCache::is_unfilled(&sql) {
            debug!(pattern = %plan.pattern, "plan left placeholders unfilled");
            return None;
        }
        let validation = validator.validate(&sql);
        if !validation.is_valid {
            debug!(pattern = %plan.pattern, "filled plan failed validation");
            return None;
        }

        let mut answer = SqlQuery {
            query: self.inner.postprocessor.process(&sql),
            explanation: format!("Generated from cached {} query plan", plan.pattern),
            confidence: plan.confidence,
            tables_used: plan.tables_used,
            potential_issues: vec!["From plan cache".to_string()],
        };
        Self::surface_warnings(&mut answer, &validation);
        Some(answer)
    }

    fn degrade(answer: &mut SqlQuery, validation: &ValidationResult) {
        answer.confidence *= INVALID_CONFIDENCE_FACTOR;
        answer.potential_issues.extend(
            validation
                .errors
                .iter()
                .map(|e| format!("{}: {}", e.kind, e.message)),
        );
    }

    fn surface_warnings(answer: &mut SqlQuery, validation: &ValidationResult) {
        answer.potential_issues.extend(
            validation
                .warnings
                .iter()
                .take(MAX_SURFACED_WARNINGS)
                .map(|w| format!("Warning: {}", w.message)),
        );
    }

    async fn complete(
        &self,
        system: &str,
        messages: &[ChatMessage],
        deadline: Duration,
    ) -> Result<SqlQuery> {
        let inner = &self.inner;
        let _permit = inner
            .llm_slots
            .acquire()
            .await
            .map_err(|_| SluiceError::Internal("LLM semaphore closed".to_string()))?;

        let call = inner
            .completion
            .generate(system, messages, inner.temperature);
        match tokio::time::timeout(deadline, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = deadline.as_millis() as u64, "completion timed out");
                Err(SluiceError::timeout("completion", deadline))
            }
        }
    }

    fn spawn_cache_write(&self, question: &str, answer: &SqlQuery, version: &str) {
        if answer.confidence < self.inner.config.cache_min_confidence {
            return;
        }

        let semantic = self.inner.semantic.clone();
        let plans = self.inner.plans.clone();
        let question = question.to_string();
        let sql = answer.query.clone();
        let explanation = answer.explanation.clone();
        let tables = answer.tables_used.clone();
        let confidence = answer.confidence;
        let version = version.to_string();
        let query_type = QueryNormalizer::intent(&question).label();
        let columns: Vec<String> = qualified_columns(&sql)
            .into_iter()
            .map(|(_, column)| column)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut tasks = self.inner.background.lock();
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                warn!(error = %e, "background cache write failed");
            }
        }
        tasks.spawn(
            async move {
                if !semantic
                    .store(
                        &question,
                        &sql,
                        &explanation,
                        query_type,
                        &tables,
                        Some(&version),
                    )
                    .await
                {
                    debug!("answer not stored in semantic cache");
                }
                plans.put(&question, &sql, &tables, &columns, confidence);
            }
            .in_current_span(),
        );
    }

    /// Generate SQL for every question, at most `max_concurrent` at once
    /// (default from configuration, capped by the ceiling).
    ///
    /// Results are in input order. A failed question yields an
    /// error-shaped answer and does not affect the others.
    pub async fn generate_batch<S>(&self, questions: &[S], max_concurrent: Option<usize>) -> Vec<SqlQuery>
    where
        S: AsRef<str>,
    {
        let config = &self.inner.config;
        let limit = max_concurrent
            .unwrap_or(config.max_concurrent)
            .clamp(1, config.max_concurrent_ceiling.max(1));
        let slots = Arc::new(Semaphore::new(limit));
        info!(questions = questions.len(), concurrency = limit, "batch started");

        let mut tasks = JoinSet::new();
        for (index, question) in questions.iter().enumerate() {
            let this = self.clone();
            let slots = slots.clone();
            let question = question.as_ref().to_string();
            tasks.spawn(async move {
                let answer = match slots.acquire().await {
                    Ok(_permit) => this
                        .generate(&question, &[])
                        .await
                        .unwrap_or_else(SqlQuery::failed),
                    Err(_) => SqlQuery::failed("batch semaphore closed"),
                };
                (index, answer)
            });
        }

        let mut results: Vec<Option<SqlQuery>> = vec![None; questions.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, answer)) => results[index] = Some(answer),
                Err(e) => warn!(error = %e, "batch task failed"),
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| SqlQuery::failed("batch task aborted")))
            .collect()
    }

    /// Generate SQL and run it through the execution feedback loop.
    ///
    /// Execution is skipped when no executor is configured or the answer's
    /// confidence is below the execution threshold.
    pub async fn execute_and_generate(
        &self,
        question: &str,
        history: &[ChatMessage],
    ) -> Result<ExecutedAnswer> {
        let mut answer = self.generate(question, history).await?;

        let Some(feedback) = &self.inner.feedback else {
            return Ok(ExecutedAnswer {
                answer,
                result: None,
                feedback: None,
            });
        };
        if answer.confidence < self.inner.config.execute_min_confidence {
            info!(confidence = answer.confidence, "confidence too low, not executing");
            answer
                .potential_issues
                .push("Not executed: confidence below threshold".to_string());
            return Ok(ExecutedAnswer {
                answer,
                result: None,
                feedback: None,
            });
        }

        let validator = self.validator();
        let outcome = feedback.run(question, &answer.query, &validator).await?;
        if outcome.was_corrected() && outcome.succeeded() {
            answer.query = outcome.sql.clone();
            answer.tables_used = referenced_tables(&answer.query);
            answer.potential_issues.push(format!(
                "Corrected after {} failed execution(s)",
                outcome.history.len()
            ));
        } else if !outcome.succeeded() {
            answer.query = outcome.sql.clone();
            if let Some(error) = &outcome.result.error_message {
                answer.potential_issues.push(format!("Execution failed: {}", error));
            }
        }

        Ok(ExecutedAnswer {
            answer,
            result: Some(outcome.result.clone()),
            feedback: Some(outcome),
        })
    }

    // ========================================================================
    // Monitoring and maintenance
    // ========================================================================

    /// Cache store metrics
    pub fn cache_metrics(&self) -> CacheMetrics {
        self.inner.store.metrics()
    }

    /// Cache backend health
    pub fn cache_health(&self) -> CacheHealth {
        self.inner.store.health_check()
    }

    /// Current schema version summary
    pub fn schema_version_info(&self) -> VersionInfo {
        self.inner.schema.version_info()
    }

    /// Semantic cache statistics
    pub fn semantic_stats(&self) -> SemanticStats {
        self.inner.semantic.stats()
    }

    /// Plan cache statistics
    pub fn plan_stats(&self) -> PlanStats {
        self.inner.plans.stats()
    }

    /// Feedback loop counters, when execution is configured
    pub fn feedback_stats(&self) -> Option<FeedbackStats> {
        self.inner.feedback.as_ref().map(ExecutionFeedbackLoop::stats)
    }

    /// Drop cached answers and plans
    pub fn invalidate_sql_cache(&self) -> usize {
        let plans = self.inner.plans.invalidate(None);
        plans + self.inner.semantic.invalidate_all()
    }

    /// Drop cached prompt components and examples
    pub fn invalidate_prompt_cache(&self) -> usize {
        self.inner.prompts.invalidate() + self.inner.store.invalidate_level(CacheLevel::Examples)
    }

    /// Wait for (or detach) pending cache writes and persist the index
    pub async fn shutdown(&self, wait: bool) {
        let mut tasks = std::mem::take(&mut *self.inner.background.lock());
        if wait {
            let mut failed = 0usize;
            while let Some(done) = tasks.join_next().await {
                if done.is_err() {
                    failed += 1;
                }
            }
            if failed > 0 {
                warn!(failed, "background cache writes failed");
            }
        } else {
            tasks.detach_all();
        }
        self.inner.semantic.persist_index();
        info!(wait, "request orchestrator shut down");
    }
}
