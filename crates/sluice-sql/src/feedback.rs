//! Execution feedback loop
//!
//! Runs generated SQL and, when the database rejects it, classifies the
//! error, asks the completion collaborator for a fix and tries again.
//!
//! ```text
//! execute ──ok──▶ done
//!    │ error
//!    ▼
//! analyze ─▶ retry? ──no──▶ return last (sql, result, history)
//!               │ yes
//!               ▼
//!           correct ─▶ validate ──invalid──▶ analyze (not executed)
//!                          │ valid
//!                          ▼
//!                       execute
//! ```
//!
//! Permission and connection errors are never retried, nor is an error
//! that repeats verbatim.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use sluice_core::config::FeedbackConfig;
use sluice_core::{Result, SluiceError};

use crate::collab::{Completion, SqlExecutor};
use crate::types::{ChatMessage, QueryResult};
use crate::validate::SqlValidator;

/// Temperature for correction requests
const CORRECTION_TEMPERATURE: f32 = 0.1;

/// Character-set overlap needed for a name suggestion
const SIMILARITY_THRESHOLD: f32 = 0.6;

const CORRECTION_SYSTEM_PROMPT: &str =
    "You are a SQL expert. Fix the provided SQL query based on the error feedback.";

// ============================================================================
// Error classification
// ============================================================================

/// Class of a database error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlErrorKind {
    /// Malformed SQL
    Syntax,
    /// Unknown table
    TableNotFound,
    /// Unknown column
    ColumnNotFound,
    /// Unqualified column present in several tables
    AmbiguousColumn,
    /// Bad literal or cast
    TypeMismatch,
    /// Key or uniqueness violation
    Constraint,
    /// Insufficient privileges
    Permission,
    /// Statement or lock timeout
    Timeout,
    /// Database unreachable
    Connection,
    /// Anything else
    Unknown,
}

impl SqlErrorKind {
    /// Stable name
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlErrorKind::Syntax => "syntax",
            SqlErrorKind::TableNotFound => "table_not_found",
            SqlErrorKind::ColumnNotFound => "column_not_found",
            SqlErrorKind::AmbiguousColumn => "ambiguous_column",
            SqlErrorKind::TypeMismatch => "type_mismatch",
            SqlErrorKind::Constraint => "constraint",
            SqlErrorKind::Permission => "permission",
            SqlErrorKind::Timeout => "timeout",
            SqlErrorKind::Connection => "connection",
            SqlErrorKind::Unknown => "unknown",
        }
    }

    /// Whether rewriting the SQL can fix this class of error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SqlErrorKind::Permission | SqlErrorKind::Connection)
    }
}

impl fmt::Display for SqlErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error text patterns, checked in order; the first capture group, when
/// present, names the offending element
static ERROR_PATTERNS: LazyLock<Vec<(SqlErrorKind, Regex)>> = LazyLock::new(|| {
    let table: &[(SqlErrorKind, &[&str])] = &[
        (
            SqlErrorKind::TableNotFound,
            &[
                r"Table '([^']+)' does(?:n't| not) exist",
                r#"relation "([^"]+)" does not exist"#,
                r"Unknown table '([^']+)'",
                r"no such table: ([\w.]+)",
            ],
        ),
        (
            SqlErrorKind::ColumnNotFound,
            &[
                r"Unknown column '([^']+)'",
                r#"column "([^"]+)" does not exist"#,
                r"Column '([^']+)' does not exist",
                r"column (\S+) not found",
                r"no such column: ([\w.]+)",
            ],
        ),
        (
            SqlErrorKind::AmbiguousColumn,
            &[
                r"Column '([^']+)' in .+ is ambiguous",
                r#"column reference "([^"]+)" is ambiguous"#,
                r"ambiguous column name: ([\w.]+)",
            ],
        ),
        (
            SqlErrorKind::Syntax,
            &[
                r"You have an error in your SQL syntax",
                r"syntax error at or near",
                r#"near "([^"]+)": syntax error"#,
                r"Incorrect syntax near",
                r"\bsyntax error\b",
            ],
        ),
        (
            SqlErrorKind::TypeMismatch,
            &[
                r"Incorrect (?:date|datetime|integer|float) value",
                r"invalid input syntax for type",
                r"cannot cast",
                r"type mismatch",
                r"operator does not exist",
            ],
        ),
        (
            SqlErrorKind::Constraint,
            &[
                r"violates (?:foreign key|unique|not-null|check) constraint",
                r"Duplicate entry",
                r"constraint failed",
            ],
        ),
        (
            SqlErrorKind::Timeout,
            &[
                r"Query execution was interrupted",
                r"statement timeout",
                r"canceling statement due to",
                r"Lock wait timeout exceeded",
                r"timed out",
            ],
        ),
        (
            SqlErrorKind::Permission,
            &[
                r"permission denied",
                r"access denied",
                r"command denied",
                r"not authorized",
                r"attempt to write a readonly database",
            ],
        ),
        (
            SqlErrorKind::Connection,
            &[
                r"connection refused",
                r"could not connect",
                r"server closed the connection",
                r"Lost connection",
                r"(?:server has gone away|connection reset)",
                r"unable to open database",
            ],
        ),
    ];

    table
        .iter()
        .flat_map(|(kind, patterns)| {
            patterns.iter().map(move |p| {
                (
                    *kind,
                    Regex::new(&format!("(?i){}", p)).expect("valid error pattern"),
                )
            })
        })
        .collect()
});

static FIRST_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:FROM|JOIN)\s+[`"\[]?(\w+)"#).expect("valid table regex")
});

/// Classification of one failed execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorAnalysis {
    /// Error class
    pub kind: SqlErrorKind,
    /// Error text as reported
    pub message: String,
    /// Table or column named in the error
    pub problematic_element: Option<String>,
    /// Suggested fix
    pub suggested_fix: Option<String>,
    /// Similar known tables
    pub related_tables: Vec<String>,
    /// Similar known columns
    pub related_columns: Vec<String>,
}

/// Known names ranked by similarity to `target`, best first.
///
/// Containment scores 1.0; otherwise the Jaccard overlap of the two
/// character sets must reach `threshold`.
pub fn similar_names<'a, I>(target: &str, candidates: I, threshold: f32) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let target = target.to_lowercase();
    let target_chars: BTreeSet<char> = target.chars().collect();

    let mut scored: Vec<(f32, &str)> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let lower = candidate.to_lowercase();
            if lower.contains(&target) || target.contains(&lower) {
                return Some((1.0, candidate));
            }
            let chars: BTreeSet<char> = lower.chars().collect();
            let union = target_chars.union(&chars).count();
            if union == 0 {
                return None;
            }
            let score = target_chars.intersection(&chars).count() as f32 / union as f32;
            (score >= threshold).then_some((score, candidate))
        })
        .collect();

    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.into_iter().map(|(_, c)| c.to_string()).collect()
}

/// Classifies database errors against the names a validator knows
pub struct ErrorAnalyzer<'a> {
    validator: &'a SqlValidator,
}

impl<'a> ErrorAnalyzer<'a> {
    /// Analyzer over the schema known to `validator`
    pub fn new(validator: &'a SqlValidator) -> Self {
        Self { validator }
    }

    /// Classify `message`, raised by `sql`
    pub fn analyze(&self, message: &str, sql: &str) -> ErrorAnalysis {
        let matched = ERROR_PATTERNS
            .iter()
            .find_map(|(kind, re)| re.captures(message).map(|caps| (*kind, caps)));

        let Some((kind, caps)) = matched else {
            return ErrorAnalysis {
                kind: SqlErrorKind::Unknown,
                message: message.to_string(),
                problematic_element: None,
                suggested_fix: Some("Review query syntax and schema".to_string()),
                related_tables: Vec::new(),
                related_columns: Vec::new(),
            };
        };

        let mut analysis = ErrorAnalysis {
            kind,
            message: message.to_string(),
            problematic_element: caps.get(1).map(|m| m.as_str().to_string()),
            suggested_fix: None,
            related_tables: Vec::new(),
            related_columns: Vec::new(),
        };
        self.add_suggestions(&mut analysis, sql);
        analysis
    }

    fn add_suggestions(&self, analysis: &mut ErrorAnalysis, sql: &str) {
        match analysis.kind {
            SqlErrorKind::TableNotFound => {
                let Some(element) = analysis.problematic_element.as_deref() else {
                    return;
                };
                let tables: Vec<&str> = self.validator.table_names().collect();
                if tables.is_empty() {
                    return;
                }
                let similar = similar_names(element, tables.iter().copied(), SIMILARITY_THRESHOLD);
                if similar.is_empty() {
                    analysis.suggested_fix = Some(format!(
                        "Available tables: {}",
                        tables.iter().take(10).copied().collect::<Vec<_>>().join(", ")
                    ));
                } else {
                    let top: Vec<String> = similar.into_iter().take(3).collect();
                    analysis.suggested_fix = Some(format!("Did you mean: {}?", top.join(", ")));
                    analysis.related_tables = top;
                }
            }
            SqlErrorKind::ColumnNotFound => {
                let Some(element) = analysis.problematic_element.as_deref() else {
                    return;
                };
                let column = element.rsplit('.').next().unwrap_or(element);
                let Some(table) = FIRST_TABLE.captures(sql).map(|c| c[1].to_lowercase()) else {
                    return;
                };
                let Some(columns) = self.validator.columns_of(&table) else {
                    return;
                };
                let similar =
                    similar_names(column, columns.iter().map(String::as_str), SIMILARITY_THRESHOLD);
                if similar.is_empty() {
                    analysis.suggested_fix = Some(format!(
                        "Columns in {}: {}",
                        table,
                        columns.iter().take(10).cloned().collect::<Vec<_>>().join(", ")
                    ));
                } else {
                    let top: Vec<String> = similar.into_iter().take(3).collect();
                    analysis.suggested_fix = Some(format!("Did you mean: {}?", top.join(", ")));
                    analysis.related_columns = top;
                }
            }
            SqlErrorKind::AmbiguousColumn => {
                if let Some(element) = analysis.problematic_element.as_deref() {
                    analysis.suggested_fix = Some(format!(
                        "Add table alias prefix to '{}' (e.g., t.{})",
                        element, element
                    ));
                }
            }
            SqlErrorKind::Syntax => {
                analysis.suggested_fix =
                    Some("Check SQL syntax, keywords, and quote usage".to_string());
            }
            SqlErrorKind::TypeMismatch => {
                analysis.suggested_fix =
                    Some("Check data types and use appropriate casting/formatting".to_string());
            }
            SqlErrorKind::Timeout => {
                analysis.suggested_fix =
                    Some("Narrow the query with filters or a smaller LIMIT".to_string());
            }
            _ => {}
        }
    }
}

// ============================================================================
// Feedback records
// ============================================================================

/// One failed attempt and the correction request built from it
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionFeedback {
    /// SQL that failed
    pub original_query: String,
    /// Error classification
    pub error_analysis: ErrorAnalysis,
    /// Request sent to the completion collaborator
    pub correction_prompt: String,
    /// Failures so far, this one included
    pub retry_count: u32,
    /// Retry bound
    pub max_retries: u32,
}

/// Render the correction request for a failed query
pub fn correction_prompt(question: &str, failed_sql: &str, analysis: &ErrorAnalysis) -> String {
    let mut parts = vec![
        "The following SQL query failed with an error. Please fix it.".to_string(),
        String::new(),
        format!("Original Question: {}", question),
        String::new(),
        "Failed SQL:".to_string(),
        "```sql".to_string(),
        failed_sql.to_string(),
        "```".to_string(),
        String::new(),
        format!("Error Type: {}", analysis.kind),
        format!("Error Message: {}", analysis.message),
    ];
    if let Some(element) = &analysis.problematic_element {
        parts.push(format!("Problematic Element: {}", element));
    }
    if let Some(fix) = &analysis.suggested_fix {
        parts.push(format!("Suggestion: {}", fix));
    }
    if !analysis.related_tables.is_empty() {
        parts.push(format!(
            "Similar Tables: {}",
            analysis.related_tables.join(", ")
        ));
    }
    if !analysis.related_columns.is_empty() {
        parts.push(format!(
            "Similar Columns: {}",
            analysis.related_columns.join(", ")
        ));
    }
    parts.push(String::new());
    parts.push("Please provide the corrected SQL query.".to_string());
    parts.push(
        "Focus on fixing the specific error while maintaining the original intent.".to_string(),
    );
    parts.join("\n")
}

/// Final state of one feedback loop
#[derive(Debug, Clone)]
pub struct FeedbackOutcome {
    /// Last executed SQL
    pub sql: String,
    /// Its result
    pub result: QueryResult,
    /// One record per failure, oldest first
    pub history: Vec<ExecutionFeedback>,
    /// Executions performed
    pub attempts: u32,
}

impl FeedbackOutcome {
    /// Whether the last execution succeeded
    pub fn succeeded(&self) -> bool {
        self.result.success
    }

    /// Whether a correction was needed
    pub fn was_corrected(&self) -> bool {
        !self.history.is_empty()
    }
}

/// Loop counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedbackStats {
    /// Loops started
    pub runs: u64,
    /// Loops that succeeded after at least one correction
    pub recovered: u64,
    /// Loops that ended on a failure
    pub exhausted: u64,
    /// Corrections requested
    pub corrections: u64,
}

// ============================================================================
// Loop
// ============================================================================

/// Drives execute → analyze → correct cycles for one question at a time
pub struct ExecutionFeedbackLoop {
    executor: Arc<dyn SqlExecutor>,
    completion: Arc<dyn Completion>,
    llm_slots: Option<Arc<Semaphore>>,
    max_retries: u32,
    timeout: Duration,
    runs: AtomicU64,
    recovered: AtomicU64,
    exhausted: AtomicU64,
    corrections: AtomicU64,
}

impl ExecutionFeedbackLoop {
    /// Create a loop over the given collaborators
    pub fn new(
        executor: Arc<dyn SqlExecutor>,
        completion: Arc<dyn Completion>,
        config: &FeedbackConfig,
    ) -> Self {
        Self {
            executor,
            completion,
            llm_slots: None,
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
            runs: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            corrections: AtomicU64::new(0),
        }
    }

    /// Hold a permit from `slots` for every correction request, so
    /// corrections count against the same bound as regular generation
    pub fn with_llm_slots(mut self, slots: Arc<Semaphore>) -> Self {
        self.llm_slots = Some(slots);
        self
    }

    /// Counters since creation
    pub fn stats(&self) -> FeedbackStats {
        FeedbackStats {
            runs: self.runs.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            corrections: self.corrections.load(Ordering::Relaxed),
        }
    }

    /// Execute `sql`, correcting it on failure.
    ///
    /// Database errors never surface as `Err`: an exhausted loop returns
    /// the last executed SQL with its failed result. `Err` means the
    /// executor itself failed or timed out.
    pub async fn run(
        &self,
        question: &str,
        sql: &str,
        validator: &SqlValidator,
    ) -> Result<FeedbackOutcome> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let analyzer = ErrorAnalyzer::new(validator);

        let mut current = sql.trim().to_string();
        let mut history: Vec<ExecutionFeedback> = Vec::new();
        let mut attempts = 1;
        let mut result = self.execute(&current).await?;
        let mut executed = current.clone();

        let mut error = match failure_text(&result) {
            None => {
                return Ok(FeedbackOutcome {
                    sql: executed,
                    result,
                    history,
                    attempts,
                })
            }
            Some(error) => error,
        };

        loop {
            let analysis = analyzer.analyze(&error, &current);
            warn!(
                attempt = history.len() + 1,
                kind = %analysis.kind,
                error = %error,
                "query attempt failed"
            );
            let feedback = ExecutionFeedback {
                original_query: current.clone(),
                correction_prompt: correction_prompt(question, &current, &analysis),
                error_analysis: analysis,
                retry_count: history.len() as u32 + 1,
                max_retries: self.max_retries,
            };
            history.push(feedback);

            if !self.should_retry(&history) {
                break;
            }

            let Some(corrected) = self.correct(&history[history.len() - 1]).await else {
                break;
            };
            if corrected == current {
                debug!("correction returned the same SQL");
                break;
            }
            current = corrected;

            let validation = validator.validate(&current);
            if !validation.is_valid {
                debug!(errors = validation.errors.len(), "corrected SQL failed validation");
                error = validator.generate_error_feedback(&validation);
                continue;
            }

            attempts += 1;
            result = self.execute(&current).await?;
            executed = current.clone();
            match failure_text(&result) {
                None => {
                    info!(attempts, "query succeeded after correction");
                    self.recovered.fetch_add(1, Ordering::Relaxed);
                    return Ok(FeedbackOutcome {
                        sql: executed,
                        result,
                        history,
                        attempts,
                    });
                }
                Some(next) => error = next,
            }
        }

        self.exhausted.fetch_add(1, Ordering::Relaxed);
        Ok(FeedbackOutcome {
            sql: executed,
            result,
            history,
            attempts,
        })
    }

    fn should_retry(&self, history: &[ExecutionFeedback]) -> bool {
        let Some(last) = history.last() else {
            return true;
        };
        if !last.error_analysis.kind.is_recoverable() {
            debug!(kind = %last.error_analysis.kind, "error not recoverable by rewriting");
            return false;
        }
        if last.retry_count >= last.max_retries {
            warn!(max_retries = last.max_retries, "max retries reached");
            return false;
        }
        if let [.., previous, last] = history {
            if previous.error_analysis.message == last.error_analysis.message {
                warn!("same error repeated, stopping retries");
                return false;
            }
        }
        true
    }

    async fn execute(&self, sql: &str) -> Result<QueryResult> {
        match tokio::time::timeout(self.timeout, self.executor.execute(sql)).await {
            Ok(result) => result,
            Err(_) => Err(SluiceError::timeout("execute", self.timeout)),
        }
    }

    async fn correct(&self, feedback: &ExecutionFeedback) -> Option<String> {
        self.corrections.fetch_add(1, Ordering::Relaxed);
        let _permit = match &self.llm_slots {
            Some(slots) => match slots.acquire().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!("LLM semaphore closed, skipping correction");
                    return None;
                }
            },
            None => None,
        };
        let messages = [ChatMessage::user(feedback.correction_prompt.clone())];
        let call = self.completion.generate(
            CORRECTION_SYSTEM_PROMPT,
            &messages,
            CORRECTION_TEMPERATURE,
        );
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(query)) => {
                debug!(explanation = %query.explanation, "received correction");
                Some(query.query.trim().to_string())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "correction failed");
                None
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "correction timed out");
                None
            }
        }
    }
}

fn failure_text(result: &QueryResult) -> Option<String> {
    if result.success {
        return None;
    }
    Some(
        result
            .error_message
            .clone()
            .unwrap_or_else(|| "unknown execution error".to_string()),
    )
}
