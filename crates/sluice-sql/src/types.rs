//! Values exchanged between the pipeline and its collaborators

use serde::{Deserialize, Serialize};
use std::fmt;

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions
    System,
    /// End user
    User,
    /// Model
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author
    pub role: Role,
    /// Text
    pub content: String,
}

impl ChatMessage {
    /// System message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// User message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A generated SQL answer.
///
/// Both the LLM's structured output and the pipeline's final answer take
/// this shape. Validation and execution problems are reported through
/// `potential_issues` and a lowered `confidence`, not as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlQuery {
    /// SQL text
    #[serde(alias = "sql")]
    pub query: String,
    /// What the query does
    #[serde(default)]
    pub explanation: String,
    /// Confidence in [0, 1]
    #[serde(default)]
    pub confidence: f32,
    /// Tables the query reads
    #[serde(default)]
    pub tables_used: Vec<String>,
    /// Caveats, validation findings, cache provenance
    #[serde(default)]
    pub potential_issues: Vec<String>,
}

impl SqlQuery {
    /// Answer with the given SQL and confidence
    pub fn new(query: impl Into<String>, explanation: impl Into<String>, confidence: f32) -> Self {
        Self {
            query: query.into(),
            explanation: explanation.into(),
            confidence,
            tables_used: Vec::new(),
            potential_issues: Vec::new(),
        }
    }

    /// Error-shaped answer standing in for a failed generation
    pub fn failed(error: impl fmt::Display) -> Self {
        Self {
            query: "-- Error generating SQL".to_string(),
            explanation: format!("Error: {}", error),
            confidence: 0.0,
            tables_used: Vec::new(),
            potential_issues: vec![error.to_string()],
        }
    }

    /// Whether this is an error-shaped answer
    pub fn is_failed(&self) -> bool {
        self.query.starts_with("-- Error")
    }

    /// Clamp confidence into [0, 1]
    pub fn clamp_confidence(&mut self) {
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
    }
}

/// Result of executing SQL against the database
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Whether execution succeeded
    pub success: bool,
    /// Result rows as JSON objects
    #[serde(default)]
    pub rows: Option<Vec<serde_json::Map<String, serde_json::Value>>>,
    /// Number of rows returned
    #[serde(default)]
    pub row_count: usize,
    /// Column names
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    /// Wall time in milliseconds
    #[serde(default)]
    pub execution_time_ms: u64,
    /// Database error text on failure
    #[serde(default)]
    pub error_message: Option<String>,
}

impl QueryResult {
    /// Successful result
    pub fn ok(
        columns: Vec<String>,
        rows: Vec<serde_json::Map<String, serde_json::Value>>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            success: true,
            row_count: rows.len(),
            rows: Some(rows),
            columns: Some(columns),
            execution_time_ms,
            error_message: None,
        }
    }

    /// Failed result carrying the database error text
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_query_accepts_sql_alias() {
        let q: SqlQuery = serde_json::from_str(
            r#"{"sql": "SELECT 1", "explanation": "one", "confidence": 0.9}"#,
        )
        .unwrap();
        assert_eq!(q.query, "SELECT 1");
        assert!(q.tables_used.is_empty());
        assert!(q.potential_issues.is_empty());
    }

    #[test]
    fn test_failed_answer_shape() {
        let q = SqlQuery::failed("llm unavailable");
        assert!(q.is_failed());
        assert_eq!(q.confidence, 0.0);
        assert_eq!(q.potential_issues, vec!["llm unavailable".to_string()]);
    }

    #[test]
    fn test_clamp_confidence() {
        let mut q = SqlQuery::new("SELECT 1", "", 1.7);
        q.clamp_confidence();
        assert_eq!(q.confidence, 1.0);
        q.confidence = f32::NAN;
        q.clamp_confidence();
        assert_eq!(q.confidence, 0.0);
    }

    #[test]
    fn test_query_result_constructors() {
        let mut row = serde_json::Map::new();
        row.insert("id".to_string(), serde_json::json!(1));
        let ok = QueryResult::ok(vec!["id".to_string()], vec![row], 3);
        assert!(ok.success);
        assert_eq!(ok.row_count, 1);

        let err = QueryResult::error("no such table: foo");
        assert!(!err.success);
        assert_eq!(err.error_message.as_deref(), Some("no such table: foo"));
    }
}
