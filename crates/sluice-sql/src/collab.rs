//! External collaborators
//!
//! The pipeline never talks to a model, a database or an introspection
//! service directly. It is handed implementations of these traits:
//!
//! | Trait | Role |
//! |-------|------|
//! | [`Completion`] | question + prompt → structured [`SqlQuery`] |
//! | [`SqlExecutor`] | SQL → [`QueryResult`] |
//! | [`SchemaProvider`] | current [`SchemaDefinition`] |

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sluice_core::config::LlmConfig;
use sluice_core::schema::SchemaDefinition;
use sluice_core::{Result, SluiceError};

use crate::types::{ChatMessage, QueryResult, SqlQuery};

/// Structured SQL generation
#[async_trait]
pub trait Completion: Send + Sync {
    /// Generate SQL for the conversation in `messages`
    async fn generate(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<SqlQuery>;

    /// Provider name
    fn name(&self) -> &str {
        "completion"
    }
}

/// Runs SQL against the target database
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute `sql`. Database errors are reported in the result, not as `Err`.
    async fn execute(&self, sql: &str) -> Result<QueryResult>;
}

/// Supplies the current database schema
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// Fetch the schema
    async fn get_schema(&self) -> Result<SchemaDefinition>;
}

// ============================================================================
// Static schema provider
// ============================================================================

/// Schema provider serving a fixed, replaceable definition
#[derive(Debug, Default)]
pub struct StaticSchemaProvider {
    schema: RwLock<SchemaDefinition>,
}

impl StaticSchemaProvider {
    /// Serve `schema`
    pub fn new(schema: SchemaDefinition) -> Self {
        Self {
            schema: RwLock::new(schema),
        }
    }

    /// Load a schema JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let schema = SchemaDefinition::from_json(&text)?;
        Ok(Self::new(schema))
    }

    /// Swap in a new definition
    pub fn replace(&self, schema: SchemaDefinition) {
        *self.schema.write() = schema;
    }
}

#[async_trait]
impl SchemaProvider for StaticSchemaProvider {
    async fn get_schema(&self) -> Result<SchemaDefinition> {
        Ok(self.schema.read().clone())
    }
}

// ============================================================================
// OpenAI-compatible completion
// ============================================================================

/// Chat-completions client returning [`SqlQuery`] through JSON mode
pub struct OpenAiCompletion {
    config: LlmConfig,
    api_key: String,
    client: reqwest::Client,
    timeout: Duration,
    requests: AtomicU64,
    parse_retries: AtomicU64,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// Appended to the system prompt so the model answers in the expected shape
const RESPONSE_CONTRACT: &str = "\n\nRespond with a single JSON object with the keys \
\"query\" (string), \"explanation\" (string), \"confidence\" (number between 0 and 1), \
\"tables_used\" (array of strings) and \"potential_issues\" (array of strings).";

impl OpenAiCompletion {
    /// Create a client; the key falls back to `OPENAI_API_KEY`
    pub fn new(config: &LlmConfig, timeout: Duration) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| SluiceError::Configuration("LLM API key required".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                SluiceError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            config: config.clone(),
            api_key,
            client,
            timeout,
            requests: AtomicU64::new(0),
            parse_retries: AtomicU64::new(0),
        })
    }

    /// Requests sent and re-asks caused by malformed output
    pub fn stats(&self) -> (u64, u64) {
        (
            self.requests.load(Ordering::Relaxed),
            self.parse_retries.load(Ordering::Relaxed),
        )
    }

    async fn call_api(&self, messages: Vec<ChatMessage>, temperature: f32) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            temperature,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };
        self.requests.fetch_add(1, Ordering::Relaxed);

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SluiceError::timeout("completion", self.timeout)
                } else {
                    SluiceError::Collaborator(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SluiceError::Collaborator(
                "Rate limited by completion API".to_string(),
            ));
        }
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            if let Ok(error_response) = serde_json::from_str::<ApiErrorResponse>(&error_body) {
                return Err(SluiceError::Collaborator(error_response.error.message));
            }
            return Err(SluiceError::Collaborator(format!(
                "HTTP {}: {}",
                status, error_body
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| SluiceError::Collaborator(format!("Failed to parse response: {}", e)))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| SluiceError::Collaborator("Empty response from API".to_string()))
    }
}

/// Parse the model's JSON answer, tolerating a fenced code block around it
pub fn parse_structured(content: &str) -> Result<SqlQuery> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let mut query: SqlQuery = serde_json::from_str(body)?;
    if query.query.trim().is_empty() {
        return Err(SluiceError::Serialization(
            "structured output has an empty query".to_string(),
        ));
    }
    query.query = query.query.trim().to_string();
    query.clamp_confidence();
    Ok(query)
}

#[async_trait]
impl Completion for OpenAiCompletion {
    async fn generate(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<SqlQuery> {
        let mut conversation = Vec::with_capacity(messages.len() + 1);
        conversation.push(ChatMessage::system(format!(
            "{}{}",
            system_prompt, RESPONSE_CONTRACT
        )));
        conversation.extend_from_slice(messages);

        let mut last_error = None;
        for attempt in 0..=self.config.max_parse_retries {
            let content = self.call_api(conversation.clone(), temperature).await?;
            match parse_structured(&content) {
                Ok(query) => return Ok(query),
                Err(e) => {
                    warn!(attempt, error = %e, "malformed structured output");
                    self.parse_retries.fetch_add(1, Ordering::Relaxed);
                    conversation.push(ChatMessage::assistant(content));
                    conversation.push(ChatMessage::user(format!(
                        "That response was not valid: {}. Reply with the JSON object only.",
                        e
                    )));
                    last_error = Some(e);
                }
            }
        }
        debug!("structured output retries exhausted");
        Err(last_error.unwrap_or_else(|| {
            SluiceError::Collaborator("no structured output produced".to_string())
        }))
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::schema::{ColumnInfo, TableInfo};

    #[test]
    fn test_parse_structured_plain_and_fenced() {
        let q = parse_structured(
            r#"{"query": " SELECT 1 ", "explanation": "x", "confidence": 1.4, "tables_used": []}"#,
        )
        .unwrap();
        assert_eq!(q.query, "SELECT 1");
        assert_eq!(q.confidence, 1.0);

        let q = parse_structured("```json\n{\"sql\": \"SELECT 2\", \"confidence\": 0.5}\n```")
            .unwrap();
        assert_eq!(q.query, "SELECT 2");
    }

    #[test]
    fn test_parse_structured_rejects_empty_query() {
        assert!(parse_structured(r#"{"query": "  "}"#).is_err());
        assert!(parse_structured("not json").is_err());
    }

    #[tokio::test]
    async fn test_static_schema_provider_replace() {
        let provider = StaticSchemaProvider::new(SchemaDefinition::new());
        assert_eq!(provider.get_schema().await.unwrap().table_count(), 0);

        provider.replace(SchemaDefinition::new().with_table(
            "users",
            TableInfo::new(vec![ColumnInfo::new("id", "INTEGER")]),
        ));
        assert_eq!(provider.get_schema().await.unwrap().table_count(), 1);
    }

    #[test]
    fn test_static_schema_provider_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        std::fs::write(
            &path,
            r#"{"users": {"columns": [{"name": "id", "type": "INTEGER"}]}}"#,
        )
        .unwrap();
        let provider = StaticSchemaProvider::from_file(&path).unwrap();
        assert_eq!(provider.schema.read().table_count(), 1);

        assert!(StaticSchemaProvider::from_file(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_openai_requires_key() {
        if std::env::var("OPENAI_API_KEY").is_ok() {
            return;
        }
        let err = OpenAiCompletion::new(&LlmConfig::default(), Duration::from_secs(5))
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }
}
