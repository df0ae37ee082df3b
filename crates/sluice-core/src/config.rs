//! Configuration module for Sluice
//!
//! This module handles loading and parsing configuration from TOML files,
//! with sensible defaults for all optional values. Each section doubles as
//! the runtime configuration of the component it names, so a parsed
//! [`Config`] can be handed piecewise to the cache, the semantic layer and
//! the orchestrator.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cache::CacheLevel;
use crate::error::{Result, SluiceError};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Multi-level cache store
    pub cache: CacheConfig,

    /// Semantic (embedding similarity) cache
    pub semantic: SemanticConfig,

    /// Query-plan template cache
    pub plan_cache: PlanCacheConfig,

    /// Static SQL validation and post-processing
    pub validation: ValidationConfig,

    /// Execution feedback loop
    pub feedback: FeedbackConfig,

    /// Request orchestration
    pub orchestrator: OrchestratorConfig,

    /// LLM completion endpoint
    pub llm: LlmConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SluiceError::Configuration(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| SluiceError::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Serialize the effective configuration back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SluiceError::Serialization(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache.prefix.is_empty() {
            return Err(SluiceError::Configuration(
                "cache.prefix cannot be empty".to_string(),
            ));
        }
        for level in CacheLevel::ALL {
            if self.cache.ttl_for(level).is_zero() {
                return Err(SluiceError::Configuration(format!(
                    "TTL for cache level '{}' cannot be 0",
                    level
                )));
            }
        }

        check_unit("semantic.similarity_threshold", self.semantic.similarity_threshold)?;
        check_unit("semantic.confidence_cap", self.semantic.confidence_cap)?;
        if self.semantic.top_k == 0 {
            return Err(SluiceError::Configuration(
                "semantic.top_k cannot be 0".to_string(),
            ));
        }
        if self.semantic.max_index_entries == 0 {
            return Err(SluiceError::Configuration(
                "semantic.max_index_entries cannot be 0".to_string(),
            ));
        }
        if self.semantic.embedding_dim == 0 {
            return Err(SluiceError::Configuration(
                "semantic.embedding_dim cannot be 0".to_string(),
            ));
        }
        if self.semantic.intent_boost < 1.0 {
            return Err(SluiceError::Configuration(
                "semantic.intent_boost must be >= 1.0".to_string(),
            ));
        }

        check_unit("plan_cache.min_confidence", self.plan_cache.min_confidence)?;
        check_unit("plan_cache.detect_floor", self.plan_cache.detect_floor)?;
        if self.plan_cache.max_plans == 0 {
            return Err(SluiceError::Configuration(
                "plan_cache.max_plans cannot be 0".to_string(),
            ));
        }

        check_unit("validation.similarity_threshold", self.validation.similarity_threshold)?;
        if self.validation.default_limit == 0 {
            return Err(SluiceError::Configuration(
                "validation.default_limit cannot be 0".to_string(),
            ));
        }

        if self.orchestrator.max_concurrent == 0 {
            return Err(SluiceError::Configuration(
                "orchestrator.max_concurrent cannot be 0".to_string(),
            ));
        }
        if self.orchestrator.max_concurrent > self.orchestrator.max_concurrent_ceiling {
            return Err(SluiceError::Configuration(format!(
                "orchestrator.max_concurrent ({}) exceeds max_concurrent_ceiling ({})",
                self.orchestrator.max_concurrent, self.orchestrator.max_concurrent_ceiling
            )));
        }
        if self.orchestrator.llm_timeout_secs == 0 || self.feedback.timeout_secs == 0 {
            return Err(SluiceError::Configuration(
                "timeouts cannot be 0".to_string(),
            ));
        }
        check_unit(
            "orchestrator.cache_min_confidence",
            self.orchestrator.cache_min_confidence,
        )?;
        check_unit(
            "orchestrator.execute_min_confidence",
            self.orchestrator.execute_min_confidence,
        )?;

        if self.semantic.embedding_provider == EmbeddingProviderKind::OpenAi
            && self.semantic.embedding_api_key.is_none()
        {
            return Err(SluiceError::Configuration(
                "semantic.embedding_provider = \"openai\" requires embedding_api_key".to_string(),
            ));
        }

        Ok(())
    }

    /// Apply a single `section.key=value` override (used by `--set`)
    pub fn apply_override(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "cache.enabled" => self.cache.enabled = parse_value(key, value)?,
            "cache.prefix" => self.cache.prefix = value.to_string(),
            "cache.redis_url" => {
                self.cache.redis_url = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "cache.sql_ttl_secs" => self.cache.sql_ttl_secs = parse_value(key, value)?,
            "semantic.enabled" => self.semantic.enabled = parse_value(key, value)?,
            "semantic.similarity_threshold" => {
                self.semantic.similarity_threshold = parse_value(key, value)?
            }
            "semantic.top_k" => self.semantic.top_k = parse_value(key, value)?,
            "plan_cache.enabled" => self.plan_cache.enabled = parse_value(key, value)?,
            "plan_cache.min_confidence" => {
                self.plan_cache.min_confidence = parse_value(key, value)?
            }
            "validation.default_limit" => {
                self.validation.default_limit = parse_value(key, value)?
            }
            "feedback.max_retries" => self.feedback.max_retries = parse_value(key, value)?,
            "orchestrator.max_concurrent" => {
                self.orchestrator.max_concurrent = parse_value(key, value)?
            }
            "orchestrator.llm_timeout_secs" => {
                self.orchestrator.llm_timeout_secs = parse_value(key, value)?
            }
            "orchestrator.dialect" => {
                self.orchestrator.dialect = match value.to_lowercase().as_str() {
                    "postgres" | "postgresql" => SqlDialect::Postgres,
                    "mysql" => SqlDialect::Mysql,
                    "sqlite" => SqlDialect::Sqlite,
                    _ => {
                        return Err(SluiceError::Configuration(format!(
                            "Invalid dialect: {}. Expected: postgres, mysql, sqlite",
                            value
                        )))
                    }
                }
            }
            "llm.model" => self.llm.model = value.to_string(),
            "llm.endpoint" => self.llm.endpoint = value.to_string(),
            "logging.level" => self.logging.level = value.to_string(),
            "logging.format" => {
                self.logging.format = match value.to_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    "pretty" | "text" => LogFormat::Pretty,
                    _ => {
                        return Err(SluiceError::Configuration(format!(
                            "Invalid logging format: {}. Expected: json, pretty",
                            value
                        )))
                    }
                }
            }
            _ => {
                return Err(SluiceError::Configuration(format!(
                    "Unknown config key: {}",
                    key
                )))
            }
        }
        Ok(())
    }
}

fn check_unit(key: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(SluiceError::Configuration(format!(
            "{} must be between 0.0 and 1.0, got {}",
            key, value
        )));
    }
    Ok(())
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| SluiceError::Configuration(format!("Invalid value for {}: {}", key, value)))
}

/// Cache store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable caching at all
    pub enabled: bool,

    /// Namespace prefix for every key
    pub prefix: String,

    /// Remote Redis-compatible store; the in-process map is used when unset or unreachable
    pub redis_url: Option<String>,

    /// Connection timeout for the remote store in milliseconds
    pub connect_timeout_ms: u64,

    /// Invalidate schema-scoped entries written under an older schema version
    pub check_schema_version: bool,

    /// TTL for system prompts
    pub system_ttl_secs: u64,
    /// TTL for rendered schema text
    pub schema_ttl_secs: u64,
    /// TTL for few-shot examples
    pub examples_ttl_secs: u64,
    /// TTL for assembled prompt components
    pub prompt_ttl_secs: u64,
    /// TTL for generated SQL answers
    pub sql_ttl_secs: u64,
    /// TTL for semantic index data
    pub semantic_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "nl2sql".to_string(),
            redis_url: None,
            connect_timeout_ms: 500,
            check_schema_version: true,
            system_ttl_secs: 7200,
            schema_ttl_secs: 3600,
            examples_ttl_secs: 3600,
            prompt_ttl_secs: 1800,
            sql_ttl_secs: 600,
            semantic_ttl_secs: 1800,
        }
    }
}

impl CacheConfig {
    /// Default TTL for a cache level
    pub fn ttl_for(&self, level: CacheLevel) -> Duration {
        let secs = match level {
            CacheLevel::System => self.system_ttl_secs,
            CacheLevel::Schema => self.schema_ttl_secs,
            CacheLevel::Examples => self.examples_ttl_secs,
            CacheLevel::Prompt => self.prompt_ttl_secs,
            CacheLevel::Sql => self.sql_ttl_secs,
            CacheLevel::Semantic => self.semantic_ttl_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Embedding backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Local hash-trick keyword embedder, no external dependency
    #[default]
    Keyword,
    /// OpenAI-compatible embeddings endpoint
    OpenAi,
}

/// Semantic cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    /// Enable similarity lookups (exact lookups always run)
    pub enabled: bool,
    /// Minimum cosine similarity for a semantic hit
    pub similarity_threshold: f32,
    /// Number of index candidates inspected per lookup
    pub top_k: usize,
    /// Maximum vectors kept in the index before LRU eviction
    pub max_index_entries: usize,
    /// Score multiplier when candidate intent matches the query intent
    pub intent_boost: f32,
    /// Persist the index after this many additions
    pub persist_every: usize,
    /// TTL of the persisted index snapshot
    pub index_ttl_secs: u64,
    /// Embedding dimension of the keyword embedder
    pub embedding_dim: usize,
    /// Embedding backend
    pub embedding_provider: EmbeddingProviderKind,
    /// API key for remote embedding providers
    pub embedding_api_key: Option<String>,
    /// Endpoint override for remote embedding providers
    pub embedding_endpoint: Option<String>,
    /// Number of per-text embeddings kept in memory
    pub embedding_cache_size: usize,
    /// Timeout for a single embedding call in seconds
    pub embedding_timeout_secs: u64,
    /// Confidence of a cache hit that has never been reused
    pub confidence_base: f32,
    /// Confidence added per recorded reuse
    pub confidence_step: f32,
    /// Upper bound for cached-answer confidence
    pub confidence_cap: f32,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.85,
            top_k: 5,
            max_index_entries: 5000,
            intent_boost: 1.1,
            persist_every: 100,
            index_ttl_secs: 86_400,
            embedding_dim: 256,
            embedding_provider: EmbeddingProviderKind::Keyword,
            embedding_api_key: None,
            embedding_endpoint: None,
            embedding_cache_size: 1000,
            embedding_timeout_secs: 10,
            confidence_base: 0.8,
            confidence_step: 0.1,
            confidence_cap: 0.95,
        }
    }
}

/// Query-plan cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanCacheConfig {
    /// Enable plan lookups
    pub enabled: bool,
    /// Maximum number of cached plans
    pub max_plans: usize,
    /// Plan lifetime in seconds
    pub ttl_secs: u64,
    /// Minimum detection confidence for a lookup to be attempted
    pub min_confidence: f32,
    /// Detection confidence below which a question is `UNKNOWN`
    pub detect_floor: f32,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_plans: 500,
            ttl_secs: 86_400,
            min_confidence: 0.7,
            detect_floor: 0.3,
        }
    }
}

/// Validator and post-processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// LIMIT appended to unbounded non-aggregate SELECTs
    pub default_limit: usize,
    /// Append the default LIMIT at all
    pub enforce_limit: bool,
    /// Minimum name similarity for "did you mean" suggestions
    pub similarity_threshold: f32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            enforce_limit: true,
            similarity_threshold: 0.6,
        }
    }
}

/// Execution feedback loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Maximum correction rounds after the first execution
    pub max_retries: u32,
    /// Per-call timeout for executor and correction calls, in seconds
    pub timeout_secs: u64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_secs: 15,
        }
    }
}

/// SQL dialect used for canned metadata queries and prompt hints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    /// PostgreSQL
    #[default]
    Postgres,
    /// MySQL / MariaDB
    Mysql,
    /// SQLite
    Sqlite,
}

impl std::fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlDialect::Postgres => write!(f, "postgres"),
            SqlDialect::Mysql => write!(f, "mysql"),
            SqlDialect::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Request orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent LLM calls
    pub max_concurrent: usize,
    /// Hard ceiling for caller-supplied concurrency
    pub max_concurrent_ceiling: usize,
    /// Deadline of the primary generation call in seconds
    pub llm_timeout_secs: u64,
    /// Minimum confidence for an answer to be written to the caches
    pub cache_min_confidence: f32,
    /// Minimum confidence for an answer to be executed
    pub execute_min_confidence: f32,
    /// Number of conversation messages forwarded to the LLM
    pub history_window: usize,
    /// Database dialect
    pub dialect: SqlDialect,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_concurrent_ceiling: 32,
            llm_timeout_secs: 30,
            cache_min_confidence: 0.7,
            execute_min_confidence: 0.5,
            history_window: 6,
            dialect: SqlDialect::Postgres,
        }
    }
}

impl OrchestratorConfig {
    /// Primary generation deadline
    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    /// Self-correction deadline, half the primary one
    pub fn correction_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_secs * 500)
    }
}

/// LLM completion endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions endpoint
    pub endpoint: String,
    /// Model identifier
    pub model: String,
    /// API key; falls back to `OPENAI_API_KEY`
    pub api_key: Option<String>,
    /// Sampling temperature for first-pass generation
    pub temperature: f32,
    /// Re-asks on malformed structured output
    pub max_parse_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            temperature: 0.1,
            max_parse_retries: 2,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    #[default]
    Pretty,

    /// JSON format
    Json,
}
