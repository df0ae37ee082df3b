//! # Multi-level cache store
//!
//! A namespaced key/value cache with one logical level per kind of
//! artifact the pipeline produces. Every level has its own default TTL and
//! the schema-scoped levels are invalidated when the database schema
//! changes.
//!
//! ## Levels
//!
//! | Level | Default TTL | Schema-scoped |
//! |-------|-------------|---------------|
//! | `system` | 2h | no |
//! | `schema` | 1h | yes |
//! | `examples` | 1h | yes |
//! | `prompt` | 30m | yes |
//! | `sql` | 10m | no |
//! | `semantic` | 30m | no |
//!
//! ## Key layout
//!
//! Keys are stored as `{prefix}:{level}:{key}` and values as JSON
//! [`CacheEntry`] envelopes, so a remote store and the in-process map hold
//! byte-identical data.
//!
//! ## Example
//!
//! ```rust
//! use sluice_core::cache::{CacheLevel, CacheStore};
//! use sluice_core::config::CacheConfig;
//!
//! let store = CacheStore::new(CacheConfig::default());
//! store.set("greeting", &"hello", CacheLevel::System, None, None);
//! let value: Option<String> = store.get("greeting", CacheLevel::System, true);
//! assert_eq!(value.as_deref(), Some("hello"));
//! ```

mod backend;
mod redis_backend;
mod store;

pub use backend::{CacheBackend, MemoryBackend};
pub use redis_backend::RedisBackend;
pub use store::{CacheHealth, CacheMetrics, CacheStore, HealthStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Logical cache level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    /// Static system prompts
    System,
    /// Rendered schema descriptions
    Schema,
    /// Few-shot examples
    Examples,
    /// Assembled prompt components
    Prompt,
    /// Generated SQL answers
    Sql,
    /// Semantic index data
    Semantic,
}

impl CacheLevel {
    /// Every level, in declaration order
    pub const ALL: [CacheLevel; 6] = [
        CacheLevel::System,
        CacheLevel::Schema,
        CacheLevel::Examples,
        CacheLevel::Prompt,
        CacheLevel::Sql,
        CacheLevel::Semantic,
    ];

    /// Levels invalidated on schema change
    pub const SCHEMA_SCOPED: [CacheLevel; 3] =
        [CacheLevel::Schema, CacheLevel::Examples, CacheLevel::Prompt];

    /// Name used in keys and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::System => "system",
            CacheLevel::Schema => "schema",
            CacheLevel::Examples => "examples",
            CacheLevel::Prompt => "prompt",
            CacheLevel::Sql => "sql",
            CacheLevel::Semantic => "semantic",
        }
    }

    /// Whether entries at this level must match the current schema version
    pub fn is_schema_scoped(&self) -> bool {
        Self::SCHEMA_SCOPED.contains(self)
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored value together with its bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Caller-supplied key (without prefix and level)
    pub key: String,
    /// JSON payload
    pub value: serde_json::Value,
    /// Level the entry lives in
    pub level: CacheLevel,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry time, `None` for no expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// Number of hits served
    pub hit_count: u64,
    /// Schema version the entry was produced under
    pub schema_version: Option<String>,
}

impl CacheEntry {
    /// Returns true once `now` is past `expires_at`
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now > at).unwrap_or(false)
    }

    /// Time left before expiry, `None` for entries without expiry
    pub fn remaining_ttl(&self) -> Option<std::time::Duration> {
        self.remaining_ttl_at(Utc::now())
    }

    fn remaining_ttl_at(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.expires_at
            .map(|at| (at - now).to_std().unwrap_or_default())
    }
}

/// Short content hash: the first 16 hex characters of SHA-256
pub fn hash_key(text: &str) -> String {
    short_digest(text.as_bytes())
}

/// First 16 hex characters of the SHA-256 digest of `data`
pub fn short_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_hash_key_is_stable() {
        let a = hash_key("how many users are there");
        let b = hash_key("how many users are there");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, hash_key("how many orders are there"));
    }

    #[test]
    fn test_level_scoping() {
        assert!(CacheLevel::Schema.is_schema_scoped());
        assert!(CacheLevel::Prompt.is_schema_scoped());
        assert!(!CacheLevel::Sql.is_schema_scoped());
        assert!(!CacheLevel::System.is_schema_scoped());
        assert_eq!(CacheLevel::Semantic.to_string(), "semantic");
    }

    #[test]
    fn test_entry_expiry() {
        let now = Utc::now();
        let entry = CacheEntry {
            key: "k".to_string(),
            value: serde_json::json!(1),
            level: CacheLevel::Sql,
            created_at: now,
            expires_at: Some(now + ChronoDuration::seconds(10)),
            hit_count: 0,
            schema_version: None,
        };
        assert!(!entry.is_expired_at(now));
        assert!(entry.is_expired_at(now + ChronoDuration::seconds(11)));
        assert!(entry.remaining_ttl().is_some());
    }
}
