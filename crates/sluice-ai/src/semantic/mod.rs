//! # Semantic question cache
//!
//! Answer questions by meaning, not just exact text. A question that was
//! already turned into SQL is embedded and indexed; a later question whose
//! embedding is close enough reuses the stored SQL instead of calling the
//! LLM again.
//!
//! Users ask the same thing in different ways:
//!
//! - "How many users are there?"
//! - "how many  users are there"
//! - "Count the users"
//!
//! The first two normalize to the same text and hit exactly. The third
//! only matches through the vector index.
//!
//! ## Lookup order
//!
//! 1. Normalize the question and try an exact lookup (similarity 1.0)
//! 2. Embed the normalized question and extract its intent label
//! 3. Search the [`VectorIndex`] above the similarity threshold, boosting
//!    candidates with the same intent
//! 4. Re-fetch each candidate from the cache store, drop schema mismatches,
//!    return the first survivor
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sluice_ai::semantic::{Embedder, KeywordProvider, SemanticCache};
//! use sluice_core::cache::CacheStore;
//! use sluice_core::config::SemanticConfig;
//!
//! let store = Arc::new(CacheStore::in_memory());
//! let embedder = Arc::new(Embedder::new(Arc::new(KeywordProvider::new(256)), &SemanticConfig::default()));
//! let cache = SemanticCache::new(store, embedder, SemanticConfig::default());
//!
//! cache.store("How many users are there?", "SELECT COUNT(*) FROM users", "", "count", &["users".into()], Some("v1")).await;
//! let (answer, similarity) = cache.lookup("how many users are there", Some("v1"), true).await.unwrap();
//! assert_eq!(similarity, 1.0);
//! ```
//!
//! ## Threshold Tuning
//!
//! | Threshold | Hit Rate | Risk of wrong SQL |
//! |-----------|----------|-------------------|
//! | 0.95+ | Low | Very low |
//! | 0.90 | Medium | Low |
//! | 0.85 | High | Moderate (default) |
//! | 0.80 | Very High | Noticeable |

mod async_embeddings;
mod embeddings;
mod normalizer;
mod semantic_cache;
mod vector_index;

pub use async_embeddings::Embedder;
pub use embeddings::{
    cosine_similarity, l2_normalize, provider_from_config, EmbeddingProvider, KeywordProvider,
    OpenAiProvider,
};
pub use normalizer::{Aggregation, Intent, Operation, QueryNormalizer, Temporal};
pub use semantic_cache::{CachedAnswer, SemanticCache, SemanticStats};
pub use vector_index::{IndexMetadata, IndexStats, SearchFilter, VectorIndex};

use sluice_core::SluiceError;

/// Errors that can occur in the semantic layer
#[derive(Debug, Clone, thiserror::Error)]
pub enum SemanticError {
    /// Dimension mismatch
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Expected dimension
        expected: usize,
        /// Got dimension
        got: usize,
    },

    /// Embedding generation failed
    #[error("embedding generation failed: {0}")]
    EmbeddingFailed(String),

    /// Embedding call exceeded its deadline
    #[error("embedding timed out after {0}ms")]
    Timeout(u64),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SemanticError> for SluiceError {
    fn from(err: SemanticError) -> Self {
        match err {
            SemanticError::Timeout(ms) => SluiceError::Timeout {
                operation: "embedding".to_string(),
                after_ms: ms,
            },
            SemanticError::ConfigError(msg) => SluiceError::Configuration(msg),
            other => SluiceError::Collaborator(other.to_string()),
        }
    }
}
