//! Semantic SQL answer cache
//!
//! Hybrid lookup: an exact hit on the normalized question first, then a
//! vector search over previously answered questions. Answers live in the
//! cache store's SQL level; the [`VectorIndex`] only points at them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use sluice_core::cache::{hash_key, CacheLevel, CacheStore};
use sluice_core::config::SemanticConfig;

use super::{Embedder, IndexMetadata, IndexStats, QueryNormalizer, SearchFilter, VectorIndex};

/// A previously generated answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAnswer {
    /// Question as first asked
    pub question: String,
    /// Normalized form used for the exact key
    pub normalized_question: String,
    /// Generated SQL
    pub sql: String,
    /// Explanation returned with the SQL
    #[serde(default)]
    pub explanation: String,
    /// Intent label at store time
    #[serde(default)]
    pub query_type: String,
    /// Tables the SQL reads
    #[serde(default)]
    pub tables_used: Vec<String>,
    /// Embedding of the normalized question
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// When the answer was stored
    pub created_at: DateTime<Utc>,
    /// Times the answer was served
    #[serde(default)]
    pub hit_count: u64,
    /// Schema version the SQL was generated under
    #[serde(default)]
    pub schema_version: Option<String>,
}

/// Semantic cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct SemanticStats {
    /// Embedding model
    pub embedder: String,
    /// Embedding dimension
    pub dimension: usize,
    /// Minimum similarity for a semantic hit
    pub similarity_threshold: f32,
    /// Exact-match hits
    pub exact_hits: u64,
    /// Similarity hits
    pub semantic_hits: u64,
    /// Misses
    pub misses: u64,
    /// (exact + semantic) / lookups
    pub hit_rate: f64,
    /// semantic / lookups
    pub semantic_hit_rate: f64,
    /// Vector index statistics
    pub index: IndexStats,
}

/// Question → SQL cache matching by meaning
pub struct SemanticCache {
    store: Arc<CacheStore>,
    embedder: Arc<Embedder>,
    index: VectorIndex,
    config: SemanticConfig,
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    misses: AtomicU64,
}

impl SemanticCache {
    /// Create a cache; the vector index is rehydrated from `store`
    pub fn new(store: Arc<CacheStore>, embedder: Arc<Embedder>, config: SemanticConfig) -> Self {
        let index = VectorIndex::new(store.clone(), embedder.dimension(), &config);
        info!(
            embedder = embedder.model_name(),
            dimension = embedder.dimension(),
            threshold = config.similarity_threshold,
            vectors = index.len(),
            "semantic cache initialized"
        );
        Self {
            store,
            embedder,
            index,
            config,
            exact_hits: AtomicU64::new(0),
            semantic_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The vector index
    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    fn store_key(id: &str) -> String {
        format!("sql:{}", id)
    }

    fn fetch(&self, id: &str) -> Option<CachedAnswer> {
        let entry = self
            .store
            .get_entry(&Self::store_key(id), CacheLevel::Sql, true)?;
        match serde_json::from_value::<CachedAnswer>(entry.value) {
            Ok(mut answer) => {
                answer.hit_count = entry.hit_count;
                Some(answer)
            }
            Err(e) => {
                warn!(key = %id, error = %e, "cached answer has unexpected shape");
                None
            }
        }
    }

    fn version_matches(wanted: Option<&str>, answer: &CachedAnswer) -> bool {
        match (wanted, answer.schema_version.as_deref()) {
            (Some(wanted), Some(have)) => wanted == have,
            _ => true,
        }
    }

    fn miss(&self) -> Option<(CachedAnswer, f32)> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Find a cached answer for `question`.
    ///
    /// Returns the answer and its similarity: 1.0 for an exact hit on the
    /// normalized question, the (possibly intent-boosted) cosine score for
    /// a semantic hit. Answers stamped with a different schema version are
    /// never returned.
    pub async fn lookup(
        &self,
        question: &str,
        schema_version: Option<&str>,
        allow_semantic: bool,
    ) -> Option<(CachedAnswer, f32)> {
        if !self.config.enabled {
            return None;
        }

        let normalized = QueryNormalizer::normalize(question);
        let id = hash_key(&normalized);

        if let Some(answer) = self.fetch(&id) {
            if Self::version_matches(schema_version, &answer) {
                self.exact_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %id, "exact semantic cache hit");
                return Some((answer, 1.0));
            }
            debug!(key = %id, "exact hit from another schema version");
        }

        if !allow_semantic || self.index.is_empty() {
            return self.miss();
        }

        let embedding = match self.embedder.embed_one(&normalized).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "question embedding failed, skipping semantic lookup");
                return self.miss();
            }
        };

        let intent = QueryNormalizer::intent(question);
        let filter = SearchFilter {
            query_type: Some(intent.label()),
            schema_version,
        };
        let candidates = self.index.search(
            &embedding,
            self.config.top_k,
            &filter,
            self.config.similarity_threshold,
        );

        for (candidate, similarity) in candidates {
            let Some(answer) = self.fetch(&candidate) else {
                // Expired or evicted behind the index's back
                self.index.remove(&candidate);
                continue;
            };
            if !Self::version_matches(schema_version, &answer) {
                continue;
            }
            self.semantic_hits.fetch_add(1, Ordering::Relaxed);
            info!(
                similarity = similarity,
                query_type = %answer.query_type,
                "semantic cache hit"
            );
            return Some((answer, similarity));
        }

        self.miss()
    }

    /// Store an answer under its normalized question and index its
    /// embedding. Returns false if nothing was written.
    pub async fn store(
        &self,
        question: &str,
        sql: &str,
        explanation: &str,
        query_type: &str,
        tables_used: &[String],
        schema_version: Option<&str>,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }

        let normalized = QueryNormalizer::normalize(question);
        let id = hash_key(&normalized);

        let embedding = match self.embedder.embed_one(&normalized).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "answer embedding failed, not caching");
                return false;
            }
        };

        let answer = CachedAnswer {
            question: question.to_string(),
            normalized_question: normalized,
            sql: sql.to_string(),
            explanation: explanation.to_string(),
            query_type: query_type.to_string(),
            tables_used: tables_used.to_vec(),
            embedding: embedding.clone(),
            created_at: Utc::now(),
            hit_count: 0,
            schema_version: schema_version.map(str::to_string),
        };

        let ttl = self.store.config().ttl_for(CacheLevel::Sql);
        if !self.store.set(
            &Self::store_key(&id),
            &answer,
            CacheLevel::Sql,
            Some(ttl),
            schema_version,
        ) {
            return false;
        }

        let metadata = IndexMetadata {
            query_type: query_type.to_string(),
            tables: tables_used.to_vec(),
            schema_version: schema_version.map(str::to_string),
        };
        if let Err(e) = self.index.add(&id, embedding, metadata) {
            warn!(key = %id, error = %e, "answer stored but not indexed");
        } else {
            debug!(key = %id, "answer cached and indexed");
        }
        true
    }

    /// Confidence reported for an answer served `hit_count` times:
    /// `min(cap, base + step * hit_count)`
    pub fn hit_confidence(&self, hit_count: u64) -> f32 {
        let raw = self.config.confidence_base + self.config.confidence_step * hit_count as f32;
        raw.min(self.config.confidence_cap)
    }

    /// Write the vector index through to the store now
    pub fn persist_index(&self) -> bool {
        self.index.persist()
    }

    /// Cache statistics
    pub fn stats(&self) -> SemanticStats {
        let exact = self.exact_hits.load(Ordering::Relaxed);
        let semantic = self.semantic_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = exact + semantic + misses;
        let rate = |n: u64| if total > 0 { n as f64 / total as f64 } else { 0.0 };

        SemanticStats {
            embedder: self.embedder.model_name().to_string(),
            dimension: self.embedder.dimension(),
            similarity_threshold: self.config.similarity_threshold,
            exact_hits: exact,
            semantic_hits: semantic,
            misses,
            hit_rate: rate(exact + semantic),
            semantic_hit_rate: rate(semantic),
            index: self.index.stats(),
        }
    }

    /// Drop every cached answer, the index and the statistics
    pub fn invalidate_all(&self) -> usize {
        let removed = self.store.invalidate_level(CacheLevel::Sql);
        self.index.clear();
        self.exact_hits.store(0, Ordering::Relaxed);
        self.semantic_hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        info!(removed, "semantic cache invalidated");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::KeywordProvider;

    fn cache_with(config: SemanticConfig) -> SemanticCache {
        let store = Arc::new(CacheStore::in_memory());
        let embedder = Arc::new(Embedder::new(
            Arc::new(KeywordProvider::new(config.embedding_dim)),
            &config,
        ));
        SemanticCache::new(store, embedder, config)
    }

    fn cache() -> SemanticCache {
        cache_with(SemanticConfig::default())
    }

    fn tables() -> Vec<String> {
        vec!["users".to_string()]
    }

    #[tokio::test]
    async fn test_exact_hit_after_store() {
        let cache = cache();
        assert!(
            cache
                .store(
                    "How many users are there?",
                    "SELECT COUNT(*) FROM users",
                    "counts users",
                    "count",
                    &tables(),
                    Some("v1"),
                )
                .await
        );

        let (answer, similarity) = cache
            .lookup("how many   users are there?", Some("v1"), true)
            .await
            .unwrap();
        assert_eq!(similarity, 1.0);
        assert_eq!(answer.sql, "SELECT COUNT(*) FROM users");
        assert_eq!(answer.hit_count, 1);
        assert_eq!(cache.stats().exact_hits, 1);
    }

    #[tokio::test]
    async fn test_semantic_hit_on_near_duplicate() {
        let cache = cache_with(SemanticConfig {
            similarity_threshold: 0.8,
            ..Default::default()
        });
        cache
            .store(
                "show the total revenue of all orders by customer",
                "SELECT customer_id, SUM(total) FROM orders GROUP BY customer_id",
                "",
                "sum",
                &["orders".to_string()],
                None,
            )
            .await;

        let (answer, similarity) = cache
            .lookup("show total revenue of all orders by customer", None, true)
            .await
            .unwrap();
        assert!(similarity >= 0.8);
        assert!(answer.sql.contains("SUM(total)"));
        assert_eq!(cache.stats().semantic_hits, 1);
    }

    #[tokio::test]
    async fn test_dissimilar_question_misses() {
        let cache = cache();
        cache
            .store(
                "How many users are there?",
                "SELECT COUNT(*) FROM users",
                "",
                "count",
                &tables(),
                None,
            )
            .await;

        assert!(cache
            .lookup("average order value per month", None, true)
            .await
            .is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_semantic_disabled_by_caller() {
        let cache = cache_with(SemanticConfig {
            similarity_threshold: 0.5,
            ..Default::default()
        });
        cache
            .store("list all users", "SELECT * FROM users", "", "select", &tables(), None)
            .await;

        assert!(cache.lookup("list every user", None, false).await.is_none());
    }

    #[tokio::test]
    async fn test_schema_version_mismatch_never_returned() {
        let cache = cache();
        cache
            .store(
                "How many users are there?",
                "SELECT COUNT(*) FROM users",
                "",
                "count",
                &tables(),
                Some("v1"),
            )
            .await;

        assert!(cache
            .lookup("How many users are there?", Some("v2"), true)
            .await
            .is_none());
        assert!(cache
            .lookup("How many users are there?", Some("v1"), true)
            .await
            .is_some());
    }

    #[test]
    fn test_hit_confidence_is_capped() {
        let cache = cache();
        assert!((cache.hit_confidence(0) - 0.8).abs() < 1e-6);
        assert!((cache.hit_confidence(1) - 0.9).abs() < 1e-6);
        assert!((cache.hit_confidence(10) - 0.95).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let cache = cache();
        cache
            .store("list all users", "SELECT * FROM users", "", "select", &tables(), None)
            .await;
        cache.lookup("list all users", None, true).await;

        assert_eq!(cache.invalidate_all(), 1);
        assert!(cache.index().is_empty());
        assert_eq!(cache.stats().exact_hits, 0);
        assert!(cache.lookup("list all users", None, true).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_cache_is_inert() {
        let cache = cache_with(SemanticConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(
            !cache
                .store("list all users", "SELECT * FROM users", "", "select", &tables(), None)
                .await
        );
        assert!(cache.lookup("list all users", None, true).await.is_none());
    }
}
