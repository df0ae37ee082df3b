//! In-process vector index over cached question embeddings
//!
//! Brute-force cosine search with an LRU bound. The index is a derived
//! cache: it is written through to the cache store's semantic level as one
//! aggregate entry and rehydrated from there on construction.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use sluice_core::cache::{CacheLevel, CacheStore};
use sluice_core::config::SemanticConfig;

use super::{cosine_similarity, SemanticError};

/// Metadata kept next to each vector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Intent label of the stored question
    pub query_type: String,
    /// Tables the stored SQL reads
    #[serde(default)]
    pub tables: Vec<String>,
    /// Schema version the SQL was generated under
    #[serde(default)]
    pub schema_version: Option<String>,
}

/// Search constraints
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchFilter<'a> {
    /// Candidates with this query type are boosted
    pub query_type: Option<&'a str>,
    /// Candidates stamped with a different version are skipped
    pub schema_version: Option<&'a str>,
}

/// Index statistics
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    /// Vectors held
    pub total_vectors: usize,
    /// Vector dimension
    pub dimension: usize,
    /// Capacity before eviction
    pub max_vectors: usize,
    /// Approximate vector memory in bytes
    pub memory_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedVector {
    embedding: Vec<f32>,
    #[serde(flatten)]
    metadata: IndexMetadata,
    /// LRU position at persist time
    #[serde(default)]
    seq: u64,
}

struct IndexedVector {
    embedding: Vec<f32>,
    metadata: IndexMetadata,
}

#[derive(Default)]
struct IndexInner {
    vectors: HashMap<String, IndexedVector>,
    /// Oldest first
    order: VecDeque<String>,
    /// Adds since the last persist
    pending: usize,
}

impl IndexInner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) -> bool {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.vectors.remove(key).is_some()
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let oldest = self.order.pop_front()?;
        self.vectors.remove(&oldest);
        Some(oldest)
    }
}

/// LRU-bounded vector index persisted through the cache store
pub struct VectorIndex {
    store: Arc<CacheStore>,
    dimension: usize,
    max_entries: usize,
    intent_boost: f32,
    persist_every: usize,
    ttl: Duration,
    inner: Mutex<IndexInner>,
}

impl VectorIndex {
    /// Key of the aggregate entry at the semantic level
    pub const STORE_KEY: &'static str = "embedding_index";

    /// Create an index and rehydrate it from `store`
    pub fn new(store: Arc<CacheStore>, dimension: usize, config: &SemanticConfig) -> Self {
        let index = Self {
            store,
            dimension,
            max_entries: config.max_index_entries.max(1),
            intent_boost: config.intent_boost,
            persist_every: config.persist_every,
            ttl: Duration::from_secs(config.index_ttl_secs),
            inner: Mutex::new(IndexInner::default()),
        };
        index.load();
        index
    }

    /// Vector dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of indexed vectors
    pub fn len(&self) -> usize {
        self.inner.lock().vectors.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is indexed
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().vectors.contains_key(key)
    }

    /// Insert or replace `key`, evicting the oldest entries when full
    pub fn add(
        &self,
        key: &str,
        vector: Vec<f32>,
        metadata: IndexMetadata,
    ) -> Result<(), SemanticError> {
        if vector.len() != self.dimension {
            return Err(SemanticError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }

        let should_persist = {
            let mut inner = self.inner.lock();
            if !inner.vectors.contains_key(key) {
                while inner.vectors.len() >= self.max_entries {
                    match inner.evict_oldest() {
                        Some(evicted) => debug!(key = %evicted, "vector evicted"),
                        None => break,
                    }
                }
            }
            inner.vectors.insert(
                key.to_string(),
                IndexedVector {
                    embedding: vector,
                    metadata,
                },
            );
            inner.touch(key);
            inner.pending += 1;

            self.persist_every > 0 && inner.pending >= self.persist_every
        };

        if should_persist {
            self.persist();
        }
        Ok(())
    }

    /// Remove `key`; returns whether it was present
    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove(key)
    }

    /// Nearest neighbours of `query` at or above `min_similarity`, best
    /// first, at most `top_k`.
    ///
    /// Candidates whose query type matches the filter have their score
    /// multiplied by the configured intent boost for thresholding and
    /// ranking. Reported similarities never exceed 1.0.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &SearchFilter<'_>,
        min_similarity: f32,
    ) -> Vec<(String, f32)> {
        if query.len() != self.dimension || top_k == 0 {
            return Vec::new();
        }

        let inner = self.inner.lock();
        let mut results: Vec<(String, f32)> = inner
            .vectors
            .iter()
            .filter(|(_, v)| match (filter.schema_version, v.metadata.schema_version.as_deref()) {
                (Some(wanted), Some(have)) => wanted == have,
                _ => true,
            })
            .map(|(key, v)| {
                let mut score = cosine_similarity(query, &v.embedding);
                if filter.query_type == Some(v.metadata.query_type.as_str()) {
                    score *= self.intent_boost;
                }
                (key.clone(), score)
            })
            .filter(|(_, score)| *score >= min_similarity)
            .collect();
        drop(inner);

        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        for (_, score) in &mut results {
            *score = score.min(1.0);
        }
        results
    }

    /// Write the whole index to the cache store
    pub fn persist(&self) -> bool {
        let snapshot: BTreeMap<String, PersistedVector> = {
            let mut inner = self.inner.lock();
            inner.pending = 0;
            inner
                .order
                .iter()
                .enumerate()
                .filter_map(|(seq, key)| {
                    inner.vectors.get(key).map(|v| {
                        (
                            key.clone(),
                            PersistedVector {
                                embedding: v.embedding.clone(),
                                metadata: v.metadata.clone(),
                                seq: seq as u64,
                            },
                        )
                    })
                })
                .collect()
        };

        let count = snapshot.len();
        let ok = self.store.set(
            Self::STORE_KEY,
            &snapshot,
            CacheLevel::Semantic,
            Some(self.ttl),
            None,
        );
        if ok {
            debug!(vectors = count, "vector index persisted");
        } else {
            warn!(vectors = count, "vector index persist failed");
        }
        ok
    }

    /// Replace the in-memory index with the persisted one; returns the
    /// number of vectors loaded
    pub fn load(&self) -> usize {
        let persisted: BTreeMap<String, PersistedVector> =
            match self.store.get(Self::STORE_KEY, CacheLevel::Semantic, false) {
                Some(data) => data,
                None => return 0,
            };

        let mut entries: Vec<(String, PersistedVector)> = persisted
            .into_iter()
            .filter(|(_, v)| v.embedding.len() == self.dimension)
            .collect();
        entries.sort_by_key(|(_, v)| v.seq);

        let mut inner = self.inner.lock();
        *inner = IndexInner::default();
        for (key, v) in entries.into_iter() {
            if inner.vectors.len() >= self.max_entries {
                inner.evict_oldest();
            }
            inner.order.push_back(key.clone());
            inner.vectors.insert(
                key,
                IndexedVector {
                    embedding: v.embedding,
                    metadata: v.metadata,
                },
            );
        }

        let loaded = inner.vectors.len();
        if loaded > 0 {
            info!(vectors = loaded, "vector index loaded");
        }
        loaded
    }

    /// Drop every vector and the persisted copy
    pub fn clear(&self) {
        *self.inner.lock() = IndexInner::default();
        self.store.invalidate(Self::STORE_KEY, CacheLevel::Semantic);
    }

    /// Index statistics
    pub fn stats(&self) -> IndexStats {
        let total = self.len();
        IndexStats {
            total_vectors: total,
            dimension: self.dimension,
            max_vectors: self.max_entries,
            memory_bytes: total * self.dimension * std::mem::size_of::<f32>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::l2_normalize;

    fn unit(values: &[f32]) -> Vec<f32> {
        let mut v = values.to_vec();
        l2_normalize(&mut v);
        v
    }

    fn meta(query_type: &str, version: Option<&str>) -> IndexMetadata {
        IndexMetadata {
            query_type: query_type.to_string(),
            tables: vec!["users".to_string()],
            schema_version: version.map(str::to_string),
        }
    }

    fn index(max: usize, persist_every: usize) -> (Arc<CacheStore>, VectorIndex) {
        let store = Arc::new(CacheStore::in_memory());
        let config = SemanticConfig {
            max_index_entries: max,
            persist_every,
            ..Default::default()
        };
        let index = VectorIndex::new(store.clone(), 3, &config);
        (store, index)
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let (_, index) = index(10, 0);
        index.add("a", unit(&[1.0, 0.0, 0.0]), meta("count", None)).unwrap();
        index.add("b", unit(&[1.0, 0.2, 0.0]), meta("count", None)).unwrap();
        index.add("c", unit(&[0.0, 1.0, 0.0]), meta("count", None)).unwrap();

        let results = index.search(&unit(&[1.0, 0.0, 0.0]), 5, &SearchFilter::default(), 0.5);
        let keys: Vec<&str> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!((results[0].1 - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_intent_boost_reorders() {
        let (_, index) = index(10, 0);
        index.add("max", unit(&[1.0, 0.1, 0.0]), meta("max", None)).unwrap();
        index.add("min", unit(&[1.0, 0.15, 0.0]), meta("min", None)).unwrap();

        let query = unit(&[1.0, 0.15, 0.0]);
        let plain = index.search(&query, 2, &SearchFilter::default(), 0.0);
        assert_eq!(plain[0].0, "min");

        let filter = SearchFilter {
            query_type: Some("max"),
            schema_version: None,
        };
        let boosted = index.search(&query, 2, &filter, 0.0);
        assert_eq!(boosted[0].0, "max");
        assert!(boosted.iter().all(|(_, score)| *score <= 1.0));

        // an exact match stays at 1.0 when boosted
        let exact = index.search(&unit(&[1.0, 0.1, 0.0]), 1, &filter, 0.0);
        assert_eq!(exact[0].0, "max");
        assert!((exact[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_schema_filter_skips_other_versions() {
        let (_, index) = index(10, 0);
        index.add("old", unit(&[1.0, 0.0, 0.0]), meta("count", Some("v1"))).unwrap();
        index.add("new", unit(&[1.0, 0.0, 0.0]), meta("count", Some("v2"))).unwrap();
        index.add("any", unit(&[1.0, 0.0, 0.0]), meta("count", None)).unwrap();

        let filter = SearchFilter {
            query_type: None,
            schema_version: Some("v2"),
        };
        let mut keys: Vec<String> = index
            .search(&unit(&[1.0, 0.0, 0.0]), 5, &filter, 0.5)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["any".to_string(), "new".to_string()]);
    }

    #[test]
    fn test_lru_eviction() {
        let (_, index) = index(2, 0);
        index.add("a", unit(&[1.0, 0.0, 0.0]), meta("x", None)).unwrap();
        index.add("b", unit(&[0.0, 1.0, 0.0]), meta("x", None)).unwrap();
        // Re-adding refreshes recency
        index.add("a", unit(&[1.0, 0.0, 0.0]), meta("x", None)).unwrap();
        index.add("c", unit(&[0.0, 0.0, 1.0]), meta("x", None)).unwrap();

        assert_eq!(index.len(), 2);
        assert!(index.contains("a"));
        assert!(!index.contains("b"));
        assert!(index.contains("c"));
    }

    #[test]
    fn test_dimension_checked() {
        let (_, index) = index(2, 0);
        let err = index.add("a", vec![1.0], meta("x", None)).unwrap_err();
        assert!(matches!(err, SemanticError::DimensionMismatch { .. }));
        assert!(index
            .search(&[1.0], 5, &SearchFilter::default(), 0.0)
            .is_empty());
    }

    #[test]
    fn test_persist_and_rehydrate() {
        let (store, index) = index(10, 2);
        index.add("a", unit(&[1.0, 0.0, 0.0]), meta("count", Some("v1"))).unwrap();
        index.add("b", unit(&[0.0, 1.0, 0.0]), meta("sum", Some("v1"))).unwrap();

        // Second add hit the persist interval
        let config = SemanticConfig::default();
        let restored = VectorIndex::new(store.clone(), 3, &config);
        assert_eq!(restored.len(), 2);
        let hits = restored.search(&unit(&[0.0, 1.0, 0.0]), 1, &SearchFilter::default(), 0.9);
        assert_eq!(hits[0].0, "b");

        index.clear();
        let empty = VectorIndex::new(store, 3, &config);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_persists_every_n_adds_when_full() {
        let (store, index) = index(2, 2);
        let persisted = |store: &CacheStore| {
            store
                .get::<BTreeMap<String, PersistedVector>>(
                    VectorIndex::STORE_KEY,
                    CacheLevel::Semantic,
                    false,
                )
                .map(|m| m.keys().cloned().collect::<Vec<_>>())
        };

        index.add("a", unit(&[1.0, 0.0, 0.0]), meta("x", None)).unwrap();
        index.add("b", unit(&[0.0, 1.0, 0.0]), meta("x", None)).unwrap();
        assert_eq!(persisted(&store), Some(vec!["a".to_string(), "b".to_string()]));

        // at capacity, one more add is not enough to persist again
        index.add("c", unit(&[0.0, 0.0, 1.0]), meta("x", None)).unwrap();
        assert_eq!(persisted(&store), Some(vec!["a".to_string(), "b".to_string()]));

        index.add("d", unit(&[1.0, 1.0, 0.0]), meta("x", None)).unwrap();
        assert_eq!(persisted(&store), Some(vec!["c".to_string(), "d".to_string()]));
    }

    #[test]
    fn test_remove_and_stats() {
        let (_, index) = index(10, 0);
        index.add("a", unit(&[1.0, 0.0, 0.0]), meta("x", None)).unwrap();
        assert!(index.remove("a"));
        assert!(!index.remove("a"));

        let stats = index.stats();
        assert_eq!(stats.total_vectors, 0);
        assert_eq!(stats.dimension, 3);
        assert_eq!(stats.max_vectors, 10);
    }
}
