//! Async embedding front end with a per-text cache
//!
//! Wraps a blocking [`EmbeddingProvider`] so callers can await it. Remote
//! providers run on the blocking pool under a timeout; local ones are cheap
//! enough to call inline.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use sluice_core::cache::hash_key;
use sluice_core::config::SemanticConfig;

use super::{EmbeddingProvider, SemanticError};

/// Async embedder shared by the semantic cache and the orchestrator
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: DashMap<String, Arc<Vec<f32>>>,
    max_cached: usize,
    request_timeout: Duration,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl Embedder {
    /// Create an embedder over `provider`
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &SemanticConfig) -> Self {
        Self {
            provider,
            cache: DashMap::new(),
            max_cached: config.embedding_cache_size,
            request_timeout: Duration::from_secs(config.embedding_timeout_secs.max(1)),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Embedding dimension declared by the provider
    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    /// Provider model name
    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Number of cached embeddings
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// `(hits, misses)` of the per-text cache
    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    /// Generate the embedding for a single text
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, SemanticError> {
        self.embed_many(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SemanticError::EmbeddingFailed("Empty batch result".to_string()))
    }

    /// Generate embeddings for several texts, in input order.
    ///
    /// Cached texts are served from memory; the rest go to the provider in
    /// a single batch.
    pub async fn embed_many(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, SemanticError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = texts.iter().map(|t| hash_key(t)).collect();
        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut missing: Vec<usize> = Vec::new();

        for (i, key) in keys.iter().enumerate() {
            match self.cache.get(key) {
                Some(hit) => {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    results.push(Some(hit.value().as_ref().clone()));
                }
                None => {
                    self.cache_misses.fetch_add(1, Ordering::Relaxed);
                    results.push(None);
                    missing.push(i);
                }
            }
        }

        if !missing.is_empty() {
            let pending: Vec<String> = missing.iter().map(|&i| texts[i].to_string()).collect();
            let fresh = self.call_provider(pending).await?;
            if fresh.len() != missing.len() {
                return Err(SemanticError::EmbeddingFailed(format!(
                    "provider returned {} embeddings for {} texts",
                    fresh.len(),
                    missing.len()
                )));
            }

            let expected = self.provider.dimension();
            for (slot, vector) in missing.into_iter().zip(fresh) {
                if vector.len() != expected {
                    return Err(SemanticError::DimensionMismatch {
                        expected,
                        got: vector.len(),
                    });
                }
                self.remember(keys[slot].clone(), &vector);
                results[slot] = Some(vector);
            }
        }

        results
            .into_iter()
            .map(|r| r.ok_or_else(|| SemanticError::Internal("missing embedding".to_string())))
            .collect()
    }

    async fn call_provider(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, SemanticError> {
        if self.provider.is_local() {
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
            return self.provider.embed_batch(&refs);
        }

        let provider = Arc::clone(&self.provider);
        let result = timeout(self.request_timeout, async move {
            tokio::task::spawn_blocking(move || {
                let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
                provider.embed_batch(&refs)
            })
            .await
            .map_err(|e| SemanticError::Internal(format!("Task join error: {}", e)))?
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(SemanticError::Timeout(
                self.request_timeout.as_millis() as u64,
            )),
        }
    }

    fn remember(&self, key: String, vector: &[f32]) {
        if self.max_cached == 0 {
            return;
        }
        while self.cache.len() >= self.max_cached {
            // Bound only; no recency tracking
            let victim = self.cache.iter().next().map(|e| e.key().clone());
            match victim {
                Some(k) => {
                    self.cache.remove(&k);
                }
                None => break,
            }
        }
        debug!(key = %key, "embedding cached");
        self.cache.insert(key, Arc::new(vector.to_vec()));
    }

    /// Drop all cached embeddings
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
