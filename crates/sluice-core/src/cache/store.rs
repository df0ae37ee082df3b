//! The multi-level cache store

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::{CacheBackend, MemoryBackend};
use super::redis_backend::RedisBackend;
use super::{hash_key, CacheEntry, CacheLevel};
use crate::config::CacheConfig;
use crate::error::Result;

// ============================================================================
// Metrics
// ============================================================================

/// Point-in-time cache metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Total hits
    pub hits: u64,
    /// Total misses
    pub misses: u64,
    /// Hit rate as a percentage (0-100)
    pub hit_rate: f64,
    /// Entries removed by invalidation
    pub evictions: u64,
    /// Live entries under the prefix
    pub total_entries: usize,
    /// Hits per level name
    pub hits_by_level: BTreeMap<String, u64>,
    /// Backend in use (`redis` or `memory`)
    pub backend: String,
    /// Whether a remote store is connected
    pub redis_connected: bool,
    /// Schema version the store is scoped to
    pub current_schema_version: Option<String>,
}

/// Health status of the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Configured backend is answering
    Healthy,
    /// Remote store configured but unreachable; serving from memory
    Degraded,
    /// Backend is failing
    Unhealthy,
    /// Caching is turned off
    Disabled,
}

/// Result of a cache health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheHealth {
    /// Overall status
    pub status: HealthStatus,
    /// Backend in use
    pub backend: String,
    /// Probe round-trip in milliseconds
    pub latency_ms: Option<f64>,
    /// Extra detail for non-healthy states
    pub message: Option<String>,
}

struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    hits_by_level: [AtomicU64; 6],
}

impl Counters {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            hits_by_level: Default::default(),
        }
    }

    fn record_hit(&self, level: CacheLevel) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.hits_by_level[level.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }
}

// ============================================================================
// CacheStore
// ============================================================================

/// Namespaced multi-level cache with TTLs and schema-aware invalidation.
///
/// Every operation is infallible from the caller's point of view: backend
/// failures are logged and reported as a miss or a no-op.
pub struct CacheStore {
    config: CacheConfig,
    backend: Arc<dyn CacheBackend>,
    /// Remote store was configured but could not be reached
    degraded: bool,
    schema_version: RwLock<Option<String>>,
    counters: Counters,
}

impl CacheStore {
    /// Create a store, connecting to the configured remote backend when
    /// reachable and falling back to the in-process map otherwise.
    pub fn new(config: CacheConfig) -> Self {
        let mut degraded = false;
        let backend: Arc<dyn CacheBackend> = match config.redis_url.as_deref() {
            Some(url) if config.enabled => {
                let timeout = Duration::from_millis(config.connect_timeout_ms);
                match RedisBackend::connect(url, timeout) {
                    Ok(remote) => {
                        info!(url = %url, "cache connected to remote store");
                        Arc::new(remote)
                    }
                    Err(e) => {
                        warn!(url = %url, error = %e, "remote cache unreachable, using in-process cache");
                        degraded = true;
                        Arc::new(MemoryBackend::new())
                    }
                }
            }
            _ => Arc::new(MemoryBackend::new()),
        };

        Self {
            config,
            backend,
            degraded,
            schema_version: RwLock::new(None),
            counters: Counters::new(),
        }
    }

    /// Create a store over an explicit backend
    pub fn with_backend(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            config,
            backend,
            degraded: false,
            schema_version: RwLock::new(None),
            counters: Counters::new(),
        }
    }

    /// In-process store with default settings
    pub fn in_memory() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether caching is enabled
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn full_key(&self, key: &str, level: CacheLevel) -> String {
        format!("{}:{}:{}", self.config.prefix, level, key)
    }

    fn level_prefix(&self, level: CacheLevel) -> String {
        format!("{}:{}:", self.config.prefix, level)
    }

    /// Store `value` at `level`.
    ///
    /// `ttl` defaults to the level's TTL and `schema_version` to the
    /// store's current version. Returns false if the write was dropped.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        level: CacheLevel,
        ttl: Option<Duration>,
        schema_version: Option<&str>,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }

        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %key, level = %level, error = %e, "cache value not serializable");
                return false;
            }
        };

        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for(level));
        let now = Utc::now();
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            level,
            created_at: now,
            expires_at: ChronoDuration::from_std(ttl).ok().map(|d| now + d),
            hit_count: 0,
            schema_version: schema_version
                .map(str::to_string)
                .or_else(|| self.schema_version.read().clone()),
        };

        match self.write_entry(&entry, Some(ttl)) {
            Ok(()) => {
                debug!(key = %key, level = %level, ttl_secs = ttl.as_secs(), "cache set");
                true
            }
            Err(e) => {
                warn!(key = %key, level = %level, error = %e, "cache set failed");
                false
            }
        }
    }

    fn write_entry(&self, entry: &CacheEntry, ttl: Option<Duration>) -> Result<()> {
        let raw = serde_json::to_string(entry)?;
        self.backend
            .set(&self.full_key(&entry.key, entry.level), &raw, ttl)
    }

    /// Fetch the raw entry for `key`, applying expiry and schema checks.
    ///
    /// Records a hit or a miss and bumps the entry's hit count on success.
    pub fn get_entry(
        &self,
        key: &str,
        level: CacheLevel,
        check_schema_version: bool,
    ) -> Option<CacheEntry> {
        if !self.config.enabled {
            return None;
        }

        let full_key = self.full_key(key, level);
        let raw = match self.backend.get(&full_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.counters.record_miss();
                return None;
            }
            Err(e) => {
                warn!(key = %key, level = %level, error = %e, "cache get failed");
                self.counters.record_miss();
                return None;
            }
        };

        let mut entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, level = %level, error = %e, "corrupt cache entry dropped");
                let _ = self.backend.delete(&full_key);
                self.counters.record_miss();
                return None;
            }
        };

        // zero remaining TTL counts as expired
        let now = Utc::now();
        let remaining = entry.remaining_ttl_at(now);
        if entry.is_expired_at(now) || remaining.is_some_and(|ttl| ttl.is_zero()) {
            let _ = self.backend.delete(&full_key);
            self.counters.record_miss();
            return None;
        }

        if check_schema_version && self.config.check_schema_version && level.is_schema_scoped() {
            let current = self.schema_version.read().clone();
            if entry.schema_version.is_some() && entry.schema_version != current {
                debug!(
                    key = %key,
                    level = %level,
                    entry_version = ?entry.schema_version,
                    current_version = ?current,
                    "schema version mismatch, invalidating"
                );
                self.invalidate(key, level);
                self.counters.record_miss();
                return None;
            }
        }

        entry.hit_count += 1;
        if let Err(e) = self.write_entry(&entry, remaining) {
            debug!(key = %key, error = %e, "hit count write-back failed");
        }

        self.counters.record_hit(level);
        debug!(key = %key, level = %level, hits = entry.hit_count, "cache hit");
        Some(entry)
    }

    /// Fetch and deserialize the value for `key`
    pub fn get<T: DeserializeOwned>(
        &self,
        key: &str,
        level: CacheLevel,
        check_schema_version: bool,
    ) -> Option<T> {
        let entry = self.get_entry(key, level, check_schema_version)?;
        match serde_json::from_value(entry.value) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, level = %level, error = %e, "cache value has unexpected shape");
                None
            }
        }
    }

    /// Remove one entry
    pub fn invalidate(&self, key: &str, level: CacheLevel) -> bool {
        match self.backend.delete(&self.full_key(key, level)) {
            Ok(removed) => {
                if removed {
                    self.counters.record_evictions(1);
                }
                removed
            }
            Err(e) => {
                warn!(key = %key, level = %level, error = %e, "cache invalidate failed");
                false
            }
        }
    }

    /// Remove every entry at `level`
    pub fn invalidate_level(&self, level: CacheLevel) -> usize {
        match self.backend.delete_prefix(&self.level_prefix(level)) {
            Ok(count) => {
                self.counters.record_evictions(count);
                info!(level = %level, count, "cache level invalidated");
                count
            }
            Err(e) => {
                warn!(level = %level, error = %e, "cache level invalidation failed");
                0
            }
        }
    }

    /// Remove every entry at `level` whose key starts with `key_prefix`
    pub fn invalidate_prefix(&self, level: CacheLevel, key_prefix: &str) -> usize {
        let prefix = format!("{}{}", self.level_prefix(level), key_prefix);
        match self.backend.delete_prefix(&prefix) {
            Ok(count) => {
                self.counters.record_evictions(count);
                debug!(level = %level, prefix = %key_prefix, count, "cache prefix invalidated");
                count
            }
            Err(e) => {
                warn!(level = %level, prefix = %key_prefix, error = %e, "cache prefix invalidation failed");
                0
            }
        }
    }

    /// Remove every entry at the schema-scoped levels
    pub fn invalidate_schema_dependent(&self) -> usize {
        CacheLevel::SCHEMA_SCOPED
            .iter()
            .map(|level| self.invalidate_level(*level))
            .sum()
    }

    /// Remove every entry under the prefix
    pub fn clear(&self) -> usize {
        match self
            .backend
            .delete_prefix(&format!("{}:", self.config.prefix))
        {
            Ok(count) => {
                self.counters.record_evictions(count);
                info!(count, "cache cleared");
                count
            }
            Err(e) => {
                warn!(error = %e, "cache clear failed");
                0
            }
        }
    }

    /// Current schema version
    pub fn schema_version(&self) -> Option<String> {
        self.schema_version.read().clone()
    }

    /// Switch to `new_version`; schema-scoped levels are invalidated when a
    /// previous version existed. Returns whether the version changed.
    pub fn update_schema_version(&self, new_version: &str) -> bool {
        let old = {
            let mut current = self.schema_version.write();
            if current.as_deref() == Some(new_version) {
                return false;
            }
            current.replace(new_version.to_string())
        };

        if let Some(old) = old {
            let removed = self.invalidate_schema_dependent();
            info!(
                old_version = %old,
                new_version = %new_version,
                removed,
                "schema changed, schema-dependent cache invalidated"
            );
        }
        true
    }

    /// Snapshot of the metrics
    pub fn metrics(&self) -> CacheMetrics {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        };

        let hits_by_level = CacheLevel::ALL
            .iter()
            .map(|level| {
                (
                    level.to_string(),
                    self.counters.hits_by_level[level.index()].load(Ordering::Relaxed),
                )
            })
            .collect();

        let total_entries = self
            .backend
            .count_prefix(&format!("{}:", self.config.prefix))
            .unwrap_or(0);

        CacheMetrics {
            hits,
            misses,
            hit_rate,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            total_entries,
            hits_by_level,
            backend: self.backend.name().to_string(),
            redis_connected: self.backend.is_remote(),
            current_schema_version: self.schema_version(),
        }
    }

    /// Probe the backend
    pub fn health_check(&self) -> CacheHealth {
        let backend = self.backend.name().to_string();
        if !self.config.enabled {
            return CacheHealth {
                status: HealthStatus::Disabled,
                backend,
                latency_ms: None,
                message: Some("caching disabled by configuration".to_string()),
            };
        }

        match self.backend.ping() {
            Ok(latency) => {
                let latency_ms = Some(latency.as_secs_f64() * 1000.0);
                if self.degraded {
                    CacheHealth {
                        status: HealthStatus::Degraded,
                        backend,
                        latency_ms,
                        message: Some(
                            "remote store unreachable, serving from local cache".to_string(),
                        ),
                    }
                } else {
                    CacheHealth {
                        status: HealthStatus::Healthy,
                        backend,
                        latency_ms,
                        message: None,
                    }
                }
            }
            Err(e) => CacheHealth {
                status: HealthStatus::Unhealthy,
                backend,
                latency_ms: None,
                message: Some(e.to_string()),
            },
        }
    }

    // ── Convenience helpers ─────────────────────────────────────────────

    /// Cache a system prompt; system prompts are not schema-scoped
    pub fn cache_system_prompt(&self, key: &str, prompt: &str) -> bool {
        self.set(key, prompt, CacheLevel::System, None, None)
    }

    /// Fetch a cached system prompt
    pub fn get_system_prompt(&self, key: &str) -> Option<String> {
        self.get(key, CacheLevel::System, false)
    }

    /// Cache few-shot examples under the current schema version
    pub fn cache_examples<T: Serialize + ?Sized>(&self, key: &str, examples: &T) -> bool {
        self.set(key, examples, CacheLevel::Examples, None, None)
    }

    /// Fetch cached few-shot examples
    pub fn get_examples<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key, CacheLevel::Examples, true)
    }

    /// Cache a generated SQL payload keyed by question hash
    pub fn cache_sql<T: Serialize + ?Sized>(&self, question: &str, payload: &T) -> bool {
        self.set(&hash_key(question), payload, CacheLevel::Sql, None, None)
    }

    /// Fetch a generated SQL payload by question
    pub fn get_sql<T: DeserializeOwned>(&self, question: &str) -> Option<T> {
        self.get(&hash_key(question), CacheLevel::Sql, true)
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
