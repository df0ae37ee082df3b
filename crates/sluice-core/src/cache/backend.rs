//! Pluggable backing stores for [`CacheStore`](super::CacheStore)

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::Result;

/// Raw string key/value store with per-key expiry.
///
/// Implementations only move serialized envelopes around; hit counting,
/// schema checks and metrics live in the cache store.
pub trait CacheBackend: Send + Sync {
    /// Backend identifier reported in metrics
    fn name(&self) -> &'static str;

    /// Fetch a raw value
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a raw value, expiring after `ttl` when given
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key, returning whether it existed
    fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every key starting with `prefix`, returning the count
    fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Number of live keys starting with `prefix`
    fn count_prefix(&self, prefix: &str) -> Result<usize>;

    /// Round-trip latency probe
    fn ping(&self) -> Result<Duration>;

    /// Whether this backend talks to a remote service
    fn is_remote(&self) -> bool {
        false
    }
}

struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now <= at).unwrap_or(true)
    }
}

/// In-process map with the same TTL semantics as the remote store
#[derive(Default)]
pub struct MemoryBackend {
    data: RwLock<HashMap<String, Slot>>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired slot, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut data = self.data.write();
        let before = data.len();
        data.retain(|_, slot| slot.is_live(now));
        before - data.len()
    }
}

impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        {
            let data = self.data.read();
            match data.get(key) {
                Some(slot) if slot.is_live(now) => return Ok(Some(slot.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it under the write lock
        self.data.write().remove(key);
        Ok(None)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let slot = Slot {
            value: value.to_string(),
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.data.write().insert(key.to_string(), slot);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.data.write().remove(key).is_some())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut data = self.data.write();
        let before = data.len();
        data.retain(|k, _| !k.starts_with(prefix));
        Ok(before - data.len())
    }

    fn count_prefix(&self, prefix: &str) -> Result<usize> {
        let now = Instant::now();
        Ok(self
            .data
            .read()
            .iter()
            .filter(|(k, slot)| k.starts_with(prefix) && slot.is_live(now))
            .count())
    }

    fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        let _ = self.data.read().len();
        Ok(start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_set_get_delete() {
        let backend = MemoryBackend::new();
        backend.set("a:1", "one", None).unwrap();
        backend.set("a:2", "two", None).unwrap();
        backend.set("b:1", "three", None).unwrap();

        assert_eq!(backend.get("a:1").unwrap().as_deref(), Some("one"));
        assert!(backend.delete("a:1").unwrap());
        assert!(!backend.delete("a:1").unwrap());
        assert_eq!(backend.count_prefix("a:").unwrap(), 1);
        assert_eq!(backend.delete_prefix("a:").unwrap(), 1);
        assert_eq!(backend.count_prefix("b:").unwrap(), 1);
    }

    #[test]
    fn test_memory_expiry() {
        let backend = MemoryBackend::new();
        backend
            .set("k", "v", Some(Duration::from_millis(20)))
            .unwrap();
        assert!(backend.get("k").unwrap().is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(backend.get("k").unwrap().is_none());
        assert_eq!(backend.count_prefix("").unwrap(), 0);
    }

    #[test]
    fn test_purge_expired() {
        let backend = MemoryBackend::new();
        backend.set("x", "1", Some(Duration::from_millis(1))).unwrap();
        backend.set("y", "2", None).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(backend.purge_expired(), 1);
        assert!(backend.get("y").unwrap().is_some());
    }
}
