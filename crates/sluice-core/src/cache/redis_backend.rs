//! Redis-compatible remote backend
//!
//! Uses a single synchronous connection behind a mutex. Atomicity per key
//! is delegated to the server (`SETEX`, `DEL`).

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use super::backend::CacheBackend;
use crate::error::{Result, SluiceError};

/// Remote cache backend speaking the Redis protocol
pub struct RedisBackend {
    url: String,
    conn: Mutex<redis::Connection>,
}

impl RedisBackend {
    /// Connect and verify the server answers `PING`
    pub fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| SluiceError::Cache(format!("invalid redis url {}: {}", url, e)))?;
        let mut conn = client
            .get_connection_with_timeout(timeout)
            .map_err(|e| SluiceError::Cache(format!("connect to {} failed: {}", url, e)))?;
        conn.set_read_timeout(Some(timeout)).map_err(cache_err)?;
        conn.set_write_timeout(Some(timeout)).map_err(cache_err)?;

        let _: String = redis::cmd("PING").query(&mut conn).map_err(cache_err)?;

        Ok(Self {
            url: url.to_string(),
            conn: Mutex::new(conn),
        })
    }

    /// Server URL this backend is connected to
    pub fn url(&self) -> &str {
        &self.url
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.lock();
        redis::cmd("KEYS")
            .arg(format!("{}*", prefix))
            .query(&mut *conn)
            .map_err(cache_err)
    }
}

fn cache_err(err: redis::RedisError) -> SluiceError {
    SluiceError::Cache(err.to_string())
}

impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock();
        redis::cmd("GET")
            .arg(key)
            .query(&mut *conn)
            .map_err(cache_err)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.lock();
        match ttl {
            Some(ttl) => redis::cmd("SETEX")
                .arg(key)
                .arg(ttl.as_secs().max(1))
                .arg(value)
                .query(&mut *conn)
                .map_err(cache_err),
            None => redis::cmd("SET")
                .arg(key)
                .arg(value)
                .query(&mut *conn)
                .map_err(cache_err),
        }
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query(&mut *conn)
            .map_err(cache_err)?;
        Ok(removed > 0)
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.keys(prefix)?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let removed: i64 = redis::cmd("DEL")
            .arg(&keys)
            .query(&mut *conn)
            .map_err(cache_err)?;
        Ok(removed.max(0) as usize)
    }

    fn count_prefix(&self, prefix: &str) -> Result<usize> {
        Ok(self.keys(prefix)?.len())
    }

    fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        let mut conn = self.conn.lock();
        let _: String = redis::cmd("PING").query(&mut *conn).map_err(cache_err)?;
        Ok(start.elapsed())
    }

    fn is_remote(&self) -> bool {
        true
    }
}
