use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use foundation::Clock;
use parking_lot::Mutex;

use crate::cache::{Cache, CacheEntry, CacheError, CacheKey, CacheStats, MemoryBudget, Provenance};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_bytes: usize,
    pub default_ttl: Duration,
    /// Placeholders rarely change, so they live longer.
    pub placeholder_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024, // 256 MB
            default_ttl: Duration::from_secs(60 * 60),
            placeholder_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Thread-safe cache shared by every worker.
///
/// A single coarse lock guards the [`Cache`]; every operation is short and
/// never awaits while holding it.
pub struct CacheStore {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Cache>,
}

impl CacheStore {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let inner = Mutex::new(Cache::new(MemoryBudget::new(config.max_bytes)));
        Self {
            config,
            clock,
            inner,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.clock.now();
        self.inner.lock().get(key, now)
    }

    pub fn put(
        &self,
        key: CacheKey,
        payload: Bytes,
        provenance: impl Into<Provenance>,
        ttl: Duration,
    ) -> Result<Vec<CacheKey>, CacheError> {
        let now = self.clock.now();
        self.inner.lock().put(key, payload, provenance, ttl, now)
    }

    pub fn evict_expired(&self) -> Vec<CacheKey> {
        let now = self.clock.now();
        self.inner.lock().evict_expired(now)
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        self.inner.lock().stats(now)
    }
}
