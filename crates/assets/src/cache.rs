use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use catalog::{Checksum, SourceLocation, SourceTier};
use foundation::{AssetId, Timestamp};
use tracing::{debug, warn};

use crate::error::FallbackReason;

/// Cached artifacts are keyed either by the asset they were resolved for, or
/// (for placeholders shared across assets) by their own location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheKey {
    Asset(AssetId),
    Placeholder(SourceLocation),
}

impl CacheKey {
    pub fn asset(id: impl Into<AssetId>) -> Self {
        CacheKey::Asset(id.into())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Asset(id) => write!(f, "asset:{id}"),
            CacheKey::Placeholder(loc) => write!(f, "placeholder:{loc}"),
        }
    }
}

/// Which tier produced a cached artifact, and why the tiers above it were
/// skipped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub tier: SourceTier,
    pub fallback_reason: Option<FallbackReason>,
}

impl From<SourceTier> for Provenance {
    fn from(tier: SourceTier) -> Self {
        Provenance {
            tier,
            fallback_reason: None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryBudget {
    pub max_bytes: usize,
}

impl MemoryBudget {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

/// A resident artifact. `size_bytes` always equals `payload.len()`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    payload: Bytes,
    digest: Checksum,
    provenance: Provenance,
    inserted_at: Timestamp,
    expires_at: Timestamp,
    last_accessed_at: Timestamp,
    last_used_tick: u64,
}

impl CacheEntry {
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }

    pub fn tier(&self) -> SourceTier {
        self.provenance.tier
    }

    pub fn fallback_reason(&self) -> Option<FallbackReason> {
        self.provenance.fallback_reason
    }

    pub fn inserted_at(&self) -> Timestamp {
        self.inserted_at
    }

    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    pub fn last_accessed_at(&self) -> Timestamp {
        self.last_accessed_at
    }

    pub fn is_valid_at(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_size_bytes: usize,
    pub valid_entries: usize,
    pub max_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("payload too large for cache budget: requested={requested} max={max}")]
    BudgetExceeded { requested: usize, max: usize },
}

/// Deterministic in-memory artifact cache with a byte budget and TTLs.
///
/// Time is always passed in by the caller; the cache never reads a clock.
///
/// Notes on determinism:
/// - Entries are keyed in a `BTreeMap` for stable traversal order.
/// - Overflow eviction drops expired entries first, then the least recently
///   accessed ones by `(last_accessed_at, access tick, key)`.
#[derive(Debug)]
pub struct Cache {
    budget: MemoryBudget,
    used_bytes: usize,
    tick: u64,
    entries: BTreeMap<CacheKey, CacheEntry>,
}

impl Cache {
    pub fn new(budget: MemoryBudget) -> Self {
        Self {
            budget,
            used_bytes: 0,
            tick: 0,
            entries: BTreeMap::new(),
        }
    }

    pub fn budget(&self) -> MemoryBudget {
        self.budget
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks at an entry without counting it as an access.
    pub fn peek(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Returns a valid entry and marks it as accessed.
    ///
    /// Expired entries and entries whose payload no longer matches the digest
    /// taken at insertion are purged and reported as a miss.
    pub fn get(&mut self, key: &CacheKey, now: Timestamp) -> Option<CacheEntry> {
        let entry = self.entries.get(key)?;
        if !entry.is_valid_at(now) {
            debug!("cache entry expired: {key}");
            self.remove(key);
            return None;
        }
        if !entry.digest.matches(&entry.payload) {
            warn!("cache entry failed integrity check, evicting: {key}");
            self.remove(key);
            return None;
        }

        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key)?;
        entry.last_accessed_at = now;
        entry.last_used_tick = tick;
        Some(entry.clone())
    }

    /// Inserts or replaces an entry, then evicts until back under budget.
    ///
    /// Returns the keys evicted to make room. A replaced entry gets fresh
    /// timestamps.
    pub fn put(
        &mut self,
        key: CacheKey,
        payload: Bytes,
        provenance: impl Into<Provenance>,
        ttl: Duration,
        now: Timestamp,
    ) -> Result<Vec<CacheKey>, CacheError> {
        if payload.len() > self.budget.max_bytes {
            return Err(CacheError::BudgetExceeded {
                requested: payload.len(),
                max: self.budget.max_bytes,
            });
        }

        self.remove(&key);
        self.tick += 1;
        self.used_bytes += payload.len();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                digest: Checksum::of(&payload),
                payload,
                provenance: provenance.into(),
                inserted_at: now,
                expires_at: now.saturating_add(ttl),
                last_accessed_at: now,
                last_used_tick: self.tick,
            },
        );

        Ok(self.evict_as_needed(now, Some(&key)))
    }

    pub fn remove(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.used_bytes = self.used_bytes.saturating_sub(entry.size_bytes());
                true
            }
            None => false,
        }
    }

    /// Drops every entry with `expires_at <= now`.
    pub fn evict_expired(&mut self, now: Timestamp) -> Vec<CacheKey> {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.is_valid_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired
    }

    /// Changes the byte budget, evicting as needed to honour it.
    pub fn set_budget(&mut self, budget: MemoryBudget, now: Timestamp) -> Vec<CacheKey> {
        self.budget = budget;
        self.evict_as_needed(now, None)
    }

    pub fn stats(&self, now: Timestamp) -> CacheStats {
        CacheStats {
            entry_count: self.entries.len(),
            total_size_bytes: self.used_bytes,
            valid_entries: self.entries.values().filter(|e| e.is_valid_at(now)).count(),
            max_bytes: self.budget.max_bytes,
        }
    }

    fn evict_as_needed(&mut self, now: Timestamp, protected: Option<&CacheKey>) -> Vec<CacheKey> {
        if self.used_bytes <= self.budget.max_bytes {
            return Vec::new();
        }

        let mut evicted = self.evict_expired(now);
        while self.used_bytes > self.budget.max_bytes {
            let pick = |exclude: Option<&CacheKey>| {
                self.entries
                    .iter()
                    .filter(|(k, _)| exclude.map(|p| p != *k).unwrap_or(true))
                    .min_by(|(ka, ea), (kb, eb)| {
                        ea.last_accessed_at
                            .cmp(&eb.last_accessed_at)
                            .then_with(|| ea.last_used_tick.cmp(&eb.last_used_tick))
                            .then_with(|| ka.cmp(kb))
                    })
                    .map(|(k, _)| k.clone())
            };

            // Prefer keeping the entry that was just inserted.
            let Some(key) = pick(protected).or_else(|| pick(None)) else {
                break;
            };
            self.remove(&key);
            evicted.push(key);
        }

        if !evicted.is_empty() {
            debug!(
                "cache evicted {} entries, used={} max={}",
                evicted.len(),
                self.used_bytes,
                self.budget.max_bytes
            );
        }
        evicted
    }

    #[cfg(test)]
    pub(crate) fn corrupt_for_test(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            let mut bytes = entry.payload.to_vec();
            bytes[0] ^= 0xFF;
            entry.payload = Bytes::from(bytes);
        }
    }
}
