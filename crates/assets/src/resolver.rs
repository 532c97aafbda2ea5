use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use catalog::{AssetCatalog, AssetDescriptor, Checksum, PlaceholderSet, SourceLocation, SourceTier};
use foundation::{AssetId, CancelFlag};
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{CacheKey, Provenance};
use crate::error::{FallbackReason, LoadError, ResolveError};
use crate::flight::SingleFlight;
use crate::loader::AssetLoader;
use crate::retry::{RetryOutcome, RetryPolicy, run_with_retry};
use crate::store::CacheStore;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolverConfig {
    pub retry: RetryPolicy,
    pub attempt_timeout: Duration,
    pub max_asset_bytes: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(10),
            max_asset_bytes: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// An artifact delivered for a request, with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionResult {
    pub asset_id: AssetId,
    pub source_used: SourceTier,
    pub payload: Bytes,
    pub from_cache: bool,
    /// Last downgrade reason before the tier that succeeded, if any.
    pub fallback_reason: Option<FallbackReason>,
}

impl ResolutionResult {
    pub fn is_degraded(&self) -> bool {
        self.source_used != SourceTier::Primary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverStats {
    pub hits: u64,
    pub misses: u64,
    pub retries: u64,
    pub served_primary: u64,
    pub served_compressed: u64,
    pub served_category_placeholder: u64,
    pub served_generic_placeholder: u64,
    pub terminal_failures: u64,
}

#[derive(Default)]
struct ResolverCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    retries: AtomicU64,
    served: [AtomicU64; 4],
    terminal_failures: AtomicU64,
}

impl ResolverCounters {
    fn served(&self, tier: SourceTier) {
        let idx = match tier {
            SourceTier::Primary => 0,
            SourceTier::CompressedVariant => 1,
            SourceTier::CategoryPlaceholder => 2,
            SourceTier::GenericPlaceholder => 3,
        };
        self.served[idx].fetch_add(1, Ordering::Relaxed);
    }
}

/// How a single tier attempt ended when it did not produce bytes.
enum TierFailure {
    Reason(FallbackReason),
    Cancelled,
}

/// Resolves asset requests through cache, primary, compressed variant,
/// category placeholder and finally the generic placeholder.
pub struct FallbackResolver {
    cache: Arc<CacheStore>,
    loader: Arc<dyn AssetLoader>,
    catalog: Arc<dyn AssetCatalog>,
    placeholders: PlaceholderSet,
    config: ResolverConfig,
    flights: SingleFlight<AssetId>,
    counters: ResolverCounters,
}

impl FallbackResolver {
    pub fn new(
        cache: Arc<CacheStore>,
        loader: Arc<dyn AssetLoader>,
        catalog: Arc<dyn AssetCatalog>,
        placeholders: PlaceholderSet,
        config: ResolverConfig,
    ) -> Self {
        Self {
            cache,
            loader,
            catalog,
            placeholders,
            config,
            flights: SingleFlight::new(),
            counters: ResolverCounters::default(),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn stats(&self) -> ResolverStats {
        let c = &self.counters;
        ResolverStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            served_primary: c.served[0].load(Ordering::Relaxed),
            served_compressed: c.served[1].load(Ordering::Relaxed),
            served_category_placeholder: c.served[2].load(Ordering::Relaxed),
            served_generic_placeholder: c.served[3].load(Ordering::Relaxed),
            terminal_failures: c.terminal_failures.load(Ordering::Relaxed),
        }
    }

    /// Looks the id up in the catalog first. Unknown ids still resolve, to
    /// the generic placeholder.
    pub async fn resolve_id(
        &self,
        id: &AssetId,
        cancel: &CancelFlag,
    ) -> Result<ResolutionResult, ResolveError> {
        let descriptor = self
            .catalog
            .descriptor(id)
            .unwrap_or_else(|| Arc::new(AssetDescriptor::unknown(id.clone())));
        self.resolve(&descriptor, cancel).await
    }

    pub async fn resolve(
        &self,
        descriptor: &AssetDescriptor,
        cancel: &CancelFlag,
    ) -> Result<ResolutionResult, ResolveError> {
        let id = &descriptor.id;
        let key = CacheKey::Asset(id.clone());

        if let Some(hit) = self.cached(&key, id) {
            return Ok(hit);
        }

        let _flight = self.flights.acquire(id).await;
        // Whoever held the flight before us may have filled the cache.
        if let Some(hit) = self.cached(&key, id) {
            return Ok(hit);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let mut reason: Option<FallbackReason> = None;

        for tier in [SourceTier::Primary, SourceTier::CompressedVariant] {
            // The declared size describes the primary artifact only.
            let expected_size = descriptor
                .expected_size_bytes
                .filter(|_| tier == SourceTier::Primary);
            for source in descriptor.sources_for(tier) {
                let checksum = descriptor.expected_checksum(source);
                match self
                    .load_source(&source.location, checksum, expected_size, cancel)
                    .await
                {
                    Ok(payload) => {
                        self.store(key.clone(), payload.clone(), tier, reason);
                        return Ok(self.finish(id, tier, payload, false, reason));
                    }
                    Err(TierFailure::Cancelled) => return Err(ResolveError::Cancelled(id.clone())),
                    Err(TierFailure::Reason(r)) => {
                        warn!("asset {id}: {tier} source {} failed ({r}), falling back", source.location);
                        reason = Some(r);
                    }
                }
            }
        }
        if reason.is_none() {
            // Nothing to try above the placeholders.
            reason = Some(FallbackReason::FileNotFound);
        }

        let category_location = descriptor
            .sources_for(SourceTier::CategoryPlaceholder)
            .next()
            .map(|s| s.location.clone())
            .or_else(|| self.placeholders.for_category(&descriptor.category).cloned());
        match category_location {
            Some(location) => match self
                .load_placeholder(&location, SourceTier::CategoryPlaceholder, cancel)
                .await
            {
                Ok((payload, from_cache)) => {
                    let tier = SourceTier::CategoryPlaceholder;
                    self.store(key, payload.clone(), tier, reason);
                    return Ok(self.finish(id, tier, payload, from_cache, reason));
                }
                Err(TierFailure::Cancelled) => return Err(ResolveError::Cancelled(id.clone())),
                Err(TierFailure::Reason(r)) => {
                    warn!("asset {id}: category placeholder {location} failed ({r})");
                    reason = Some(r);
                }
            },
            // Uncategorised (including unknown) assets have no category
            // placeholder to miss; keep the reason from the tiers above.
            None if descriptor.category.is_empty() => {}
            None => {
                debug!("asset {id}: no placeholder for category {:?}", descriptor.category);
                reason = Some(FallbackReason::FallbackFailed);
            }
        }

        let generic = self.placeholders.generic().clone();
        match self
            .load_placeholder(&generic, SourceTier::GenericPlaceholder, cancel)
            .await
        {
            Ok((payload, from_cache)) => {
                let tier = SourceTier::GenericPlaceholder;
                self.store(key, payload.clone(), tier, reason);
                Ok(self.finish(id, tier, payload, from_cache, reason))
            }
            Err(TierFailure::Cancelled) => Err(ResolveError::Cancelled(id.clone())),
            Err(TierFailure::Reason(r)) => {
                self.counters.terminal_failures.fetch_add(1, Ordering::Relaxed);
                warn!("asset {id}: generic placeholder {generic} failed ({r}), giving up");
                Err(ResolveError::PlaceholderUnavailable {
                    asset_id: id.clone(),
                    last: r,
                })
            }
        }
    }

    fn cached(&self, key: &CacheKey, id: &AssetId) -> Option<ResolutionResult> {
        let entry = self.cache.get(key)?;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        debug!("asset {id}: cache hit ({})", entry.tier());
        Some(self.finish(
            id,
            entry.tier(),
            entry.payload().clone(),
            true,
            entry.fallback_reason(),
        ))
    }

    fn finish(
        &self,
        id: &AssetId,
        tier: SourceTier,
        payload: Bytes,
        from_cache: bool,
        fallback_reason: Option<FallbackReason>,
    ) -> ResolutionResult {
        self.counters.served(tier);
        ResolutionResult {
            asset_id: id.clone(),
            source_used: tier,
            payload,
            from_cache,
            fallback_reason,
        }
    }

    fn store(
        &self,
        key: CacheKey,
        payload: Bytes,
        tier: SourceTier,
        fallback_reason: Option<FallbackReason>,
    ) {
        let ttl = self.cache.config().default_ttl;
        let provenance = Provenance {
            tier,
            fallback_reason,
        };
        if let Err(e) = self.cache.put(key.clone(), payload, provenance, ttl) {
            debug!("not caching {key}: {e}");
        }
    }

    async fn load_placeholder(
        &self,
        location: &SourceLocation,
        tier: SourceTier,
        cancel: &CancelFlag,
    ) -> Result<(Bytes, bool), TierFailure> {
        let key = CacheKey::Placeholder(location.clone());
        if let Some(entry) = self.cache.get(&key) {
            return Ok((entry.payload().clone(), true));
        }

        let payload = self.load_source(location, None, None, cancel).await?;
        let ttl = self.cache.config().placeholder_ttl;
        if let Err(e) = self
            .cache
            .put(key.clone(), payload.clone(), tier, ttl)
        {
            debug!("not caching {key}: {e}");
        }
        Ok((payload, false))
    }

    async fn load_source(
        &self,
        location: &SourceLocation,
        checksum: Option<Checksum>,
        expected_size: Option<u64>,
        cancel: &CancelFlag,
    ) -> Result<Bytes, TierFailure> {
        let max = self.config.max_asset_bytes;
        if let Some(size) = expected_size
            && size > max
        {
            return Err(TierFailure::Reason(FallbackReason::FileTooLarge));
        }

        let outcome = run_with_retry(&self.config.retry, self.config.attempt_timeout, cancel, |_| {
            self.attempt(location, checksum)
        })
        .await;

        let retries = outcome.attempts().saturating_sub(1);
        if retries > 0 {
            self.counters.retries.fetch_add(u64::from(retries), Ordering::Relaxed);
        }

        match outcome {
            RetryOutcome::Success { value, .. } => Ok(value),
            RetryOutcome::Terminal { error, .. } => {
                Err(TierFailure::Reason(error.fallback_reason()))
            }
            RetryOutcome::Exhausted { last, attempts } => {
                debug!("{location}: giving up after {attempts} attempts ({last})");
                Err(TierFailure::Reason(FallbackReason::MaxRetriesExceeded))
            }
            RetryOutcome::Cancelled { .. } => Err(TierFailure::Cancelled),
        }
    }

    /// One load plus validation. Validation failures are terminal.
    async fn attempt(
        &self,
        location: &SourceLocation,
        checksum: Option<Checksum>,
    ) -> Result<Bytes, LoadError> {
        let payload = self.loader.load(location).await?;

        let size = payload.len() as u64;
        if size > self.config.max_asset_bytes {
            return Err(LoadError::TooLarge {
                size,
                max: self.config.max_asset_bytes,
            });
        }
        if !location.format().accepts(&payload) {
            return Err(LoadError::InvalidFormat(format!(
                "{location}: payload does not look like {:?}",
                location.format()
            )));
        }
        if let Some(expected) = checksum
            && !expected.matches(&payload)
        {
            return Err(LoadError::ChecksumMismatch(location.to_string()));
        }
        Ok(payload)
    }
}
