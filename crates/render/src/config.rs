use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderConfig {
    /// Jobs rendering at once; also the worker pool size.
    pub workers: usize,
    /// Jobs waiting for a worker before `submit` starts rejecting.
    pub max_pending: usize,
    pub job_timeout: Duration,
    pub base_estimate: Duration,
    pub per_asset_estimate: Duration,
    /// How long finished jobs stay queryable.
    pub retention: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_pending: 1024,
            job_timeout: Duration::from_secs(120),
            base_estimate: Duration::from_secs(5),
            per_asset_estimate: Duration::from_secs(2),
            retention: Duration::from_secs(60 * 60),
        }
    }
}

impl RenderConfig {
    /// Heuristic hint only: base cost plus a fixed cost per asset.
    pub fn estimate(&self, asset_count: usize) -> Duration {
        let n = u32::try_from(asset_count).unwrap_or(u32::MAX);
        self.base_estimate
            .saturating_add(self.per_asset_estimate.saturating_mul(n))
    }
}
