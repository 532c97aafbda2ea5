use assets::{FallbackReason, ResolutionResult};
use bytes::Bytes;
use catalog::SourceTier;
use foundation::{AssetId, JobId};
use serde::Serialize;

/// Which tier produced one of a job's assets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetProvenance {
    pub asset_id: AssetId,
    pub source_used: SourceTier,
    pub from_cache: bool,
    pub fallback_reason: Option<FallbackReason>,
    pub size_bytes: usize,
}

impl From<&ResolutionResult> for AssetProvenance {
    fn from(r: &ResolutionResult) -> Self {
        Self {
            asset_id: r.asset_id.clone(),
            source_used: r.source_used,
            from_cache: r.from_cache,
            fallback_reason: r.fallback_reason,
            size_bytes: r.payload.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderMetadata {
    pub avatar_id: String,
    pub is_batch: bool,
    /// Avatar first, then products in request order.
    pub assets: Vec<AssetProvenance>,
    /// Any asset came from below the primary tier.
    pub degraded: bool,
    pub render_time_seconds: f64,
}

/// A finished job's artifact. Batch jobs carry one frame per product,
/// everything else exactly one.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderResult {
    pub job_id: JobId,
    pub frames: Vec<Bytes>,
    pub metadata: RenderMetadata,
}

impl RenderResult {
    pub fn size_bytes(&self) -> u64 {
        self.frames.iter().map(|f| f.len() as u64).sum()
    }

    /// The first frame; the whole result for non-batch jobs.
    pub fn payload(&self) -> &Bytes {
        static EMPTY: Bytes = Bytes::new();
        self.frames.first().unwrap_or(&EMPTY)
    }
}
