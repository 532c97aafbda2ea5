//! The compositing seam.
//!
//! Actual rendering happens elsewhere; this crate only schedules it. The
//! built-in [`ManifestCompositor`] emits a JSON description of the layers it
//! was handed, which is enough for clients that composite on their side.

use assets::{BoxFuture, FallbackReason, ResolutionResult};
use bytes::Bytes;
use catalog::{Checksum, SourceTier};
use foundation::AssetId;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CompositorError(pub String);

/// Everything one composite is built from.
#[derive(Debug, Clone, Copy)]
pub struct CompositeRequest<'a> {
    pub avatar: &'a ResolutionResult,
    pub garments: &'a [ResolutionResult],
}

pub trait Compositor: Send + Sync {
    fn compose<'a>(&'a self, request: CompositeRequest<'a>) -> BoxFuture<'a, Result<Bytes, CompositorError>>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct LayerManifest<'a> {
    asset_id: &'a AssetId,
    source_used: SourceTier,
    fallback_reason: Option<FallbackReason>,
    size_bytes: usize,
    blake3: String,
}

impl<'a> From<&'a ResolutionResult> for LayerManifest<'a> {
    fn from(r: &'a ResolutionResult) -> Self {
        Self {
            asset_id: &r.asset_id,
            source_used: r.source_used,
            fallback_reason: r.fallback_reason,
            size_bytes: r.payload.len(),
            blake3: Checksum::of(&r.payload).to_hex(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompositeManifest<'a> {
    avatar: LayerManifest<'a>,
    layers: Vec<LayerManifest<'a>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestCompositor;

impl Compositor for ManifestCompositor {
    fn compose<'a>(&'a self, request: CompositeRequest<'a>) -> BoxFuture<'a, Result<Bytes, CompositorError>> {
        Box::pin(async move {
            let manifest = CompositeManifest {
                avatar: request.avatar.into(),
                layers: request.garments.iter().map(LayerManifest::from).collect(),
            };
            serde_json::to_vec(&manifest)
                .map(Bytes::from)
                .map_err(|e| CompositorError(e.to_string()))
        })
    }
}
