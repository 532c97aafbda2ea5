//! Render job orchestration: admission, the worker pool, and delivery of
//! results with per-asset provenance.

pub mod compositor;
pub mod config;
pub mod context;
pub mod error;
pub mod queue;
pub mod result;

pub use compositor::{CompositeRequest, Compositor, CompositorError, ManifestCompositor};
pub use config::RenderConfig;
pub use context::{ServiceContext, ServiceContextBuilder};
pub use error::RenderError;
pub use queue::{RenderQueue, SubmitReceipt};
pub use result::{AssetProvenance, RenderMetadata, RenderResult};
