//! Asset resolution: a bounded artifact cache, pluggable loaders, and the
//! fallback chain that always ends in something renderable.

pub mod cache;
pub mod error;
pub mod flight;
pub mod loader;
pub mod resolver;
pub mod retry;
pub mod store;

pub use cache::{Cache, CacheEntry, CacheError, CacheKey, CacheStats, MemoryBudget, Provenance};
pub use error::{FallbackReason, LoadError, ResolveError};
pub use flight::{FlightGuard, SingleFlight};
pub use loader::{AssetLoader, BoxFuture, FilesystemLoader, HttpLoader, MemoryLoader, SchemeLoader};
pub use resolver::{FallbackResolver, ResolutionResult, ResolverConfig, ResolverStats};
pub use retry::{RetryOutcome, RetryPolicy, run_with_retry};
pub use store::{CacheConfig, CacheStore};
