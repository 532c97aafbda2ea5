use std::sync::Arc;

use assets::{
    AssetLoader, CacheConfig, CacheStore, FallbackResolver, MemoryLoader, ResolverConfig,
};
use catalog::{AssetCatalog, InMemoryCatalog, PlaceholderSet};
use foundation::{Clock, SystemClock};

use crate::compositor::{Compositor, ManifestCompositor};
use crate::config::RenderConfig;
use crate::queue::RenderQueue;

/// Every long-lived service, built once and passed to handlers and workers.
#[derive(Clone)]
pub struct ServiceContext {
    pub clock: Arc<dyn Clock>,
    pub catalog: Arc<dyn AssetCatalog>,
    pub cache: Arc<CacheStore>,
    pub resolver: Arc<FallbackResolver>,
    pub queue: Arc<RenderQueue>,
}

impl ServiceContext {
    pub fn builder() -> ServiceContextBuilder {
        ServiceContextBuilder::default()
    }
}

/// Defaults: system clock, empty catalog, in-memory loader, manifest
/// compositor and the default configs.
pub struct ServiceContextBuilder {
    clock: Arc<dyn Clock>,
    catalog: Arc<dyn AssetCatalog>,
    loader: Arc<dyn AssetLoader>,
    compositor: Arc<dyn Compositor>,
    placeholders: PlaceholderSet,
    cache: CacheConfig,
    resolver: ResolverConfig,
    render: RenderConfig,
}

impl Default for ServiceContextBuilder {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            catalog: Arc::new(InMemoryCatalog::new()),
            loader: Arc::new(MemoryLoader::new()),
            compositor: Arc::new(ManifestCompositor),
            placeholders: PlaceholderSet::new("placeholders/generic.png"),
            cache: CacheConfig::default(),
            resolver: ResolverConfig::default(),
            render: RenderConfig::default(),
        }
    }
}

impl ServiceContextBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn AssetCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn loader(mut self, loader: Arc<dyn AssetLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn compositor(mut self, compositor: Arc<dyn Compositor>) -> Self {
        self.compositor = compositor;
        self
    }

    pub fn placeholders(mut self, placeholders: PlaceholderSet) -> Self {
        self.placeholders = placeholders;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    pub fn resolver_config(mut self, config: ResolverConfig) -> Self {
        self.resolver = config;
        self
    }

    pub fn render_config(mut self, config: RenderConfig) -> Self {
        self.render = config;
        self
    }

    /// Starts the worker pool, so this must run inside a tokio runtime.
    pub fn build(self) -> ServiceContext {
        let cache = Arc::new(CacheStore::new(self.cache, self.clock.clone()));
        let resolver = Arc::new(FallbackResolver::new(
            cache.clone(),
            self.loader,
            self.catalog.clone(),
            self.placeholders,
            self.resolver,
        ));
        let queue = Arc::new(RenderQueue::start(
            self.render,
            self.clock.clone(),
            resolver.clone(),
            self.compositor,
        ));
        ServiceContext {
            clock: self.clock,
            catalog: self.catalog,
            cache,
            resolver,
            queue,
        }
    }
}
