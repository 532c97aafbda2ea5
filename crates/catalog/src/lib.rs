pub mod descriptor;
pub mod manifest;

use std::collections::HashMap;
use std::sync::Arc;

use foundation::AssetId;
use parking_lot::RwLock;

pub use descriptor::*;
pub use manifest::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog corrupt: {0}")]
    Corrupt(String),
    #[error("unsupported catalog version {0:?}")]
    UnsupportedVersion(String),
}

/// Read-only lookup of asset descriptors, owned by the product catalog.
pub trait AssetCatalog: Send + Sync {
    fn descriptor(&self, id: &AssetId) -> Option<Arc<AssetDescriptor>>;
}

/// Placeholder table: one artifact per category plus a single generic one
/// shared across all requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderSet {
    by_category: HashMap<String, SourceLocation>,
    generic: SourceLocation,
}

impl PlaceholderSet {
    pub fn new(generic: impl Into<SourceLocation>) -> Self {
        Self {
            by_category: HashMap::new(),
            generic: generic.into(),
        }
    }

    pub fn with_category(
        mut self,
        category: impl Into<String>,
        location: impl Into<SourceLocation>,
    ) -> Self {
        self.by_category.insert(category.into(), location.into());
        self
    }

    pub fn for_category(&self, category: &str) -> Option<&SourceLocation> {
        self.by_category.get(category)
    }

    pub fn generic(&self) -> &SourceLocation {
        &self.generic
    }

    pub fn categories(&self) -> usize {
        self.by_category.len()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entries: RwLock<HashMap<AssetId, Arc<AssetDescriptor>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_manifest(manifest: &CatalogManifest) -> Result<Self, CatalogError> {
        let catalog = Self::new();
        for descriptor in manifest.descriptors()? {
            catalog.insert(descriptor);
        }
        Ok(catalog)
    }

    pub fn from_manifest_json(json: &str) -> Result<Self, CatalogError> {
        Self::from_manifest(&CatalogManifest::from_json(json)?)
    }

    /// Replaces any descriptor with the same id.
    pub fn insert(&self, descriptor: AssetDescriptor) {
        self.entries
            .write()
            .insert(descriptor.id.clone(), Arc::new(descriptor));
    }

    pub fn remove(&self, id: &AssetId) -> bool {
        self.entries.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl AssetCatalog for InMemoryCatalog {
    fn descriptor(&self, id: &AssetId) -> Option<Arc<AssetDescriptor>> {
        self.entries.read().get(id).cloned()
    }
}
