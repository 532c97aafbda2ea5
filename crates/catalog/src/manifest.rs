use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::descriptor::{AssetDescriptor, AssetSource, Checksum, SourceLocation, SourceTier};
use crate::{CatalogError, PlaceholderSet};

pub const MANIFEST_VERSION: &str = "1.0";

/// On-disk catalog: asset descriptors plus the placeholder table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogManifest {
    pub version: String,
    #[serde(default)]
    pub assets: Vec<ManifestAsset>,
    /// Category -> placeholder location.
    #[serde(default)]
    pub placeholders: BTreeMap<String, SourceLocation>,
    pub generic: SourceLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestAsset {
    pub id: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<SourceLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed: Option<SourceLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_checksum: Option<Checksum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size_bytes: Option<u64>,
}

impl CatalogManifest {
    pub fn new(generic: impl Into<SourceLocation>) -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            assets: Vec::new(),
            placeholders: BTreeMap::new(),
            generic: generic.into(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let manifest: CatalogManifest =
            serde_json::from_str(json).map_err(|e| CatalogError::Corrupt(e.to_string()))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(CatalogError::UnsupportedVersion(manifest.version));
        }
        Ok(manifest)
    }

    pub fn placeholder_set(&self) -> PlaceholderSet {
        let mut set = PlaceholderSet::new(self.generic.clone());
        for (category, location) in &self.placeholders {
            set = set.with_category(category.clone(), location.clone());
        }
        set
    }

    pub fn descriptors(&self) -> Result<Vec<AssetDescriptor>, CatalogError> {
        let mut out = Vec::with_capacity(self.assets.len());
        for asset in &self.assets {
            if asset.id.is_empty() {
                return Err(CatalogError::Corrupt("asset with empty id".to_string()));
            }
            let mut d = AssetDescriptor::new(asset.id.as_str(), asset.category.clone());
            if let Some(primary) = &asset.primary {
                d = d.with_primary(primary.clone());
            }
            if let Some(compressed) = &asset.compressed {
                d = d.with_source(AssetSource {
                    tier: SourceTier::CompressedVariant,
                    location: compressed.clone(),
                    checksum: asset.compressed_checksum,
                });
            }
            d.checksum = asset.checksum;
            d.expected_size_bytes = asset.expected_size_bytes;
            out.push(d);
        }
        Ok(out)
    }
}
