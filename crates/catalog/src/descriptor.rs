use std::fmt;

use foundation::AssetId;
use serde::{Deserialize, Serialize};

use crate::CatalogError;

/// Fallback tier an artifact was served from, highest fidelity first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceTier {
    Primary,
    CompressedVariant,
    CategoryPlaceholder,
    GenericPlaceholder,
}

impl SourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTier::Primary => "primary",
            SourceTier::CompressedVariant => "compressedVariant",
            SourceTier::CategoryPlaceholder => "categoryPlaceholder",
            SourceTier::GenericPlaceholder => "genericPlaceholder",
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(
            self,
            SourceTier::CategoryPlaceholder | SourceTier::GenericPlaceholder
        )
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload container recognised from a location's extension.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssetFormat {
    Glb,
    Png,
    Jpeg,
    Other,
}

impl AssetFormat {
    /// Checks the leading magic bytes. Empty payloads never pass.
    pub fn accepts(&self, payload: &[u8]) -> bool {
        if payload.is_empty() {
            return false;
        }
        match self {
            AssetFormat::Glb => payload.starts_with(b"glTF"),
            AssetFormat::Png => payload.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
            AssetFormat::Jpeg => payload.starts_with(&[0xFF, 0xD8, 0xFF]),
            AssetFormat::Other => true,
        }
    }
}

/// Where an artifact can be loaded from: a path relative to the asset root,
/// or an absolute `http(s)://` URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceLocation(String);

impl SourceLocation {
    pub fn new(location: impl Into<String>) -> Self {
        SourceLocation(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_remote(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }

    pub fn format(&self) -> AssetFormat {
        let path = self.0.split(['?', '#']).next().unwrap_or_default();
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "glb" => AssetFormat::Glb,
            "png" => AssetFormat::Png,
            "jpg" | "jpeg" => AssetFormat::Jpeg,
            _ => AssetFormat::Other,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceLocation {
    fn from(s: &str) -> Self {
        SourceLocation(s.to_string())
    }
}

impl From<String> for SourceLocation {
    fn from(s: String) -> Self {
        SourceLocation(s)
    }
}

/// BLAKE3 content digest, serialized as lowercase hex.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Checksum(blake3::Hash);

impl Checksum {
    pub fn of(bytes: &[u8]) -> Self {
        Checksum(blake3::hash(bytes))
    }

    pub fn from_hex(hex: &str) -> Result<Self, CatalogError> {
        blake3::Hash::from_hex(hex)
            .map(Checksum)
            .map_err(|e| CatalogError::Corrupt(format!("bad checksum {hex:?}: {e}")))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn matches(&self, bytes: &[u8]) -> bool {
        // blake3::Hash equality is constant-time.
        self.0 == blake3::hash(bytes)
    }
}

impl Serialize for Checksum {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Checksum::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// One candidate location for an asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSource {
    pub tier: SourceTier,
    pub location: SourceLocation,
    pub checksum: Option<Checksum>,
}

/// A requestable visual artifact.
///
/// `sources` is ordered by preference; earlier entries win. Placeholder tiers
/// are normally supplied by the shared [`crate::PlaceholderSet`], but a
/// descriptor may carry its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDescriptor {
    pub id: AssetId,
    pub category: String,
    pub sources: Vec<AssetSource>,
    pub expected_size_bytes: Option<u64>,
    /// Digest of the primary payload.
    pub checksum: Option<Checksum>,
}

impl AssetDescriptor {
    pub fn new(id: impl Into<AssetId>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            sources: Vec::new(),
            expected_size_bytes: None,
            checksum: None,
        }
    }

    /// Descriptor for an id the catalog has never heard of: no sources, no
    /// category, so resolution degrades straight to the generic placeholder.
    pub fn unknown(id: impl Into<AssetId>) -> Self {
        Self::new(id, "")
    }

    pub fn with_primary(mut self, location: impl Into<SourceLocation>) -> Self {
        self.sources.push(AssetSource {
            tier: SourceTier::Primary,
            location: location.into(),
            checksum: None,
        });
        self
    }

    pub fn with_compressed(mut self, location: impl Into<SourceLocation>) -> Self {
        self.sources.push(AssetSource {
            tier: SourceTier::CompressedVariant,
            location: location.into(),
            checksum: None,
        });
        self
    }

    pub fn with_source(mut self, source: AssetSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn with_expected_size(mut self, bytes: u64) -> Self {
        self.expected_size_bytes = Some(bytes);
        self
    }

    /// Sources of the given tier, in preference order.
    pub fn sources_for(&self, tier: SourceTier) -> impl Iterator<Item = &AssetSource> {
        self.sources.iter().filter(move |s| s.tier == tier)
    }

    /// Digest a payload from `source` must match, if any.
    pub fn expected_checksum(&self, source: &AssetSource) -> Option<Checksum> {
        match (source.checksum, source.tier) {
            (Some(c), _) => Some(c),
            (None, SourceTier::Primary) => self.checksum,
            (None, _) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AssetDescriptor, AssetFormat, Checksum, SourceLocation, SourceTier};

    #[test]
    fn format_is_sniffed_from_extension() {
        assert_eq!(SourceLocation::from("bodies/slim.GLB").format(), AssetFormat::Glb);
        assert_eq!(
            SourceLocation::from("https://cdn.example/p1.png?v=2").format(),
            AssetFormat::Png
        );
        assert_eq!(SourceLocation::from("thumb.jpeg").format(), AssetFormat::Jpeg);
        assert_eq!(SourceLocation::from("blob").format(), AssetFormat::Other);
    }

    #[test]
    fn magic_bytes_are_checked() {
        assert!(AssetFormat::Glb.accepts(b"glTF\x02\x00\x00\x00"));
        assert!(!AssetFormat::Glb.accepts(b"<html>"));
        assert!(!AssetFormat::Other.accepts(b""));
        assert!(AssetFormat::Other.accepts(b"x"));
    }

    #[test]
    fn primary_inherits_descriptor_checksum() {
        let digest = Checksum::of(b"payload");
        let d = AssetDescriptor::new("p1", "dress")
            .with_primary("p1.glb")
            .with_compressed("p1.min.glb")
            .with_checksum(digest);

        let primary = d.sources_for(SourceTier::Primary).next().unwrap();
        let compressed = d.sources_for(SourceTier::CompressedVariant).next().unwrap();
        assert_eq!(d.expected_checksum(primary), Some(digest));
        assert_eq!(d.expected_checksum(compressed), None);
    }

    #[test]
    fn checksum_hex_round_trip() {
        let digest = Checksum::of(b"abc");
        assert_eq!(Checksum::from_hex(&digest.to_hex()).unwrap(), digest);
        assert!(digest.matches(b"abc"));
        assert!(!digest.matches(b"abd"));
        assert!(Checksum::from_hex("zz").is_err());
    }
}
