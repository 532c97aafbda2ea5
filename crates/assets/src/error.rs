use std::fmt;
use std::time::Duration;

use foundation::AssetId;
use serde::{Deserialize, Serialize};

/// Failure of a single load attempt against one source location.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("asset not found: {0}")]
    NotFound(String),
    #[error("asset too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("invalid asset format: {0}")]
    InvalidFormat(String),
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),
    #[error("transient io error: {0}")]
    Transient(String),
    #[error("load timed out after {0:?}")]
    Timeout(Duration),
}

impl LoadError {
    /// Only transient failures are worth another attempt at the same source.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoadError::Transient(_) | LoadError::Timeout(_))
    }

    pub fn fallback_reason(&self) -> FallbackReason {
        match self {
            // A source that fails integrity validation is never served, same
            // as a missing one.
            LoadError::NotFound(_) | LoadError::ChecksumMismatch(_) => FallbackReason::FileNotFound,
            LoadError::TooLarge { .. } => FallbackReason::FileTooLarge,
            LoadError::InvalidFormat(_) => FallbackReason::InvalidModel,
            LoadError::Transient(_) | LoadError::Timeout(_) => FallbackReason::LoadError,
        }
    }
}

/// Why a resolution moved down a tier (or, for `PlaceholderFailed`, gave up).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FallbackReason {
    FileNotFound,
    FileTooLarge,
    InvalidModel,
    LoadError,
    MaxRetriesExceeded,
    FallbackFailed,
    PlaceholderFailed,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::FileNotFound => "fileNotFound",
            FallbackReason::FileTooLarge => "fileTooLarge",
            FallbackReason::InvalidModel => "invalidModel",
            FallbackReason::LoadError => "loadError",
            FallbackReason::MaxRetriesExceeded => "maxRetriesExceeded",
            FallbackReason::FallbackFailed => "fallbackFailed",
            FallbackReason::PlaceholderFailed => "placeholderFailed",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution failures that escape the fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// Even the generic placeholder could not be loaded.
    #[error("placeholder unavailable for {asset_id} (last failure: {last})")]
    PlaceholderUnavailable {
        asset_id: AssetId,
        last: FallbackReason,
    },
    #[error("resolution of {0} cancelled")]
    Cancelled(AssetId),
}

impl ResolveError {
    pub fn reason(&self) -> Option<FallbackReason> {
        match self {
            ResolveError::PlaceholderUnavailable { .. } => Some(FallbackReason::PlaceholderFailed),
            ResolveError::Cancelled(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{FallbackReason, LoadError};

    #[test]
    fn classification() {
        assert!(LoadError::Transient("reset".into()).is_retryable());
        assert!(LoadError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!LoadError::NotFound("x".into()).is_retryable());
        assert!(!LoadError::TooLarge { size: 2, max: 1 }.is_retryable());
        assert!(!LoadError::InvalidFormat("x".into()).is_retryable());
        assert!(!LoadError::ChecksumMismatch("x".into()).is_retryable());
    }

    #[test]
    fn checksum_failure_counts_as_not_found() {
        assert_eq!(
            LoadError::ChecksumMismatch("p1.glb".into()).fallback_reason(),
            FallbackReason::FileNotFound
        );
        assert_eq!(
            LoadError::InvalidFormat("p1.glb".into()).fallback_reason(),
            FallbackReason::InvalidModel
        );
    }
}
