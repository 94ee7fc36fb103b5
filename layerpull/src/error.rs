//! Error types for layer downloads and the layer store contract.

use thiserror::Error;

use crate::digest::DiffId;

/// Result type for download operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors that can occur while materializing a layer stack.
///
/// Outcomes are shared between every watcher of a transfer, so all variants
/// are cheaply cloneable and carry their detail as strings.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DownloadError {
    /// The caller's cancellation token fired, or every watcher of a shared
    /// transfer asked for cancellation. Never retried.
    #[error("download cancelled")]
    Cancelled,

    /// A single download attempt failed. Retried with backoff until the
    /// retry policy is exhausted.
    #[error("transient download failure: {0}")]
    Transient(String),

    /// All download attempts failed.
    #[error("download of {id} failed after {attempts} attempt(s): {reason}")]
    DownloadFailed {
        id: String,
        attempts: u32,
        reason: String,
    },

    /// The registered layer's DiffID does not match the expected digest.
    /// Fatal for the layer and all of its descendants in the submission.
    #[error("invalid digest for {id}: expected {expected}, got {actual}")]
    DigestMismatch {
        id: String,
        expected: DiffId,
        actual: DiffId,
    },

    /// The layer store failed to register or look up a layer.
    #[error("layer store error: {0}")]
    Store(String),

    /// A required parent transfer terminated without a registered layer.
    #[error("parent layer failed: {0}")]
    ParentFailed(Box<DownloadError>),
}

impl DownloadError {
    /// Returns true if this error represents a cancellation rather than a
    /// failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors surfaced by [`LayerStore`](crate::store::LayerStore)
/// implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading the layer byte stream failed.
    #[error("failed to read layer data: {0}")]
    Io(#[from] std::io::Error),

    /// The storage backend rejected the operation.
    #[error("layer store backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_cancelled() {
        assert!(DownloadError::Cancelled.is_cancelled());
        assert!(!DownloadError::Transient("timeout".into()).is_cancelled());
    }

    #[test]
    fn test_download_failed_display() {
        let err = DownloadError::DownloadFailed {
            id: "layer0".into(),
            attempts: 5,
            reason: "connection reset".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("layer0"));
        assert!(msg.contains("5 attempt(s)"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_digest_mismatch_display() {
        let err = DownloadError::DigestMismatch {
            id: "layer0".into(),
            expected: DiffId::new("sha256:aaaa"),
            actual: DiffId::new("sha256:bbbb"),
        };
        let msg = err.to_string();
        assert!(msg.contains("invalid digest"));
        assert!(msg.contains("sha256:aaaa"));
        assert!(msg.contains("sha256:bbbb"));
    }

    #[test]
    fn test_parent_failed_wraps_cause() {
        let err = DownloadError::ParentFailed(Box::new(DownloadError::Cancelled));
        assert!(err.to_string().contains("download cancelled"));
    }
}
