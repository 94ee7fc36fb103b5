//! The per-layer download contract supplied by the caller.

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::digest::DiffId;
use crate::error::DownloadResult;
use crate::progress::ProgressReporter;

/// The byte stream and declared size handed over by a descriptor.
pub struct LayerDownload {
    /// Uncompressed layer tar bytes, consumed exactly once.
    pub stream: Box<dyn AsyncRead + Send + Unpin>,
    /// Declared size in bytes, or 0 when unknown.
    pub size: u64,
}

/// Describes one layer to download.
///
/// Implementations wrap whatever wire protocol actually produces the bytes
/// (an image registry client, a local cache, a test fixture). The manager
/// deduplicates concurrent requests by [`key`](Self::key): two descriptors
/// with equal keys share a single download.
#[async_trait]
pub trait DownloadDescriptor: Send + Sync + 'static {
    /// Key used to deduplicate downloads.
    fn key(&self) -> String;

    /// ID used for progress display.
    fn id(&self) -> String;

    /// The layer's DiffID, when known before downloading.
    ///
    /// A known digest enables the already-exists shortcut and is verified
    /// against the digest the store computes from the downloaded bytes.
    fn diff_id(&self) -> Option<DiffId> {
        None
    }

    /// Performs the download, yielding a byte stream and its size.
    ///
    /// Must honor `cancel`: return [`DownloadError::Cancelled`] promptly
    /// once the token fires. Any other error is treated as transient and
    /// retried according to the manager's retry policy. Progress should be
    /// published through `progress` as `"Downloading"` events.
    ///
    /// [`DownloadError::Cancelled`]: crate::error::DownloadError::Cancelled
    async fn download(
        &self,
        cancel: CancellationToken,
        progress: ProgressReporter,
    ) -> DownloadResult<LayerDownload>;

    /// Called with the final DiffID once the layer is registered.
    ///
    /// Every watcher of a shared transfer receives its own notification.
    fn registered(&self, _diff_id: &DiffId) {}
}
