//! The per-transfer download worker.
//!
//! One worker runs per transfer. Its phases, in order: bail out early if
//! the declared parent already failed; acquire a download slot from the
//! manager's bounded pool; run the descriptor's download routine under the
//! retry policy; hand the slot back as soon as the byte stream is
//! obtained; wait for the parent transfer to finish registering; stream
//! the bytes into the layer store under the parent's chain; verify the
//! expected digest; publish the outcome.
//!
//! Every suspension point observes the transfer's cancellation token and
//! aborts with a cancelled outcome when it fires.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::sleep;
use tokio_util::io::InspectReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::descriptor::{DownloadDescriptor, LayerDownload};
use crate::digest::ChainId;
use crate::error::{DownloadError, DownloadResult};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::store::{Layer, LayerStore};
use crate::transfer::{Transfer, TransferRegistry};

use super::retry::RetryPolicy;

/// Executes one transfer's download end to end.
pub(crate) struct DownloadWorker<S: LayerStore> {
    pub(crate) store: Arc<S>,
    pub(crate) descriptor: Arc<dyn DownloadDescriptor>,
    pub(crate) transfer: Arc<Transfer<S::Layer>>,
    /// Transfer of the layer directly beneath this one, if it is being
    /// downloaded as part of the same stack.
    pub(crate) parent: Option<Arc<Transfer<S::Layer>>>,
    /// Chain of the already-present stack beneath the first downloaded
    /// layer; only set when `parent` is `None`.
    pub(crate) base_chain: Option<ChainId>,
    pub(crate) slots: Arc<Semaphore>,
    pub(crate) retry: RetryPolicy,
    pub(crate) registry: Arc<TransferRegistry<S::Layer>>,
}

impl<S: LayerStore> DownloadWorker<S> {
    /// Runs the download, publishes the outcome, and reaps the registry
    /// entry if every watcher already left.
    pub(crate) async fn run(self) {
        let id = self.descriptor.id();
        debug!(id = %id, key = self.transfer.key(), "layer download starting");

        let result = self.execute(&id).await;
        match &result {
            Ok(layer) => debug!(id = %id, diff_id = %layer.diff_id(), "layer download finished"),
            Err(DownloadError::Cancelled) => debug!(id = %id, "layer download cancelled"),
            Err(err) => warn!(id = %id, error = %err, "layer download failed"),
        }

        self.transfer.complete(result);
        self.registry.reap(&self.transfer);
    }

    async fn execute(&self, id: &str) -> DownloadResult<S::Layer> {
        let cancel = self.transfer.cancellation();
        let progress = self.transfer.progress_reporter();

        // A parent that already failed dooms this layer; don't spend a
        // download slot on it.
        if let Some(parent) = &self.parent {
            if parent.state().is_terminal() {
                if let Some(Err(err)) = parent.outcome() {
                    return Err(DownloadError::ParentFailed(Box::new(err)));
                }
            }
        }

        let permit = self.acquire_slot(&cancel, &progress, id).await?;
        let download = self.download_with_retry(&cancel, &progress, id).await?;
        // The descriptor is done with the wire; free the slot before the
        // potentially long parent wait and store registration.
        drop(permit);
        progress.report(ProgressEvent::download_complete(id));

        let parent_chain = self.await_parent(&cancel).await?;
        let layer = self
            .register(download, parent_chain, &cancel, &progress, id)
            .await?;

        if let Some(expected) = self.descriptor.diff_id() {
            progress.report(ProgressEvent::verifying_checksum(id));
            let actual = layer.diff_id();
            if actual != expected {
                // The store already pinned the registered layer for us;
                // hand that pin back before failing.
                if let Err(err) = self.store.release(layer) {
                    warn!(id, error = %err, "failed to release mismatched layer");
                }
                return Err(DownloadError::DigestMismatch {
                    id: id.to_string(),
                    expected,
                    actual,
                });
            }
        }

        progress.report(ProgressEvent::pull_complete(id));
        Ok(layer)
    }

    /// Acquires a slot from the bounded download pool, announcing
    /// "Waiting" only when the pool is currently exhausted.
    async fn acquire_slot(
        &self,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
        id: &str,
    ) -> DownloadResult<OwnedSemaphorePermit> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::NoPermits) => {}
            Err(TryAcquireError::Closed) => {
                return Err(DownloadError::Cancelled);
            }
        }

        progress.report(ProgressEvent::waiting(id));
        tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_closed| DownloadError::Cancelled)
            }
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        }
    }

    /// Runs the descriptor's download routine under the retry policy.
    async fn download_with_retry(
        &self,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
        id: &str,
    ) -> DownloadResult<LayerDownload> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                result = self.descriptor.download(cancel.clone(), progress.clone()) => result,
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            };

            let err = match result {
                Ok(download) => return Ok(download),
                Err(err) => err,
            };

            // Cancellation is never retried, whether it surfaced from the
            // descriptor or from our own token.
            if cancel.is_cancelled() || err.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let Some(delay) = self.retry.backoff_after(attempt) else {
                return Err(DownloadError::DownloadFailed {
                    id: id.to_string(),
                    attempts: attempt,
                    reason: err.to_string(),
                });
            };

            debug!(id, attempt, delay_ms = delay.as_millis() as u64, error = %err,
                "download attempt failed, retrying");
            progress.report(ProgressEvent::retrying(id, attempt, self.retry.max_attempts()));

            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            }
        }
    }

    /// Waits for the parent transfer to finish registering and returns the
    /// chain the new layer goes on top of.
    async fn await_parent(&self, cancel: &CancellationToken) -> DownloadResult<Option<ChainId>> {
        let Some(parent) = &self.parent else {
            return Ok(self.base_chain.clone());
        };

        tokio::select! {
            _ = parent.wait_terminal() => {}
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        }

        match parent.outcome() {
            Some(Ok(layer)) => Ok(Some(layer.chain_id())),
            Some(Err(err)) => Err(DownloadError::ParentFailed(Box::new(err))),
            // The outcome is published before the terminal transition, so
            // this only happens if the parent vanished mid-flight.
            None => Err(DownloadError::ParentFailed(Box::new(
                DownloadError::Cancelled,
            ))),
        }
    }

    /// Streams the downloaded bytes into the store, reporting extraction
    /// progress as they drain.
    async fn register(
        &self,
        download: LayerDownload,
        parent_chain: Option<ChainId>,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
        id: &str,
    ) -> DownloadResult<S::Layer> {
        let LayerDownload { stream, size } = download;
        let total = if size == 0 { -1 } else { size as i64 };

        let reporter = progress.clone();
        let event_id = id.to_string();
        let mut drained: u64 = 0;
        let stream = InspectReader::new(stream, move |chunk: &[u8]| {
            drained += chunk.len() as u64;
            reporter.report(ProgressEvent::extracting(&event_id, drained as i64, total));
        });

        let result = tokio::select! {
            result = self.store.register(Box::new(stream), parent_chain.as_ref()) => result,
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        };

        result.map_err(|err| DownloadError::Store(err.to_string()))
    }
}
