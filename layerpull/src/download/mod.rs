//! The layer download manager.
//!
//! [`LayerDownloadManager`] materializes an ordered stack of
//! content-addressed layers into a layer store. It fans the submitted
//! descriptors out into transfers (deduplicated by key through a
//! process-wide registry), bounds how many descriptors download
//! concurrently, keeps registration ordered parent-before-child, streams
//! progress to the caller, and pins every materialized layer until the
//! caller releases the returned handle.
//!
//! # Example
//!
//! ```ignore
//! use layerpull::{LayerDownloadManager, RootFs};
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! let manager = LayerDownloadManager::new(store, 3);
//! let (progress_tx, progress_rx) = mpsc::channel(16);
//!
//! let (root_fs, release) = manager
//!     .download(CancellationToken::new(), RootFs::new(), descriptors, progress_tx)
//!     .await?;
//!
//! // ... create containers from root_fs ...
//! release.release();
//! ```

mod retry;
mod worker;

pub use retry::{
    RetryPolicy, DEFAULT_BACKOFF_GROWTH, DEFAULT_DOWNLOAD_ATTEMPTS, DEFAULT_INITIAL_DELAY_SECS,
    DEFAULT_MAX_DELAY_SECS,
};

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::descriptor::DownloadDescriptor;
use crate::digest::{ChainId, RootFs};
use crate::error::{DownloadError, DownloadResult};
use crate::progress::ProgressEvent;
use crate::store::{Layer, LayerStore};
use crate::transfer::{Transfer, TransferRegistry, TransferState, WatcherId};

use worker::DownloadWorker;

/// One dispatched transfer of a download call, in input order.
struct TransferEntry<S: LayerStore> {
    descriptor: Arc<dyn DownloadDescriptor>,
    transfer: Arc<Transfer<S::Layer>>,
    watcher: WatcherId,
}

/// Orchestrates concurrent downloads of layer stacks.
///
/// Cheap to share behind an [`Arc`]; concurrent `download` calls
/// deduplicate against each other through the shared transfer registry.
pub struct LayerDownloadManager<S: LayerStore> {
    store: Arc<S>,
    registry: Arc<TransferRegistry<S::Layer>>,
    slots: Arc<Semaphore>,
    max_concurrency: usize,
    retry: RetryPolicy,
}

impl<S: LayerStore> LayerDownloadManager<S> {
    /// Creates a manager that lets at most `max_concurrency` descriptors
    /// run their download routine at the same time.
    pub fn new(store: Arc<S>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            store,
            registry: Arc::new(TransferRegistry::new()),
            slots: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            retry: RetryPolicy::downloads(),
        }
    }

    /// Overrides the retry policy applied to transient download failures.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The configured download concurrency bound.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Number of transfers currently held in the registry.
    pub fn transfers_in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Downloads the described layers on top of `initial_root_fs`.
    ///
    /// Descriptors form an ordered stack: each one's parent is the entry
    /// before it, the first one sits on top of `initial_root_fs`. Progress
    /// is forwarded to `progress_sink`; a slow sink coalesces events but
    /// always receives each layer's terminal event.
    ///
    /// On success, returns the extended root filesystem and a release
    /// handle. Every materialized layer stays pinned in the store until
    /// the handle is released (explicitly or by dropping it). On error,
    /// this call's pins have already been dropped.
    pub async fn download(
        &self,
        cancel: CancellationToken,
        initial_root_fs: RootFs,
        descriptors: Vec<Arc<dyn DownloadDescriptor>>,
        progress_sink: mpsc::Sender<ProgressEvent>,
    ) -> DownloadResult<(RootFs, DownloadRelease<S>)> {
        let mut root_fs = initial_root_fs;
        let mut prefix_chain = root_fs.chain_id();
        let mut prefix_layer: Option<S::Layer> = None;
        let mut prefix_resolved = true;
        let mut top_transfer: Option<Arc<Transfer<S::Layer>>> = None;
        let mut entries: Vec<TransferEntry<S>> = Vec::with_capacity(descriptors.len());

        for descriptor in &descriptors {
            // While every layer beneath is already present, a known DiffID
            // lets us probe the store and skip the download entirely.
            if prefix_resolved {
                prefix_resolved = false;
                if let Some(diff_id) = descriptor.diff_id() {
                    let chain = ChainId::from_parent(prefix_chain.as_ref(), &diff_id);
                    match self.store.get(&chain).await {
                        Ok(Some(layer)) => {
                            debug!(id = %descriptor.id(), chain = %chain, "layer already exists");
                            let _ = progress_sink
                                .send(ProgressEvent::already_exists(&descriptor.id()))
                                .await;
                            descriptor.registered(&diff_id);
                            // Only the topmost already-present layer stays
                            // pinned; it holds its ancestors through the
                            // store's own chain references.
                            if let Some(previous) = prefix_layer.take() {
                                release_layer(self.store.as_ref(), previous);
                            }
                            prefix_layer = Some(layer);
                            prefix_chain = Some(chain);
                            root_fs.append(diff_id);
                            prefix_resolved = true;
                            continue;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(id = %descriptor.id(), error = %err,
                                "store probe failed, falling back to download");
                        }
                    }
                }
            }

            let parent = top_transfer.clone();
            let base_chain = if parent.is_none() {
                prefix_chain.clone()
            } else {
                None
            };

            let key = descriptor.key();
            let make_store = Arc::clone(&self.store);
            let worker_store = Arc::clone(&self.store);
            let worker_descriptor = Arc::clone(descriptor);
            let worker_slots = Arc::clone(&self.slots);
            let worker_registry = Arc::clone(&self.registry);
            let worker_retry = self.retry.clone();
            let make_key = key.clone();

            let (transfer, watcher, is_new) = self.registry.join_or_create(&key, move || {
                let transfer = Transfer::new(
                    make_key,
                    Box::new(move |layer| release_layer(make_store.as_ref(), layer)),
                );
                let worker = DownloadWorker {
                    store: worker_store,
                    descriptor: worker_descriptor,
                    transfer: Arc::clone(&transfer),
                    parent,
                    base_chain,
                    slots: worker_slots,
                    retry: worker_retry,
                    registry: worker_registry,
                };
                (transfer, Box::pin(worker.run()))
            });

            if is_new {
                let _ = progress_sink
                    .send(ProgressEvent::pulling_fs_layer(&descriptor.id()))
                    .await;
            }

            spawn_progress_forwarder(
                transfer.subscribe_progress(),
                transfer.subscribe_state(),
                progress_sink.clone(),
            );

            entries.push(TransferEntry {
                descriptor: Arc::clone(descriptor),
                transfer: Arc::clone(&transfer),
                watcher,
            });
            top_transfer = Some(transfer);
        }

        // Collect outcomes in input order. The first failure cancels and
        // releases everything; a caller cancellation takes precedence over
        // any individual outcome.
        let mut caller_cancelled = false;
        let mut first_error: Option<DownloadError> = None;

        'collect: for entry in &entries {
            tokio::select! {
                _ = entry.transfer.wait_terminal() => {}
                _ = cancel.cancelled() => {
                    caller_cancelled = true;
                    for entry in &entries {
                        entry.transfer.request_cancel(entry.watcher);
                    }
                    break 'collect;
                }
            }

            // The outcome is published before the terminal transition.
            let outcome = entry
                .transfer
                .outcome()
                .unwrap_or(Err(DownloadError::Cancelled));
            match outcome {
                Ok(layer) => {
                    let actual = layer.diff_id();
                    // Every watcher verifies its own expectation against
                    // the transfer's single actual digest.
                    if let Some(expected) = entry.descriptor.diff_id() {
                        if expected != actual {
                            first_error = Some(DownloadError::DigestMismatch {
                                id: entry.descriptor.id(),
                                expected,
                                actual,
                            });
                            break 'collect;
                        }
                    }
                    entry.descriptor.registered(&actual);
                    root_fs.append(actual);
                }
                Err(err) => {
                    first_error = Some(err);
                    break 'collect;
                }
            }
        }

        if caller_cancelled {
            debug!("download cancelled by caller");
            self.release_call(entries, prefix_layer);
            return Err(DownloadError::Cancelled);
        }

        if let Some(err) = first_error {
            warn!(error = %err, "download failed, cancelling remaining transfers");
            for entry in &entries {
                entry.transfer.request_cancel(entry.watcher);
            }
            self.release_call(entries, prefix_layer);
            return Err(err);
        }

        let release = DownloadRelease {
            inner: Mutex::new(Some(ReleaseInner {
                store: Arc::clone(&self.store),
                registry: Arc::clone(&self.registry),
                watchers: entries
                    .into_iter()
                    .map(|entry| (entry.transfer, entry.watcher))
                    .collect(),
                prefix_layer,
            })),
        };

        Ok((root_fs, release))
    }

    /// Drops every pin this call took, releasing partial progress.
    fn release_call(&self, entries: Vec<TransferEntry<S>>, prefix_layer: Option<S::Layer>) {
        for entry in entries {
            self.registry.release(&entry.transfer, entry.watcher);
        }
        if let Some(layer) = prefix_layer {
            release_layer(self.store.as_ref(), layer);
        }
    }
}

/// Handle pinning one download call's layers in the store.
///
/// Dropping the handle releases the pins; [`release`](Self::release) does
/// the same explicitly and is idempotent.
pub struct DownloadRelease<S: LayerStore> {
    inner: Mutex<Option<ReleaseInner<S>>>,
}

struct ReleaseInner<S: LayerStore> {
    store: Arc<S>,
    registry: Arc<TransferRegistry<S::Layer>>,
    watchers: Vec<(Arc<Transfer<S::Layer>>, WatcherId)>,
    prefix_layer: Option<S::Layer>,
}

impl<S: LayerStore> DownloadRelease<S> {
    /// Drops this call's pin on every participating transfer and on the
    /// already-present prefix. Safe to call any number of times.
    pub fn release(&self) {
        let Some(inner) = self.inner.lock().unwrap().take() else {
            return;
        };
        let ReleaseInner {
            store,
            registry,
            watchers,
            prefix_layer,
        } = inner;
        for (transfer, watcher) in watchers {
            registry.release(&transfer, watcher);
        }
        if let Some(layer) = prefix_layer {
            release_layer(store.as_ref(), layer);
        }
    }
}

impl<S: LayerStore> Drop for DownloadRelease<S> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<S: LayerStore> fmt::Debug for DownloadRelease<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let released = self.inner.lock().unwrap().is_none();
        f.debug_struct("DownloadRelease")
            .field("released", &released)
            .finish()
    }
}

/// Hands a pin back to the store, logging instead of propagating failures.
fn release_layer<S: LayerStore>(store: &S, layer: S::Layer) {
    let chain_id = layer.chain_id();
    if let Err(err) = store.release(layer) {
        warn!(chain = %chain_id, error = %err, "failed to release layer");
    }
}

/// Bridges one watcher's view of a transfer's progress slot to the
/// caller's sink.
///
/// The slot coalesces: a slow sink sees the newest value, never a backlog.
/// Once the transfer reaches a terminal state the slot's final value (the
/// terminal marker) is delivered and the forwarder exits.
fn spawn_progress_forwarder(
    mut progress_rx: watch::Receiver<Option<ProgressEvent>>,
    mut state_rx: watch::Receiver<TransferState>,
    sink: mpsc::Sender<ProgressEvent>,
) {
    tokio::spawn(async move {
        // Late watchers start from the current snapshot.
        let snapshot = progress_rx.borrow_and_update().clone();
        if let Some(event) = snapshot {
            if sink.send(event).await.is_err() {
                return;
            }
        }

        while !state_rx.borrow().is_terminal() {
            tokio::select! {
                changed = progress_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let event = progress_rx.borrow_and_update().clone();
                    if let Some(event) = event {
                        if sink.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let last = progress_rx.borrow_and_update().clone();
        if let Some(event) = last {
            let _ = sink.send(event).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::DiffId;
    use crate::error::StoreError;
    use crate::store::LayerStream;
    use async_trait::async_trait;

    #[derive(Clone)]
    struct NullLayer;

    impl Layer for NullLayer {
        fn diff_id(&self) -> DiffId {
            DiffId::new("sha256:null")
        }

        fn chain_id(&self) -> ChainId {
            ChainId::new("sha256:null")
        }
    }

    struct NullStore;

    #[async_trait]
    impl LayerStore for NullStore {
        type Layer = NullLayer;

        async fn register(
            &self,
            _stream: LayerStream,
            _parent: Option<&ChainId>,
        ) -> Result<Self::Layer, StoreError> {
            Ok(NullLayer)
        }

        async fn get(&self, _chain_id: &ChainId) -> Result<Option<Self::Layer>, StoreError> {
            Ok(None)
        }

        fn release(&self, _layer: Self::Layer) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_concurrency_is_clamped_to_at_least_one() {
        let manager = LayerDownloadManager::new(Arc::new(NullStore), 0);
        assert_eq!(manager.max_concurrency(), 1);
    }

    #[test]
    fn test_retry_policy_override() {
        let manager = LayerDownloadManager::new(Arc::new(NullStore), 3)
            .with_retry_policy(RetryPolicy::none());
        assert_eq!(manager.retry, RetryPolicy::none());
    }

    #[tokio::test]
    async fn test_empty_submission_returns_initial_rootfs() {
        let manager = LayerDownloadManager::new(Arc::new(NullStore), 3);
        let (tx, _rx) = mpsc::channel(4);

        let mut initial = RootFs::new();
        initial.append(DiffId::new("sha256:base"));

        let (root_fs, release) = manager
            .download(CancellationToken::new(), initial.clone(), Vec::new(), tx)
            .await
            .expect("empty submission succeeds");

        assert_eq!(root_fs, initial);
        release.release();
        release.release();
        assert_eq!(manager.transfers_in_flight(), 0);
    }
}
