//! A single live download shared among watchers.
//!
//! A [`Transfer`] is one logical unit of in-flight work. Several callers
//! interested in the same layer attach to the same transfer as *watchers*;
//! each watcher gets its own view of the progress stream and its own
//! cancellation input. The transfer itself is cancelled only when the
//! union of its watchers no longer cares: when every attached watcher has
//! requested cancellation, or when the watcher set empties while the work
//! is still running.
//!
//! State is monotone: `Running` transitions exactly once into one of the
//! terminal states. The outcome (a pinned layer handle or an error) is
//! published before the terminal transition, so anyone who observed a
//! terminal state can read the outcome.

mod registry;

pub use registry::TransferRegistry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DownloadError;
use crate::progress::{ProgressEvent, ProgressReporter};

/// Lifecycle of a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    /// Work is in flight.
    Running,
    /// The layer was registered successfully.
    Done,
    /// The work failed permanently.
    Failed,
    /// The work was cancelled before completion.
    Cancelled,
}

impl TransferState {
    /// Returns true for every state except `Running`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Identifies one watcher attached to a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

/// Per-watcher bookkeeping: id allocation and cancellation flags.
struct WatcherTable {
    next_id: u64,
    cancelled: HashMap<u64, bool>,
}

/// Hook invoked when an evicted transfer still holds a pinned layer.
pub type EvictFn<L> = Box<dyn FnOnce(L) + Send>;

/// One live download, shared by every watcher of its key.
pub struct Transfer<L> {
    key: String,
    progress: ProgressReporter,
    state: watch::Sender<TransferState>,
    outcome: Mutex<Option<Result<L, DownloadError>>>,
    watchers: Mutex<WatcherTable>,
    cancel: CancellationToken,
    on_evict: Mutex<Option<EvictFn<L>>>,
}

impl<L: Clone + Send + 'static> Transfer<L> {
    /// Creates a running transfer with no watchers.
    ///
    /// `on_evict` receives the successfully registered layer when the
    /// transfer is evicted from the registry, and is responsible for
    /// dropping the transfer's own pin on it.
    pub fn new(key: impl Into<String>, on_evict: EvictFn<L>) -> Arc<Self> {
        let (progress, _) = ProgressReporter::channel();
        let (state, _) = watch::channel(TransferState::Running);
        Arc::new(Self {
            key: key.into(),
            progress,
            state,
            outcome: Mutex::new(None),
            watchers: Mutex::new(WatcherTable {
                next_id: 0,
                cancelled: HashMap::new(),
            }),
            cancel: CancellationToken::new(),
            on_evict: Mutex::new(Some(on_evict)),
        })
    }

    /// Deduplication key this transfer is registered under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    /// Waits until the transfer reaches a terminal state.
    pub async fn wait_terminal(&self) -> TransferState {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|state| state.is_terminal())
            .await
            .expect("transfer state channel closed while transfer alive");
        state
    }

    /// Subscribes to state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<TransferState> {
        self.state.subscribe()
    }

    /// Returns a clone of the terminal outcome, or `None` while running.
    pub fn outcome(&self) -> Option<Result<L, DownloadError>> {
        self.outcome.lock().unwrap().clone()
    }

    /// Write half of the progress slot, for the worker and the descriptor.
    pub fn progress_reporter(&self) -> ProgressReporter {
        self.progress.clone()
    }

    /// Subscribes to the progress slot; the current snapshot is
    /// immediately observable.
    pub fn subscribe_progress(&self) -> watch::Receiver<Option<ProgressEvent>> {
        self.progress.subscribe()
    }

    /// Token the worker observes at every suspension point.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Attaches a new watcher.
    ///
    /// Returns `None` when the transfer is terminal with no watchers left,
    /// in which case it is only good for eviction and the caller must
    /// create a replacement.
    pub fn attach(&self) -> Option<WatcherId> {
        let mut table = self.watchers.lock().unwrap();
        if self.state().is_terminal() && table.cancelled.is_empty() {
            return None;
        }
        let id = table.next_id;
        table.next_id += 1;
        table.cancelled.insert(id, false);
        Some(WatcherId(id))
    }

    /// Records that `watcher` no longer wants the result.
    ///
    /// The transfer's token fires once every attached watcher has asked
    /// for cancellation.
    pub fn request_cancel(&self, watcher: WatcherId) {
        let mut table = self.watchers.lock().unwrap();
        if let Some(flag) = table.cancelled.get_mut(&watcher.0) {
            *flag = true;
        }
        self.cancel_if_abandoned(&table);
    }

    /// Detaches `watcher` and returns the number of watchers remaining.
    ///
    /// Detaching the last watcher of a running transfer cancels it.
    pub fn detach(&self, watcher: WatcherId) -> usize {
        let mut table = self.watchers.lock().unwrap();
        table.cancelled.remove(&watcher.0);
        self.cancel_if_abandoned(&table);
        table.cancelled.len()
    }

    /// Number of currently attached watchers.
    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().unwrap().cancelled.len()
    }

    /// Publishes the outcome and performs the terminal transition.
    ///
    /// Only the first call has any effect; the state machine is monotone.
    pub fn complete(&self, result: Result<L, DownloadError>) {
        let next = match &result {
            Ok(_) => TransferState::Done,
            Err(DownloadError::Cancelled) => TransferState::Cancelled,
            Err(_) => TransferState::Failed,
        };
        {
            let mut outcome = self.outcome.lock().unwrap();
            if outcome.is_some() {
                return;
            }
            *outcome = Some(result);
        }
        debug!(key = %self.key, state = ?next, "transfer reached terminal state");
        self.state.send_replace(next);
    }

    /// Runs the eviction hook, handing it the pinned layer if the transfer
    /// succeeded. Idempotent.
    pub(crate) fn evict(&self) {
        let hook = self.on_evict.lock().unwrap().take();
        if let Some(hook) = hook {
            let layer = self
                .outcome
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|result| result.as_ref().ok().cloned());
            if let Some(layer) = layer {
                hook(layer);
            }
        }
    }

    /// Fires the cancellation token when the union of watchers no longer
    /// cares: all cancelled, or none left while still running.
    fn cancel_if_abandoned(&self, table: &WatcherTable) {
        if self.state().is_terminal() {
            return;
        }
        if table.cancelled.is_empty() || table.cancelled.values().all(|cancelled| *cancelled) {
            debug!(key = %self.key, "no interested watchers left, cancelling transfer");
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_transfer() -> Arc<Transfer<String>> {
        Transfer::new("key", Box::new(|_layer| {}))
    }

    #[test]
    fn test_new_transfer_is_running() {
        let transfer = make_transfer();
        assert_eq!(transfer.state(), TransferState::Running);
        assert!(transfer.outcome().is_none());
        assert_eq!(transfer.watcher_count(), 0);
    }

    #[test]
    fn test_complete_success_transitions_to_done() {
        let transfer = make_transfer();
        transfer.complete(Ok("layer".to_string()));
        assert_eq!(transfer.state(), TransferState::Done);
        assert_eq!(transfer.outcome(), Some(Ok("layer".to_string())));
    }

    #[test]
    fn test_complete_is_monotone() {
        let transfer = make_transfer();
        transfer.complete(Err(DownloadError::Cancelled));
        transfer.complete(Ok("layer".to_string()));
        assert_eq!(transfer.state(), TransferState::Cancelled);
        assert_eq!(transfer.outcome(), Some(Err(DownloadError::Cancelled)));
    }

    #[test]
    fn test_failure_maps_to_failed_state() {
        let transfer = make_transfer();
        transfer.complete(Err(DownloadError::Transient("boom".into())));
        assert_eq!(transfer.state(), TransferState::Failed);
    }

    #[test]
    fn test_union_cancellation_requires_all_watchers() {
        let transfer = make_transfer();
        let a = transfer.attach().unwrap();
        let b = transfer.attach().unwrap();

        transfer.request_cancel(a);
        assert!(!transfer.cancellation().is_cancelled());

        transfer.request_cancel(b);
        assert!(transfer.cancellation().is_cancelled());
    }

    #[test]
    fn test_detach_of_uncancelled_watcher_completes_union() {
        let transfer = make_transfer();
        let a = transfer.attach().unwrap();
        let b = transfer.attach().unwrap();

        transfer.request_cancel(a);
        // The second watcher leaves without cancelling; everyone remaining
        // has cancelled, so the transfer no longer has an audience.
        transfer.detach(b);
        assert!(transfer.cancellation().is_cancelled());
    }

    #[test]
    fn test_detaching_last_watcher_cancels_running_transfer() {
        let transfer = make_transfer();
        let a = transfer.attach().unwrap();
        assert_eq!(transfer.detach(a), 0);
        assert!(transfer.cancellation().is_cancelled());
    }

    #[test]
    fn test_detach_after_terminal_does_not_cancel() {
        let transfer = make_transfer();
        let a = transfer.attach().unwrap();
        transfer.complete(Ok("layer".to_string()));
        transfer.detach(a);
        assert!(!transfer.cancellation().is_cancelled());
    }

    #[test]
    fn test_attach_rejected_on_evictable_transfer() {
        let transfer = make_transfer();
        transfer.complete(Ok("layer".to_string()));
        // Terminal with zero watchers: only good for eviction.
        assert!(transfer.attach().is_none());
    }

    #[test]
    fn test_attach_allowed_on_terminal_with_watchers() {
        let transfer = make_transfer();
        let _held = transfer.attach().unwrap();
        transfer.complete(Ok("layer".to_string()));
        assert!(transfer.attach().is_some());
    }

    #[test]
    fn test_evict_releases_layer_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let transfer: Arc<Transfer<String>> = Transfer::new(
            "key",
            Box::new(move |_layer| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        transfer.complete(Ok("layer".to_string()));
        transfer.evict();
        transfer.evict();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_evict_without_layer_is_a_noop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let transfer: Arc<Transfer<String>> = Transfer::new(
            "key",
            Box::new(move |_layer| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        transfer.complete(Err(DownloadError::Cancelled));
        transfer.evict();
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wait_terminal_observes_outcome() {
        let transfer = make_transfer();
        let waiter = Arc::clone(&transfer);
        let handle = tokio::spawn(async move { waiter.wait_terminal().await });

        transfer.complete(Ok("layer".to_string()));

        let state = handle.await.expect("waiter task panicked");
        assert_eq!(state, TransferState::Done);
        assert_eq!(transfer.outcome(), Some(Ok("layer".to_string())));
    }

    #[test]
    fn test_progress_snapshot_for_late_subscriber() {
        let transfer = make_transfer();
        transfer
            .progress_reporter()
            .report(ProgressEvent::downloading("id1", 5, 10));

        let rx = transfer.subscribe_progress();
        assert_eq!(
            rx.borrow().clone(),
            Some(ProgressEvent::downloading("id1", 5, 10))
        );
    }
}
