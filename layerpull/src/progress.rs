//! Progress events and the per-transfer broadcast slot.
//!
//! Every transfer owns a single latest-value slot. Producers (the download
//! worker and the descriptor's own download routine) write events into the
//! slot without ever blocking; consumers subscribe and observe the newest
//! value. A slow consumer therefore sees a coalesced subsequence of events
//! instead of applying backpressure to the producer. The terminal marker
//! of a transfer ("Pull complete" or "Already exists") is always the final
//! value of the slot, so it can always be delivered.

use std::sync::Arc;

use tokio::sync::watch;

/// A single progress update for one layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Display ID of the layer this event belongs to.
    pub id: String,
    /// What is happening, e.g. `"Downloading"` or `"Pull complete"`.
    pub action: String,
    /// Units completed so far (bytes, ticks); meaning depends on `action`.
    pub current: i64,
    /// Total units expected, or `-1` when unknown.
    pub total: i64,
}

impl ProgressEvent {
    /// Creates an event with an arbitrary action.
    pub fn new(id: impl Into<String>, action: impl Into<String>, current: i64, total: i64) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            current,
            total,
        }
    }

    /// Bytes are being fetched by the descriptor.
    pub fn downloading(id: &str, current: i64, total: i64) -> Self {
        Self::new(id, "Downloading", current, total)
    }

    /// The descriptor handed over its byte stream.
    pub fn download_complete(id: &str) -> Self {
        Self::new(id, "Download complete", 0, 0)
    }

    /// The transfer is queued for a download slot.
    pub fn waiting(id: &str) -> Self {
        Self::new(id, "Waiting", 0, 0)
    }

    /// A download is being dispatched for this layer.
    pub fn pulling_fs_layer(id: &str) -> Self {
        Self::new(id, "Pulling fs layer", 0, 0)
    }

    /// The layer was found in the store and needs no download.
    ///
    /// Both counters carry the -1 sentinel: no bytes apply to a layer
    /// that was never fetched.
    pub fn already_exists(id: &str) -> Self {
        Self::new(id, "Already exists", -1, -1)
    }

    /// Bytes are being streamed into the layer store.
    pub fn extracting(id: &str, current: i64, total: i64) -> Self {
        Self::new(id, "Extracting", current, total)
    }

    /// The registered digest is being checked against the expected one.
    pub fn verifying_checksum(id: &str) -> Self {
        Self::new(id, "Verifying Checksum", 0, 0)
    }

    /// A failed attempt is being retried; `current` is the attempt number.
    pub fn retrying(id: &str, attempt: u32, max_attempts: u32) -> Self {
        Self::new(id, "Retrying", i64::from(attempt), i64::from(max_attempts))
    }

    /// The layer is registered in the store.
    pub fn pull_complete(id: &str) -> Self {
        Self::new(id, "Pull complete", 0, 0)
    }
}

/// Write half of a transfer's progress slot.
///
/// Cloneable; every clone writes into the same slot. Writes never block and
/// never fail: a value written while no subscriber is listening is kept as
/// the snapshot a late subscriber starts from.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    slot: Arc<watch::Sender<Option<ProgressEvent>>>,
}

impl ProgressReporter {
    /// Creates a reporter together with an initial subscription.
    pub fn channel() -> (Self, watch::Receiver<Option<ProgressEvent>>) {
        let (tx, rx) = watch::channel(None);
        (Self { slot: Arc::new(tx) }, rx)
    }

    /// Publishes an event, overwriting any not-yet-consumed previous one.
    pub fn report(&self, event: ProgressEvent) {
        self.slot.send_replace(Some(event));
    }

    /// Subscribes to the slot. The current snapshot is immediately
    /// observable on the returned receiver.
    pub fn subscribe(&self) -> watch::Receiver<Option<ProgressEvent>> {
        self.slot.subscribe()
    }
}
