//! Process-wide registry of in-flight transfers.
//!
//! The registry is a keyed map enabling deduplication: a request for a key
//! either attaches to the live transfer already under that key, or
//! atomically inserts a fresh one. At most one transfer exists per key at
//! any instant.
//!
//! The map mutex is held only for map and bookkeeping operations. A fresh
//! transfer's worker future is constructed under the lock but spawned only
//! after the lock is released, so the registry can never hold its mutex
//! across a suspension point of the bounded download pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::debug;

use super::{Transfer, WatcherId};

/// Keyed map of live transfers.
pub struct TransferRegistry<L> {
    transfers: Mutex<HashMap<String, Arc<Transfer<L>>>>,
}

impl<L: Clone + Send + 'static> TransferRegistry<L> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            transfers: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches to the transfer under `key`, creating it if necessary.
    ///
    /// `make` is invoked under the registry lock when no usable transfer
    /// exists; it returns the fresh transfer together with its worker
    /// future, which is spawned after the lock is dropped. A terminal
    /// entry that has no watchers left is evicted and replaced.
    ///
    /// Returns the transfer, the caller's watcher handle, and whether the
    /// transfer was newly created by this call.
    pub fn join_or_create<F>(&self, key: &str, make: F) -> (Arc<Transfer<L>>, WatcherId, bool)
    where
        F: FnOnce() -> (Arc<Transfer<L>>, BoxFuture<'static, ()>),
    {
        let mut stale = None;
        let (transfer, watcher, work) = {
            let mut transfers = self.transfers.lock().unwrap();
            if let Some(existing) = transfers.get(key) {
                if let Some(watcher) = existing.attach() {
                    debug!(key, "joining in-flight transfer");
                    return (Arc::clone(existing), watcher, false);
                }
                // Terminal with no watchers: replace it.
                stale = transfers.remove(key);
            }

            let (transfer, work) = make();
            let watcher = transfer
                .attach()
                .expect("fresh transfer must accept watchers");
            transfers.insert(key.to_string(), Arc::clone(&transfer));
            (transfer, watcher, work)
        };

        if let Some(stale) = stale {
            debug!(key, "evicting stale terminal transfer");
            stale.evict();
        }

        debug!(key, "starting new transfer");
        tokio::spawn(work);
        (transfer, watcher, true)
    }

    /// Detaches `watcher` from `transfer` and evicts the registry entry
    /// once the transfer is terminal with no watchers left.
    ///
    /// Detaching the last watcher of a still-running transfer cancels it;
    /// the worker reaps the entry itself when it terminates.
    pub fn release(&self, transfer: &Arc<Transfer<L>>, watcher: WatcherId) {
        let evict = {
            let mut transfers = self.transfers.lock().unwrap();
            let remaining = transfer.detach(watcher);
            if remaining == 0 && transfer.state().is_terminal() {
                self.remove_if_same(&mut transfers, transfer)
            } else {
                false
            }
        };
        if evict {
            transfer.evict();
        }
    }

    /// Called by a worker after its terminal transition: evicts the entry
    /// if every watcher already released it while the work was finishing.
    pub fn reap(&self, transfer: &Arc<Transfer<L>>) {
        let evict = {
            let mut transfers = self.transfers.lock().unwrap();
            if transfer.watcher_count() == 0 {
                self.remove_if_same(&mut transfers, transfer)
            } else {
                false
            }
        };
        if evict {
            debug!(key = transfer.key(), "reaping abandoned transfer");
            transfer.evict();
        }
    }

    /// Number of live transfers.
    pub fn len(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }

    /// Returns true when no transfers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the entry for `transfer`'s key if it still maps to this
    /// exact transfer (a replacement may already sit under the key).
    fn remove_if_same(
        &self,
        transfers: &mut HashMap<String, Arc<Transfer<L>>>,
        transfer: &Arc<Transfer<L>>,
    ) -> bool {
        match transfers.get(transfer.key()) {
            Some(entry) if Arc::ptr_eq(entry, transfer) => {
                transfers.remove(transfer.key());
                true
            }
            _ => false,
        }
    }
}

impl<L: Clone + Send + 'static> Default for TransferRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DownloadError;
    use crate::transfer::TransferState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn make_idle(key: &str) -> (Arc<Transfer<String>>, BoxFuture<'static, ()>) {
        let transfer = Transfer::new(key, Box::new(|_layer| {}));
        (transfer, Box::pin(async {}))
    }

    #[tokio::test]
    async fn test_second_request_joins_existing_transfer() {
        let registry: TransferRegistry<String> = TransferRegistry::new();

        let (first, _w1, is_new) = registry.join_or_create("key", || make_idle("key"));
        assert!(is_new);

        let (second, _w2, is_new) = registry.join_or_create("key", || {
            panic!("must not create a second transfer for a live key")
        });
        assert!(!is_new);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_release_of_last_watcher_evicts_terminal_transfer() {
        let released = Arc::new(AtomicUsize::new(0));
        let registry: TransferRegistry<String> = TransferRegistry::new();

        let counter = Arc::clone(&released);
        let (transfer, watcher, _) = registry.join_or_create("key", || {
            let transfer = Transfer::new(
                "key",
                Box::new(move |_layer: String| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
            (transfer, Box::pin(async {}))
        });

        transfer.complete(Ok("layer".to_string()));
        registry.release(&transfer, watcher);

        assert!(registry.is_empty());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_while_running_keeps_entry_and_cancels() {
        let registry: TransferRegistry<String> = TransferRegistry::new();
        let (transfer, watcher, _) = registry.join_or_create("key", || make_idle("key"));

        registry.release(&transfer, watcher);

        // Still running, so the entry stays until the worker reaps it.
        assert_eq!(registry.len(), 1);
        assert!(transfer.cancellation().is_cancelled());

        transfer.complete(Err(DownloadError::Cancelled));
        registry.reap(&transfer);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stale_terminal_entry_is_replaced() {
        let registry: TransferRegistry<String> = TransferRegistry::new();
        let (first, watcher, _) = registry.join_or_create("key", || make_idle("key"));

        first.complete(Ok("layer".to_string()));
        // Detach directly so the entry lingers in a terminal, watcherless
        // state without going through release().
        first.detach(watcher);
        assert_eq!(first.state(), TransferState::Done);

        let (second, _w, is_new) = registry.join_or_create("key", || make_idle("key"));
        assert!(is_new);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_worker_future_is_spawned() {
        let registry: TransferRegistry<String> = TransferRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        let (_transfer, _watcher, _) = registry.join_or_create("key", || {
            let transfer = Transfer::new("key", Box::new(|_layer: String| {}));
            let work = Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }) as BoxFuture<'static, ()>;
            (transfer, work)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reap_keeps_entry_with_watchers() {
        let registry: TransferRegistry<String> = TransferRegistry::new();
        let (transfer, _watcher, _) = registry.join_or_create("key", || make_idle("key"));

        transfer.complete(Ok("layer".to_string()));
        registry.reap(&transfer);

        // A watcher still holds the result pinned.
        assert_eq!(registry.len(), 1);
    }
}
