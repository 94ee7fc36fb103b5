//! The layer store contract consumed by the download manager.
//!
//! The store owns decompression and on-disk layout; the download manager
//! only streams bytes into it and tracks the returned layer handles. The
//! store is assumed to be internally thread-safe and to reference-count
//! ("pin") every handle it gives out until it is released.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::digest::{ChainId, DiffId};
use crate::error::StoreError;

/// Byte stream consumed exactly once by [`LayerStore::register`].
pub type LayerStream = Box<dyn AsyncRead + Send + Unpin>;

/// A registered layer handle.
///
/// Handles are owned by the store and expected to be cheap to clone
/// (typically a shared reference into the store). A handle counts as a pin
/// until it is passed back to [`LayerStore::release`].
pub trait Layer: Clone + Send + Sync + 'static {
    /// Content digest of the layer's uncompressed tar bytes.
    fn diff_id(&self) -> DiffId;

    /// Digest of the layer together with its ancestor chain.
    fn chain_id(&self) -> ChainId;
}

/// Content-addressed storage of filesystem layers.
#[async_trait]
pub trait LayerStore: Send + Sync + 'static {
    /// The handle type returned for registered layers.
    type Layer: Layer;

    /// Consumes `stream` and registers its contents as a layer on top of
    /// `parent`.
    ///
    /// The store computes the DiffID from the consumed bytes and derives
    /// the ChainID from the parent chain. Registration is idempotent by
    /// ChainID: registering an already-present chain returns the existing
    /// layer.
    async fn register(
        &self,
        stream: LayerStream,
        parent: Option<&ChainId>,
    ) -> Result<Self::Layer, StoreError>;

    /// Looks up a layer by its chain digest.
    ///
    /// Returns `Ok(None)` when no such chain is registered.
    async fn get(&self, chain_id: &ChainId) -> Result<Option<Self::Layer>, StoreError>;

    /// Drops one pin on `layer`.
    ///
    /// Any metadata the store produces while releasing is of no interest
    /// to the download manager and is not surfaced here.
    fn release(&self, layer: Self::Layer) -> Result<(), StoreError>;
}
