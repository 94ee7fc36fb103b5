//! layerpull - concurrent download manager for content-addressed
//! filesystem layers.
//!
//! The manager materializes an ordered stack of layers (as used by
//! container image distribution) into a caller-supplied layer store. It
//! coordinates a bounded pool of concurrent downloads, deduplicates
//! concurrent requests for the same layer, registers layers strictly
//! parent-before-child, streams coalescing progress events, supports
//! cooperative cancellation, and pins materialized layers until the
//! caller releases them.
//!
//! # Architecture
//!
//! ```text
//! descriptors ──► LayerDownloadManager ──► TransferRegistry (dedup by key)
//!                        │                        │
//!                        │                  Transfer (shared, watched)
//!                        │                        │
//!                        │                  DownloadWorker
//!                        │                   │    │    │
//!                        ▼                   ▼    ▼    ▼
//!                  progress sink        semaphore  retry  LayerStore
//! ```
//!
//! Wire-level registry access, tar handling, and on-disk storage live
//! behind the [`DownloadDescriptor`] and [`LayerStore`] contracts; this
//! crate only orchestrates.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use layerpull::{LayerDownloadManager, RootFs};
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! let manager = LayerDownloadManager::new(store, 3);
//! let (progress_tx, mut progress_rx) = mpsc::channel(16);
//!
//! tokio::spawn(async move {
//!     while let Some(event) = progress_rx.recv().await {
//!         println!("{}: {} {}/{}", event.id, event.action, event.current, event.total);
//!     }
//! });
//!
//! let (root_fs, release) = manager
//!     .download(CancellationToken::new(), RootFs::new(), descriptors, progress_tx)
//!     .await?;
//!
//! // The layers in root_fs stay pinned until released.
//! release.release();
//! ```

pub mod descriptor;
pub mod digest;
pub mod download;
pub mod error;
pub mod progress;
pub mod store;
pub mod transfer;

pub use descriptor::{DownloadDescriptor, LayerDownload};
pub use digest::{ChainId, DiffId, RootFs};
pub use download::{DownloadRelease, LayerDownloadManager, RetryPolicy};
pub use error::{DownloadError, DownloadResult, StoreError};
pub use progress::{ProgressEvent, ProgressReporter};
pub use store::{Layer, LayerStore, LayerStream};
