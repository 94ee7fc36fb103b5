//! Content digests identifying layers and layer chains.
//!
//! A layer is identified by its [`DiffId`], the digest of its uncompressed
//! tar bytes. A layer *in context* - together with its entire ancestor
//! stack - is identified by its [`ChainId`], derived recursively from the
//! parent's chain and the layer's own DiffID. The chain digest is the
//! primary key of the layer store.
//!
//! Both identities are opaque `algorithm:hex` strings. The algorithm token
//! of a DiffID is carried verbatim from whoever produced it; derived chain
//! digests are always SHA-256.

use std::fmt;

use sha2::{Digest, Sha256};

/// Content digest of a single uncompressed layer tarball.
///
/// Opaque `algorithm:hex` string, e.g.
/// `sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DiffId(String);

impl DiffId {
    /// Creates a DiffID from its textual digest form.
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    /// Returns the digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Digest identifying a layer together with its entire ancestor chain.
///
/// For a root layer the chain digest equals the layer's [`DiffId`]. For any
/// other layer it is `sha256(parent_chain + " " + diff_id)` over the
/// textual digest forms, with a single ASCII space as separator.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChainId(String);

impl ChainId {
    /// Creates a ChainID from its textual digest form.
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    /// Derives the chain digest for a layer under the given parent chain.
    ///
    /// A layer without a parent inherits its DiffID as chain digest.
    pub fn from_parent(parent: Option<&ChainId>, diff_id: &DiffId) -> Self {
        match parent {
            None => Self(diff_id.as_str().to_string()),
            Some(parent) => {
                let mut hasher = Sha256::new();
                hasher.update(parent.as_str().as_bytes());
                hasher.update(b" ");
                hasher.update(diff_id.as_str().as_bytes());
                Self(format!("sha256:{:x}", hasher.finalize()))
            }
        }
    }

    /// Returns the digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered layer stack, bottom-up, described by its DiffIDs.
///
/// Produced by the download manager; the chain digest of the full stack
/// addresses the complete filesystem in the layer store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootFs {
    /// DiffIDs of the stack, bottom layer first.
    pub diff_ids: Vec<DiffId>,
}

impl RootFs {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer on top of the stack.
    pub fn append(&mut self, diff_id: DiffId) {
        self.diff_ids.push(diff_id);
    }

    /// Returns the chain digest of the whole stack, or `None` when empty.
    pub fn chain_id(&self) -> Option<ChainId> {
        let mut chain: Option<ChainId> = None;
        for diff_id in &self.diff_ids {
            chain = Some(ChainId::from_parent(chain.as_ref(), diff_id));
        }
        chain
    }

    /// Returns the number of layers in the stack.
    pub fn len(&self) -> usize {
        self.diff_ids.len()
    }

    /// Returns true if the stack holds no layers.
    pub fn is_empty(&self) -> bool {
        self.diff_ids.is_empty()
    }
}
