// src/mapstore/mod.rs
//! Content-addressed backing store for the sparse merkle tree.
//!
//! Keys are `sha256(node body)`, so a write either creates a new node or
//! repeats an identical one; overwriting with different content is a store
//! corruption. `StagedStore` layers copy-on-write bookkeeping on top of a
//! `Base` so that nodes orphaned by superseded roots can be pruned once a
//! publish succeeds.

mod mem;
mod staged;

pub use mem::MemStore;
pub use staged::StagedStore;

use crate::error::StoreError;

pub const LEAF_PREFIX: u8 = 0x00;
pub const NODE_PREFIX: u8 = 0x01;

/// A key scheduled for commit, with its keep/orphan mark.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    pub key: Vec<u8>,
    pub keep: bool,
}

/// Flow control for [`StagedStore::traverse_nodes`] handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    /// Skip the descendants of the current node. Ignored for leaves.
    SkipBranch,
}

/// Handler outcome used during traversal.
pub type VisitResult = Result<Visit, StoreError>;

/// The minimal store the staged wrapper is built on.
pub trait Base: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
    fn len(&self) -> usize;
    /// Durably commit the listed keys: entries marked `keep` are retained,
    /// the rest are deleted.
    fn process_keys(&self, keys: &[KeyInfo]) -> Result<(), StoreError>;
}
