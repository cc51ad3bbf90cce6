// src/map/source_tree.rs
//! The source tree: an append-only log of the CT logs tracked by the map,
//! in order of first ingestion.

use parking_lot::RwLock;

use super::head::LogId;
use crate::error::{MapError, MapResult};
use crate::merkle::{Hash, MerkleTree};

pub struct SourceTree {
    tree: MerkleTree,
    leaves: RwLock<Vec<LogId>>,
}

impl Default for SourceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceTree {
    pub fn new() -> Self {
        SourceTree { tree: MerkleTree::new(), leaves: RwLock::new(Vec::new()) }
    }

    /// Append a log id and return the new tree size.
    pub fn add_entry(&self, log_id: LogId) -> u64 {
        let mut leaves = self.leaves.write();
        self.tree.append(&log_id);
        leaves.push(log_id);
        leaves.len() as u64
    }

    pub fn size(&self) -> u64 {
        self.leaves.read().len() as u64
    }

    /// Root at the given (past or current) size.
    pub fn get_root(&self, tree_size: u64) -> MapResult<Hash> {
        self.tree.root_at(tree_size)
    }

    /// Entries in the inclusive interval `[start, end]`.
    pub fn get_entries(&self, start: u64, end: u64) -> MapResult<Vec<LogId>> {
        if start > end {
            return Err(MapError::validation(format!(
                "invalid interval: start ({start}) > end ({end})"
            )));
        }
        let leaves = self.leaves.read();
        if end >= leaves.len() as u64 {
            return Err(MapError::validation(format!(
                "invalid interval: end ({end}) >= tree size ({})",
                leaves.len()
            )));
        }
        Ok(leaves[start as usize..=end as usize].to_vec())
    }

    /// The entry at `index` plus its audit path against the root at `tree_size`.
    pub fn get_entry_and_proof(&self, tree_size: u64, index: u64) -> MapResult<(LogId, Vec<Hash>)> {
        let entries = self.get_entries(index, index)?;
        let proof = self.tree.inclusion_proof(tree_size, index)?;
        Ok((entries[0], proof))
    }

    pub fn get_consistency_proof(&self, first: u64, second: u64) -> MapResult<Vec<Hash>> {
        self.tree.consistency_proof(first, second)
    }
}
