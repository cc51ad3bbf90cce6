// src/merkle.rs
//! RFC 6962 Merkle tree over an in-memory leaf list.
//!
//! Every past tree size remains addressable: roots, inclusion proofs and
//! consistency proofs can be computed for any size up to the current one,
//! because leaves are never removed. Subtree hashes are computed lazily and
//! memoized, so read paths mutate the cache; a single mutex guards both the
//! leaf list and the cache.

use std::collections::HashMap;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{MapError, MapResult};

pub const HASH_SIZE: usize = 32;

/// A SHA-256 digest.
pub type Hash = [u8; HASH_SIZE];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// `sha256(0x00 || data)`
pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut h = Sha256::new();
    h.update([LEAF_PREFIX]);
    h.update(data);
    h.finalize().into()
}

/// `sha256(0x01 || left || right)`
pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut h = Sha256::new();
    h.update([NODE_PREFIX]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

/// Root of the empty tree: `sha256("")`.
pub fn empty_root() -> Hash {
    Sha256::digest([]).into()
}

/// Largest power of two strictly less than `n`. Requires `n >= 2`.
fn split_point(n: u64) -> u64 {
    let k = 1u64 << (63 - (n - 1).leading_zeros());
    debug_assert!(k < n && n <= 2 * k);
    k
}

struct TreeState {
    leaf_hashes: Vec<Hash>,
    // (start, size) -> subtree hash, filled on demand
    subtree_cache: HashMap<(u64, u64), Hash>,
}

impl TreeState {
    fn subtree_hash(&mut self, start: u64, size: u64) -> Hash {
        if size == 1 {
            return self.leaf_hashes[start as usize];
        }
        if let Some(h) = self.subtree_cache.get(&(start, size)) {
            return *h;
        }
        let k = split_point(size);
        let left = self.subtree_hash(start, k);
        let right = self.subtree_hash(start + k, size - k);
        let h = node_hash(&left, &right);
        self.subtree_cache.insert((start, size), h);
        h
    }

    // RFC 6962 PATH(m, D[n]), windowed over [start, start+size).
    fn inclusion_path(&mut self, index: u64, start: u64, size: u64, out: &mut Vec<Hash>) {
        if size <= 1 {
            return;
        }
        let k = split_point(size);
        if index < k {
            self.inclusion_path(index, start, k, out);
            out.push(self.subtree_hash(start + k, size - k));
        } else {
            self.inclusion_path(index - k, start + k, size - k, out);
            out.push(self.subtree_hash(start, k));
        }
    }

    // RFC 6962 SUBPROOF(m, D[n], b), windowed over [start, start+size).
    fn consistency_subproof(&mut self, m: u64, start: u64, size: u64, complete: bool, out: &mut Vec<Hash>) {
        if m == size {
            if !complete {
                out.push(self.subtree_hash(start, size));
            }
            return;
        }
        let k = split_point(size);
        if m <= k {
            self.consistency_subproof(m, start, k, complete, out);
            out.push(self.subtree_hash(start + k, size - k));
        } else {
            self.consistency_subproof(m - k, start + k, size - k, false, out);
            out.push(self.subtree_hash(start, k));
        }
    }
}

/// An append-only RFC 6962 log. All methods are safe for concurrent callers.
pub struct MerkleTree {
    state: Mutex<TreeState>,
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MerkleTree {
    pub fn new() -> Self {
        MerkleTree {
            state: Mutex::new(TreeState {
                leaf_hashes: Vec::new(),
                subtree_cache: HashMap::new(),
            }),
        }
    }

    /// Number of leaves.
    pub fn size(&self) -> u64 {
        self.state.lock().leaf_hashes.len() as u64
    }

    /// Append a leaf and return the new tree size.
    pub fn append(&self, leaf_data: &[u8]) -> u64 {
        let mut state = self.state.lock();
        state.leaf_hashes.push(leaf_hash(leaf_data));
        state.leaf_hashes.len() as u64
    }

    /// Root at the given (past or current) size.
    pub fn root_at(&self, tree_size: u64) -> MapResult<Hash> {
        let mut state = self.state.lock();
        let current = state.leaf_hashes.len() as u64;
        if tree_size > current {
            return Err(MapError::validation(format!(
                "invalid tree size {tree_size}: current size is {current}"
            )));
        }
        if tree_size == 0 {
            return Ok(empty_root());
        }
        Ok(state.subtree_hash(0, tree_size))
    }

    /// Audit path for `leaf_index` against the root at `tree_size`,
    /// ordered leaf to root.
    pub fn inclusion_proof(&self, tree_size: u64, leaf_index: u64) -> MapResult<Vec<Hash>> {
        if leaf_index >= tree_size {
            return Err(MapError::validation(format!(
                "leaf index {leaf_index} >= tree size {tree_size}"
            )));
        }
        let mut state = self.state.lock();
        let current = state.leaf_hashes.len() as u64;
        if tree_size > current {
            return Err(MapError::validation(format!(
                "invalid tree size {tree_size}: current size is {current}"
            )));
        }
        let mut out = Vec::new();
        state.inclusion_path(leaf_index, 0, tree_size, &mut out);
        Ok(out)
    }

    /// Consistency proof between the roots at `first` and `second`.
    pub fn consistency_proof(&self, first: u64, second: u64) -> MapResult<Vec<Hash>> {
        if first > second {
            return Err(MapError::validation(format!(
                "invalid sizes: first ({first}) > second ({second})"
            )));
        }
        let mut state = self.state.lock();
        let current = state.leaf_hashes.len() as u64;
        if second > current {
            return Err(MapError::validation(format!(
                "invalid tree size {second}: current size is {current}"
            )));
        }
        // The empty tree and a tree with itself are trivially consistent.
        if first == 0 || first == second {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        state.consistency_subproof(first, 0, second, true, &mut out);
        Ok(out)
    }
}

/// Verify an RFC 6962 inclusion proof (audit path ordered leaf to root).
pub fn verify_inclusion(
    leaf: &Hash,
    leaf_index: u64,
    tree_size: u64,
    proof: &[Hash],
    root: &Hash,
) -> bool {
    if leaf_index >= tree_size {
        return false;
    }
    let mut fnode = leaf_index;
    let mut snode = tree_size - 1;
    let mut current = *leaf;
    for p in proof {
        if snode == 0 {
            return false;
        }
        if fnode & 1 == 1 || fnode == snode {
            current = node_hash(p, &current);
            while fnode & 1 == 0 && fnode != 0 {
                fnode >>= 1;
                snode >>= 1;
            }
        } else {
            current = node_hash(&current, p);
        }
        fnode >>= 1;
        snode >>= 1;
    }
    snode == 0 && current == *root
}

/// Verify an RFC 6962 consistency proof between `root1` at `first`
/// and `root2` at `second`.
pub fn verify_consistency(
    first: u64,
    second: u64,
    proof: &[Hash],
    root1: &Hash,
    root2: &Hash,
) -> bool {
    if first > second {
        return false;
    }
    if first == second {
        return proof.is_empty() && root1 == root2;
    }
    if first == 0 {
        // Anything is consistent with the empty tree.
        return proof.is_empty();
    }

    let mut path = proof.iter();
    // When first is an exact power of two, its root is a node of the second
    // tree and the proof omits it.
    let seed = if first.is_power_of_two() {
        *root1
    } else {
        match path.next() {
            Some(h) => *h,
            None => return false,
        }
    };

    let mut fnode = first - 1;
    let mut snode = second - 1;
    while fnode & 1 == 1 {
        fnode >>= 1;
        snode >>= 1;
    }

    let mut fr = seed;
    let mut sr = seed;
    for c in path {
        if snode == 0 {
            return false;
        }
        if fnode & 1 == 1 || fnode == snode {
            fr = node_hash(c, &fr);
            sr = node_hash(c, &sr);
            while fnode & 1 == 0 && fnode != 0 {
                fnode >>= 1;
                snode >>= 1;
            }
        } else {
            sr = node_hash(&sr, c);
        }
        fnode >>= 1;
        snode >>= 1;
    }
    snode == 0 && fr == *root1 && sr == *root2
}
