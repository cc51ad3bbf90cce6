// src/smt.rs
//! Sparse merkle tree over the content-addressed store.
//!
//! Keys are placed at the path `sha256(key)`, giving a fixed 256-level key
//! space in which almost every slot is empty. Empty subtrees are the
//! all-zero placeholder and are never materialized; a leaf is stored at the
//! depth where its path diverges from every other occupied path, and its
//! body commits to the full path, so shallow placement is sound.
//!
//! Updates are copy-on-write: a new chain of nodes from leaf to root is
//! written and the previous root stays valid, which is how per-root
//! (historical) reads and proofs work.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::mapstore::{Base, StagedStore, LEAF_PREFIX, NODE_PREFIX};
use crate::merkle::{Hash, HASH_SIZE};

/// Tree depth: one level per bit of the 32-byte path.
pub const DEPTH: usize = 8 * HASH_SIZE;

/// The all-zero hash denoting an empty subtree.
pub const PLACEHOLDER: Hash = [0u8; HASH_SIZE];

/// A (non-)membership proof as produced by [`SparseMerkleTree::prove_for_root`].
/// Side nodes are ordered root to leaf; the wire format reverses them.
#[derive(Debug, Clone)]
pub struct SmtProof {
    pub side_nodes: Vec<Hash>,
    /// For a non-membership proof where the queried slot is occupied by a
    /// leaf with a different path, the body of that leaf.
    pub non_membership_leaf: Option<Vec<u8>>,
}

pub fn hash_bytes(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// The leaf slot for a key.
pub fn key_path(key: &[u8]) -> Hash {
    hash_bytes(key)
}

fn digest_leaf(path: &Hash, value_hash: &Hash) -> (Hash, Vec<u8>) {
    let mut body = Vec::with_capacity(1 + 2 * HASH_SIZE);
    body.push(LEAF_PREFIX);
    body.extend_from_slice(path);
    body.extend_from_slice(value_hash);
    (hash_bytes(&body), body)
}

fn digest_node(left: &Hash, right: &Hash) -> (Hash, Vec<u8>) {
    let mut body = Vec::with_capacity(1 + 2 * HASH_SIZE);
    body.push(NODE_PREFIX);
    body.extend_from_slice(left);
    body.extend_from_slice(right);
    (hash_bytes(&body), body)
}

fn is_leaf(body: &[u8]) -> bool {
    !body.is_empty() && body[0] == LEAF_PREFIX
}

fn parse_node(body: &[u8]) -> Result<(Hash, Hash), StoreError> {
    if body.len() != 1 + 2 * HASH_SIZE || body[0] != NODE_PREFIX {
        return Err(StoreError::MalformedNode {
            key: String::new(),
            reason: format!("not an interior node body ({} bytes)", body.len()),
        });
    }
    let mut left = [0u8; HASH_SIZE];
    let mut right = [0u8; HASH_SIZE];
    left.copy_from_slice(&body[1..1 + HASH_SIZE]);
    right.copy_from_slice(&body[1 + HASH_SIZE..]);
    Ok((left, right))
}

/// Leaf body -> (path, value hash).
pub fn parse_leaf(body: &[u8]) -> Result<(Hash, Hash), StoreError> {
    if body.len() != 1 + 2 * HASH_SIZE || body[0] != LEAF_PREFIX {
        return Err(StoreError::MalformedNode {
            key: String::new(),
            reason: format!("not a leaf body ({} bytes)", body.len()),
        });
    }
    let mut path = [0u8; HASH_SIZE];
    let mut value_hash = [0u8; HASH_SIZE];
    path.copy_from_slice(&body[1..1 + HASH_SIZE]);
    value_hash.copy_from_slice(&body[1 + HASH_SIZE..]);
    Ok((path, value_hash))
}

// Bit i of the path, MSB first. true = right.
fn bit(path: &Hash, i: usize) -> bool {
    path[i / 8] & (1 << (7 - i % 8)) != 0
}

fn common_prefix_len(a: &Hash, b: &Hash) -> usize {
    for i in 0..DEPTH {
        if bit(a, i) != bit(b, i) {
            return i;
        }
    }
    DEPTH
}

pub struct SparseMerkleTree<B: Base> {
    store: Arc<StagedStore<B>>,
}

impl<B: Base> SparseMerkleTree<B> {
    pub fn new(store: Arc<StagedStore<B>>) -> Self {
        SparseMerkleTree { store }
    }

    /// Root of the empty tree.
    pub fn empty_root() -> Hash {
        PLACEHOLDER
    }

    // Walk from `root` towards `path`. Returns the side nodes recorded on the
    // way down (top-down, a contiguous prefix of the 256 levels) and the leaf
    // body the walk ended on, if any.
    fn side_nodes_for_root(
        &self,
        path: &Hash,
        root: &Hash,
    ) -> Result<(Vec<Option<Hash>>, Option<Vec<u8>>), StoreError> {
        let mut side_nodes: Vec<Option<Hash>> = vec![None; DEPTH];
        if *root == PLACEHOLDER {
            return Ok((side_nodes, None));
        }

        let mut current = self.store.get(root)?;
        if is_leaf(&current) {
            return Ok((side_nodes, Some(current)));
        }

        for i in 0..DEPTH {
            let (left, right) = parse_node(&current)?;
            let (next, sibling) = if bit(path, i) { (right, left) } else { (left, right) };
            side_nodes[i] = Some(sibling);

            if next == PLACEHOLDER {
                return Ok((side_nodes, None));
            }
            current = self.store.get(&next)?;
            if is_leaf(&current) {
                return Ok((side_nodes, Some(current)));
            }
        }
        // 256 levels of interior nodes would require a path collision.
        Err(StoreError::MalformedNode {
            key: hex::encode(root),
            reason: "interior chain exceeds tree depth".to_string(),
        })
    }

    /// Value stored under `key` in the tree identified by `root`, or empty.
    pub fn get_for_root(&self, key: &[u8], root: &Hash) -> Result<Vec<u8>, StoreError> {
        let path = key_path(key);
        if *root == PLACEHOLDER {
            return Ok(Vec::new());
        }

        let mut current = self.store.get(root)?;
        for i in 0..=DEPTH {
            if is_leaf(&current) {
                let (leaf_path, value_hash) = parse_leaf(&current)?;
                if leaf_path != path {
                    return Ok(Vec::new());
                }
                return self.store.get(&value_hash);
            }
            if i == DEPTH {
                break;
            }
            let (left, right) = parse_node(&current)?;
            let next = if bit(&path, i) { right } else { left };
            if next == PLACEHOLDER {
                return Ok(Vec::new());
            }
            current = self.store.get(&next)?;
        }
        Err(StoreError::MalformedNode {
            key: hex::encode(root),
            reason: "interior chain exceeds tree depth".to_string(),
        })
    }

    /// Write `value` under `key` against the tree identified by `root` and
    /// return the new root. The old root remains readable.
    pub fn update_for_root(&self, key: &[u8], value: &[u8], root: &Hash) -> Result<Hash, StoreError> {
        let path = key_path(key);
        let (side_nodes, old_leaf) = self.side_nodes_for_root(&path, root)?;

        // Values live in the same store, keyed by their hash.
        let value_hash = hash_bytes(value);
        self.store.set(&value_hash, value)?;

        let (mut current_hash, leaf_body) = digest_leaf(&path, &value_hash);
        self.store.set(&current_hash, &leaf_body)?;

        // When the walk ended on a leaf with a different path, the two
        // leaves are joined where their paths first diverge; the levels in
        // between get placeholder siblings.
        let common_prefix = match &old_leaf {
            None => DEPTH,
            Some(body) => {
                let (old_path, _) = parse_leaf(body)?;
                common_prefix_len(&path, &old_path)
            }
        };
        if common_prefix != DEPTH {
            let old_body = old_leaf.as_deref().unwrap_or_default();
            let old_hash = hash_bytes(old_body);
            let (h, body) = if bit(&path, common_prefix) {
                digest_node(&old_hash, &current_hash)
            } else {
                digest_node(&current_hash, &old_hash)
            };
            self.store.set(&h, &body)?;
            current_hash = h;
        }

        for i in (0..DEPTH).rev() {
            let side = match side_nodes[i] {
                Some(s) => s,
                None => {
                    if common_prefix != DEPTH && common_prefix > i {
                        PLACEHOLDER
                    } else {
                        continue;
                    }
                }
            };
            let (h, body) = if bit(&path, i) {
                digest_node(&side, &current_hash)
            } else {
                digest_node(&current_hash, &side)
            };
            self.store.set(&h, &body)?;
            current_hash = h;
        }

        Ok(current_hash)
    }

    /// (Non-)membership proof for `key` against the tree at `root`.
    pub fn prove_for_root(&self, key: &[u8], root: &Hash) -> Result<SmtProof, StoreError> {
        let path = key_path(key);
        let (side_nodes, leaf) = self.side_nodes_for_root(&path, root)?;

        let non_membership_leaf = match leaf {
            Some(body) => {
                let (leaf_path, _) = parse_leaf(&body)?;
                if leaf_path == path {
                    None
                } else {
                    Some(body)
                }
            }
            None => None,
        };

        let side_nodes = side_nodes.into_iter().flatten().collect();
        Ok(SmtProof { side_nodes, non_membership_leaf })
    }
}

/// Verify a domain proof as published on the wire.
///
/// `audit_path` is ordered leaf to root. `leaf_hash` is either the 32-byte
/// placeholder or the body of the foreign leaf occupying the queried slot;
/// `value` is the leaf value the caller expects under `key` (`None` for a
/// non-membership check).
pub fn verify_proof(audit_path: &[Hash], leaf_hash: &[u8], key: &[u8], value: Option<&[u8]>, root: &Hash) -> bool {
    let path = key_path(key);

    let mut current: Hash = if leaf_hash == PLACEHOLDER.as_slice() {
        match value {
            Some(v) => digest_leaf(&path, &hash_bytes(v)).0,
            None => PLACEHOLDER,
        }
    } else {
        // Non-membership via a foreign leaf: it must really be foreign.
        match parse_leaf(leaf_hash) {
            Ok((leaf_path, _)) if leaf_path != path && value.is_none() => hash_bytes(leaf_hash),
            _ => return false,
        }
    };

    let n = audit_path.len();
    for (i, side) in audit_path.iter().enumerate() {
        current = if bit(&path, n - 1 - i) {
            digest_node(side, &current).0
        } else {
            digest_node(&current, side).0
        };
    }
    current == *root
}
