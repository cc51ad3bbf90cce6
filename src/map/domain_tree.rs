// src/map/domain_tree.rs
//! Per-domain certificate trees.
//!
//! A domain tree is an RFC 6962 log whose leaves point into the source CT
//! logs. Entries for a given log must arrive in strictly increasing
//! certificate-index order (the fetcher sorts before submitting), which keeps
//! the per-log auxiliary index binary-searchable.

use parking_lot::RwLock;

use crate::error::{MapError, MapResult};
use crate::merkle::{empty_root, Hash, MerkleTree};
use crate::normalize::normalize_domain_name;

/// A pointer to a certificate: index of the CT log in the source tree, and
/// the certificate's index within that log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainTreeEntry {
    pub log_index: u64,
    pub cert_index: u64,
}

impl DomainTreeEntry {
    /// Leaf encoding: `u64 log_index || u64 cert_index`, big-endian.
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.log_index.to_be_bytes());
        out[8..].copy_from_slice(&self.cert_index.to_be_bytes());
        out
    }
}

/// A snapshot of a domain tree; this is the value stored in the sparse tree
/// under the domain name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainTreeRoot {
    pub domain_tree_size: u64,
    pub domain_tree_root_hash: Hash,
}

impl DomainTreeRoot {
    /// The root recorded for a domain with no certificates: size 0 and the
    /// RFC 6962 empty-tree root.
    pub fn empty() -> Self {
        DomainTreeRoot { domain_tree_size: 0, domain_tree_root_hash: empty_root() }
    }

    /// `u64 size || 32-byte root hash`, big-endian.
    pub fn encode(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..8].copy_from_slice(&self.domain_tree_size.to_be_bytes());
        out[8..].copy_from_slice(&self.domain_tree_root_hash);
        out
    }

    pub fn decode(data: &[u8]) -> MapResult<Self> {
        if data.len() != 40 {
            return Err(MapError::validation(format!(
                "invalid domain tree root encoding: expected 40 bytes, got {}",
                data.len()
            )));
        }
        let mut size = [0u8; 8];
        size.copy_from_slice(&data[..8]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&data[8..]);
        Ok(DomainTreeRoot {
            domain_tree_size: u64::from_be_bytes(size),
            domain_tree_root_hash: hash,
        })
    }
}

// Aux index entry: where a certificate of a given source log landed.
#[derive(Debug, Clone, Copy)]
struct CertPointer {
    cert_index: u64,
    domain_tree_index: u64,
}

struct Inner {
    leaves: Vec<DomainTreeEntry>,
    // per_log[log_index] is sorted by cert_index
    per_log: Vec<Vec<CertPointer>>,
}

pub struct DomainTree {
    domain_name: String,
    tree: MerkleTree,
    inner: RwLock<Inner>,
}

impl DomainTree {
    /// Create a tree for `domain` (normalized on entry).
    pub fn new(domain: &str) -> MapResult<Self> {
        let domain_name = normalize_domain_name(domain)?;
        Ok(DomainTree {
            domain_name,
            tree: MerkleTree::new(),
            inner: RwLock::new(Inner { leaves: Vec::new(), per_log: Vec::new() }),
        })
    }

    /// The normalized domain this tree belongs to.
    pub fn domain_name(&self) -> &str {
        &self.domain_name
    }

    pub fn size(&self) -> u64 {
        self.inner.read().leaves.len() as u64
    }

    /// Append an entry and return the new tree size. Entries for one source
    /// log must strictly increase in `cert_index`.
    pub fn add_entry(&self, entry: DomainTreeEntry) -> MapResult<u64> {
        let mut inner = self.inner.write();

        while inner.per_log.len() <= entry.log_index as usize {
            inner.per_log.push(Vec::new());
        }
        if let Some(last) = inner.per_log[entry.log_index as usize].last() {
            if last.cert_index >= entry.cert_index {
                return Err(MapError::consistency(format!(
                    "out-of-order certificate index {} for log {} in domain tree {:?} (last: {})",
                    entry.cert_index, entry.log_index, self.domain_name, last.cert_index
                )));
            }
        }

        self.tree.append(&entry.encode());
        inner.leaves.push(entry);
        let domain_tree_index = inner.leaves.len() as u64 - 1;
        inner.per_log[entry.log_index as usize]
            .push(CertPointer { cert_index: entry.cert_index, domain_tree_index });
        Ok(inner.leaves.len() as u64)
    }

    /// The [`DomainTreeRoot`] at the given (past or current) size.
    pub fn get_root(&self, tree_size: u64) -> MapResult<DomainTreeRoot> {
        let root_hash = self.tree.root_at(tree_size)?;
        Ok(DomainTreeRoot { domain_tree_size: tree_size, domain_tree_root_hash: root_hash })
    }

    /// Entries in the inclusive interval `[start, end]`.
    pub fn get_entries(&self, start: u64, end: u64) -> MapResult<Vec<DomainTreeEntry>> {
        if start > end {
            return Err(MapError::validation(format!(
                "invalid interval: start ({start}) > end ({end})"
            )));
        }
        let inner = self.inner.read();
        if end >= inner.leaves.len() as u64 {
            return Err(MapError::validation(format!(
                "invalid interval: end ({end}) >= tree size ({})",
                inner.leaves.len()
            )));
        }
        Ok(inner.leaves[start as usize..=end as usize].to_vec())
    }

    /// The entry at `index` plus its audit path against the root at `tree_size`.
    pub fn get_entry_and_proof(
        &self,
        tree_size: u64,
        index: u64,
    ) -> MapResult<(DomainTreeEntry, Vec<Hash>)> {
        let entries = self.get_entries(index, index)?;
        let proof = self.tree.inclusion_proof(tree_size, index)?;
        Ok((entries[0], proof))
    }

    pub fn get_audit_proof(&self, tree_size: u64, index: u64) -> MapResult<Vec<Hash>> {
        self.tree.inclusion_proof(tree_size, index)
    }

    pub fn get_consistency_proof(&self, first: u64, second: u64) -> MapResult<Vec<Hash>> {
        self.tree.consistency_proof(first, second)
    }

    /// Position of `entry` in this tree, found by binary search over the
    /// per-log index.
    pub fn entry_to_domain_tree_index(&self, entry: DomainTreeEntry) -> MapResult<u64> {
        let inner = self.inner.read();
        let pointers = inner
            .per_log
            .get(entry.log_index as usize)
            .ok_or_else(|| missing_entry(&entry))?;
        let i = pointers
            .binary_search_by_key(&entry.cert_index, |p| p.cert_index)
            .map_err(|_| missing_entry(&entry))?;
        Ok(pointers[i].domain_tree_index)
    }
}

fn missing_entry(entry: &DomainTreeEntry) -> MapError {
    MapError::validation(format!(
        "no entry with log index {} and certificate index {} found",
        entry.log_index, entry.cert_index
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle;

    fn entry(log_index: u64, cert_index: u64) -> DomainTreeEntry {
        DomainTreeEntry { log_index, cert_index }
    }

    #[test]
    fn name_is_normalized() {
        let tree = DomainTree::new("WWW.Example.COM").unwrap();
        assert_eq!(tree.domain_name(), "example.com");
    }

    #[test]
    fn append_and_index() {
        let tree = DomainTree::new("example.com").unwrap();
        assert_eq!(tree.add_entry(entry(0, 0)).unwrap(), 1);
        assert_eq!(tree.add_entry(entry(0, 3)).unwrap(), 2);
        assert_eq!(tree.add_entry(entry(1, 1)).unwrap(), 3);

        assert_eq!(tree.entry_to_domain_tree_index(entry(0, 0)).unwrap(), 0);
        assert_eq!(tree.entry_to_domain_tree_index(entry(0, 3)).unwrap(), 1);
        assert_eq!(tree.entry_to_domain_tree_index(entry(1, 1)).unwrap(), 2);
        assert!(tree.entry_to_domain_tree_index(entry(0, 1)).is_err());
        assert!(tree.entry_to_domain_tree_index(entry(2, 0)).is_err());
    }

    #[test]
    fn per_log_order_is_enforced() {
        let tree = DomainTree::new("example.com").unwrap();
        tree.add_entry(entry(0, 5)).unwrap();
        assert!(tree.add_entry(entry(0, 5)).is_err());
        assert!(tree.add_entry(entry(0, 2)).is_err());
        // A different log starts its own sequence.
        tree.add_entry(entry(1, 0)).unwrap();
    }

    #[test]
    fn entry_proof_verifies() {
        let tree = DomainTree::new("example.com").unwrap();
        for i in 0..4 {
            tree.add_entry(entry(0, i)).unwrap();
        }
        let root = tree.get_root(4).unwrap();
        let (e, proof) = tree.get_entry_and_proof(4, 1).unwrap();
        assert_eq!(e, entry(0, 1));
        assert!(merkle::verify_inclusion(
            &merkle::leaf_hash(&e.encode()),
            1,
            4,
            &proof,
            &root.domain_tree_root_hash
        ));
    }

    #[test]
    fn empty_root_constant() {
        assert_eq!(DomainTreeRoot::empty().domain_tree_size, 0);
        assert_eq!(DomainTreeRoot::empty().domain_tree_root_hash, merkle::empty_root());
        let tree = DomainTree::new("example.com").unwrap();
        assert_eq!(tree.get_root(0).unwrap(), DomainTreeRoot::empty());
    }

    #[test]
    fn root_encoding_roundtrip() {
        let root = DomainTreeRoot { domain_tree_size: 7, domain_tree_root_hash: [0xcd; 32] };
        let encoded = root.encode();
        assert_eq!(DomainTreeRoot::decode(&encoded).unwrap(), root);
        assert!(DomainTreeRoot::decode(&encoded[..39]).is_err());
    }
}
