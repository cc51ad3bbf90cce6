// src/map/domain_map.rs
//! The composite authenticated structure.
//!
//! A `DomainMap` joins the sparse tree over domains, the source tree and the
//! per-domain trees under a single signed head. It is the only place that
//! commits store nodes or signs; the worker drives it through the write API
//! while readers use the proof getters concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use p256::ecdsa::VerifyingKey;
use parking_lot::{Mutex, RwLock};

use super::domain_tree::{DomainTree, DomainTreeEntry, DomainTreeRoot};
use super::head::{MapHead, LogRevision, SignedMapHead, VERSION};
use super::source_tree::SourceTree;
use crate::error::{MapError, MapResult};
use crate::keys::MapSigner;
use crate::mapstore::{MemStore, StagedStore};
use crate::merkle::{Hash, HASH_SIZE};
use crate::normalize::normalize_domain_name;
use crate::smt::SparseMerkleTree;

/// A (non-)membership proof for a domain. `audit_path` is ordered leaf to
/// root; `leaf_hash` is the placeholder for membership proofs and for empty
/// slots, or the foreign leaf body occupying the queried slot.
#[derive(Debug, Clone)]
pub struct DomainProof {
    pub audit_path: Vec<Hash>,
    pub leaf_hash: Vec<u8>,
}

struct Inner {
    smh: SignedMapHead,
    smhs: HashMap<u64, SignedMapHead>,
    subtrees: HashMap<String, Arc<DomainTree>>,
}

pub struct DomainMap {
    // guarded by `inner`: head state and the domain-tree set
    inner: RwLock<Inner>,

    // Serializes check_and_publish_smh. Always acquired before `inner`.
    publish_lock: Mutex<()>,

    // internally thread-safe
    sparse_store: Arc<StagedStore<MemStore>>,
    sparse_tree: SparseMerkleTree<MemStore>,
    source_tree: SourceTree,
    signer: MapSigner,
}

impl DomainMap {
    /// Create a map that starts with the unsigned empty SMH.
    pub fn new(signer: MapSigner) -> Self {
        let sparse_store = Arc::new(StagedStore::new(HASH_SIZE, MemStore::new()));
        DomainMap {
            inner: RwLock::new(Inner {
                smh: SignedMapHead::empty(),
                smhs: HashMap::new(),
                subtrees: HashMap::new(),
            }),
            publish_lock: Mutex::new(()),
            sparse_tree: SparseMerkleTree::new(Arc::clone(&sparse_store)),
            sparse_store,
            source_tree: SourceTree::new(),
            signer,
        }
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signer.public_key()
    }

    pub fn source_tree(&self) -> &SourceTree {
        &self.source_tree
    }

    /// Number of nodes currently held by the sparse store.
    pub fn store_size(&self) -> usize {
        self.sparse_store.len()
    }

    /// The latest SMH (the unsigned empty head until the first publish).
    pub fn get_latest_smh(&self) -> SignedMapHead {
        self.inner.read().smh.clone()
    }

    /// The SMH published for `map_size`, if any.
    pub fn get_smh(&self, map_size: u64) -> Option<SignedMapHead> {
        self.inner.read().smhs.get(&map_size).cloned()
    }

    fn get_domain(&self, root: &Hash, domain: &str) -> MapResult<Vec<u8>> {
        let normalized = normalize_domain_name(domain)?;
        let _guard = self.inner.read();
        match self.sparse_tree.get_for_root(normalized.as_bytes(), root) {
            Ok(data) => Ok(data),
            // Published roots always resolve; anything else is store corruption.
            Err(e) => panic!("unexpected error fetching domain {normalized:?} from map store: {e}"),
        }
    }

    /// Whether `domain` has a recorded tree at `root`.
    pub fn has_domain(&self, root: &Hash, domain: &str) -> MapResult<bool> {
        Ok(!self.get_domain(root, domain)?.is_empty())
    }

    /// The domain's tree root at `root`; a domain with no certificates reads
    /// as size 0 with the empty-log root.
    pub fn get_domain_tree_root(&self, root: &Hash, domain: &str) -> MapResult<DomainTreeRoot> {
        let data = self.get_domain(root, domain)?;
        if data.is_empty() {
            return Ok(DomainTreeRoot::empty());
        }
        match DomainTreeRoot::decode(&data) {
            Ok(dtr) => Ok(dtr),
            Err(e) => panic!("invalid domain tree root in map store: {e}"),
        }
    }

    /// (Non-)membership proof for `domain` at `root`, side nodes reversed to
    /// leaf-to-root wire order.
    pub fn get_proof_for_domain(&self, root: &Hash, domain: &str) -> MapResult<DomainProof> {
        let normalized = normalize_domain_name(domain)?;
        let _guard = self.inner.read();
        let mut proof = self.sparse_tree.prove_for_root(normalized.as_bytes(), root)?;
        proof.side_nodes.reverse();

        let leaf_hash = proof
            .non_membership_leaf
            .unwrap_or_else(|| self.sparse_store.placeholder().to_vec());
        Ok(DomainProof { audit_path: proof.side_nodes, leaf_hash })
    }

    /// Register a domain tree so that it can be found through
    /// [`DomainMap::get_domain_tree`]. The tree only becomes part of the
    /// sparse tree once [`DomainMap::update_domain_tree_root`] is called.
    pub fn add_domain_tree(&self, tree: Arc<DomainTree>) -> MapResult<()> {
        let normalized = normalize_domain_name(tree.domain_name())?;
        if normalized != tree.domain_name() {
            return Err(MapError::validation(
                "invalid domain tree: its domain name is not normalized",
            ));
        }

        let mut inner = self.inner.write();
        if inner.subtrees.contains_key(&normalized) {
            return Err(MapError::validation(format!(
                "domain tree already exists for {normalized:?}"
            )));
        }
        inner.subtrees.insert(normalized, tree);
        Ok(())
    }

    /// The domain tree for `domain`, after normalization.
    pub fn get_domain_tree(&self, domain: &str) -> MapResult<Arc<DomainTree>> {
        let normalized = normalize_domain_name(domain)?;
        self.inner
            .read()
            .subtrees
            .get(&normalized)
            .cloned()
            .ok_or_else(|| {
                MapError::validation(format!(
                    "no such domain name {domain:?} (after normalization: {normalized:?})"
                ))
            })
    }

    /// Number of registered domain trees.
    pub fn domain_tree_count(&self) -> usize {
        self.inner.read().subtrees.len()
    }

    /// Index of `entry` in the domain tree for `domain`.
    pub fn entry_to_domain_tree_index(&self, entry: DomainTreeEntry, domain: &str) -> MapResult<u64> {
        self.get_domain_tree(domain)?.entry_to_domain_tree_index(entry)
    }

    /// Record the domain's tree root at `tree_size` in the sparse tree,
    /// returning the new map root. The recorded size must strictly grow.
    pub fn update_domain_tree_root(
        &self,
        root: &Hash,
        domain: &str,
        tree_size: u64,
    ) -> MapResult<Hash> {
        let normalized = normalize_domain_name(domain)?;
        let dtree = self.get_domain_tree(&normalized)?;
        let tree_root = dtree.get_root(tree_size)?;

        let old = self.get_domain_tree_root(root, &normalized)?;
        if old.domain_tree_size >= tree_size {
            return Err(MapError::consistency(format!(
                "invalid domain tree root update for {normalized:?}: cannot go back in time \
                 (current size: {}, proposed size: {tree_size})",
                old.domain_tree_size
            )));
        }

        let value = tree_root.encode();
        let _guard = self.inner.write();
        Ok(self.sparse_tree.update_for_root(normalized.as_bytes(), &value, root)?)
    }

    /// Validate and publish a new SMH for `root`. Only one publish runs at a
    /// time; the sparse store is committed (and orphans pruned) only after
    /// the head has been signed, so a failed publish leaves no trace.
    pub fn check_and_publish_smh(
        &self,
        root: &[u8],
        map_size: u64,
        source_revisions: &[LogRevision],
    ) -> MapResult<()> {
        if root.len() != HASH_SIZE {
            return Err(MapError::validation(format!(
                "invalid map root hash: length={}, expected {HASH_SIZE}",
                root.len()
            )));
        }
        let mut root_hash = [0u8; HASH_SIZE];
        root_hash.copy_from_slice(root);

        let _publish_guard = self.publish_lock.lock();
        // To avoid deadlocks, `inner` is never locked before this point.

        let current = self.get_latest_smh();
        let is_republish = root_hash == current.head.map_root_hash;

        if is_republish && map_size != current.head.map_size {
            return Err(MapError::validation(format!(
                "invalid map size for republish: new map size ({map_size}) != current map size ({})",
                current.head.map_size
            )));
        } else if !is_republish && map_size <= current.head.map_size {
            return Err(MapError::consistency(format!(
                "invalid map size for new map root: new map size ({map_size}) <= current map size ({})",
                current.head.map_size
            )));
        }

        let current_revs = &current.head.source_log_revisions;
        if is_republish && source_revisions.len() != current_revs.len() {
            return Err(MapError::validation(format!(
                "invalid source logs for republish: new source log count ({}) != current source log count ({})",
                source_revisions.len(),
                current_revs.len()
            )));
        } else if !is_republish && source_revisions.len() < current_revs.len() {
            return Err(MapError::consistency(format!(
                "invalid source logs: new source log count ({}) < current source log count ({})",
                source_revisions.len(),
                current_revs.len()
            )));
        }

        for (i, current_rev) in current_revs.iter().enumerate() {
            let new_rev = &source_revisions[i];
            if is_republish && new_rev.tree_size != current_rev.tree_size {
                return Err(MapError::validation(format!(
                    "invalid source log size for republish (log {i}): new size ({}) != current size ({})",
                    new_rev.tree_size, current_rev.tree_size
                )));
            } else if !is_republish && new_rev.tree_size < current_rev.tree_size {
                return Err(MapError::consistency(format!(
                    "invalid source log size (log {i}): new size ({}) < current size ({})",
                    new_rev.tree_size, current_rev.tree_size
                )));
            }
        }

        let head = if is_republish {
            let mut head = current.head.clone();
            head.timestamp = Utc::now().timestamp() as u64;
            head
        } else {
            let source_tree_root_hash = if source_revisions.len() == current_revs.len() {
                current.head.source_tree_root_hash
            } else {
                self.source_tree.get_root(source_revisions.len() as u64)?
            };
            MapHead {
                version: VERSION,
                timestamp: Utc::now().timestamp() as u64,
                map_size,
                map_root_hash: root_hash,
                source_tree_root_hash,
                source_log_revisions: source_revisions.to_vec(),
            }
        };

        let encoded = head.encode()?;
        let signature = self.signer.sign(&encoded);
        let smh = SignedMapHead { head, map_head_signature: signature };

        // Orphan nodes are deleted at the last possible moment, so the store
        // is only modified if the SMH update succeeds.
        if !is_republish {
            self.sparse_store.save_nodes_for_root(root)?;
        }

        let mut inner = self.inner.write();
        inner.smhs.insert(smh.head.map_size, smh.clone());
        inner.smh = smh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use crate::merkle::empty_root;
    use crate::smt;

    fn new_map() -> DomainMap {
        let dir = tempfile::tempdir().unwrap();
        let signer = keys::load_or_generate_keys(
            &dir.path().join("priv.pem"),
            &dir.path().join("pub.pem"),
        )
        .unwrap();
        DomainMap::new(signer)
    }

    fn rev(tree_size: u64, b: u8) -> LogRevision {
        LogRevision { tree_size, root_hash: [b; 32] }
    }

    #[test]
    fn empty_map_head() {
        let dm = new_map();
        let smh = dm.get_latest_smh();
        assert_eq!(smh.head.map_size, 0);
        assert_eq!(smh.head.map_root_hash, [0; 32]);
        assert_eq!(smh.head.source_tree_root_hash, [0; 32]);
        assert!(smh.head.source_log_revisions.is_empty());
        assert!(smh.map_head_signature.is_empty());
    }

    #[test]
    fn empty_map_republish_is_signed() {
        let dm = new_map();
        dm.check_and_publish_smh(&[0; 32], 0, &[]).unwrap();
        let smh = dm.get_latest_smh();
        assert_eq!(smh.head.map_size, 0);
        smh.verify(&dm.public_key()).unwrap();
        assert_eq!(dm.get_smh(0).unwrap(), smh);
    }

    #[test]
    fn unknown_domain_reads_empty() {
        let dm = new_map();
        let root = [0u8; 32];
        let dtr = dm.get_domain_tree_root(&root, "nowhere.test").unwrap();
        assert_eq!(dtr.domain_tree_size, 0);
        assert_eq!(dtr.domain_tree_root_hash, empty_root());
        assert!(!dm.has_domain(&root, "nowhere.test").unwrap());
    }

    fn grow_domain(dm: &DomainMap, root: &Hash, domain: &str, entries: &[(u64, u64)]) -> Hash {
        let tree = match dm.get_domain_tree(domain) {
            Ok(t) => t,
            Err(_) => {
                let t = Arc::new(DomainTree::new(domain).unwrap());
                dm.add_domain_tree(Arc::clone(&t)).unwrap();
                t
            }
        };
        let mut size = 0;
        for &(log_index, cert_index) in entries {
            size = tree.add_entry(DomainTreeEntry { log_index, cert_index }).unwrap();
        }
        dm.update_domain_tree_root(root, domain, size).unwrap()
    }

    #[test]
    fn update_and_publish_new_head() {
        let dm = new_map();
        dm.source_tree().add_entry([7; 32]);

        let root = grow_domain(&dm, &[0; 32], "example-1.com", &[(0, 0)]);
        dm.check_and_publish_smh(&root, 1, &[rev(1, 0xaa)]).unwrap();

        let smh = dm.get_latest_smh();
        assert_eq!(smh.head.map_size, 1);
        assert_eq!(smh.head.map_root_hash, root);
        assert_eq!(smh.head.source_log_revisions, vec![rev(1, 0xaa)]);
        assert_eq!(smh.head.source_tree_root_hash, dm.source_tree().get_root(1).unwrap());
        smh.verify(&dm.public_key()).unwrap();

        let dtr = dm.get_domain_tree_root(&root, "example-1.com").unwrap();
        assert_eq!(dtr.domain_tree_size, 1);
    }

    #[test]
    fn domain_proof_roundtrip() {
        let dm = new_map();
        dm.source_tree().add_entry([7; 32]);
        let root = grow_domain(&dm, &[0; 32], "example-1.com", &[(0, 0), (0, 2)]);
        dm.check_and_publish_smh(&root, 3, &[rev(3, 0xaa)]).unwrap();

        // Membership: rebuild the root from the proof and the recorded value.
        let dtr = dm.get_domain_tree_root(&root, "example-1.com").unwrap();
        let proof = dm.get_proof_for_domain(&root, "example-1.com").unwrap();
        assert!(smt::verify_proof(
            &proof.audit_path,
            &proof.leaf_hash,
            b"example-1.com",
            Some(&dtr.encode()),
            &root
        ));

        // Non-membership for a domain that was never inserted.
        let proof = dm.get_proof_for_domain(&root, "does-not-exist.invalid").unwrap();
        assert!(smt::verify_proof(
            &proof.audit_path,
            &proof.leaf_hash,
            b"does-not-exist.invalid",
            None,
            &root
        ));
    }

    #[test]
    fn domain_tree_size_cannot_regress() {
        let dm = new_map();
        let root = grow_domain(&dm, &[0; 32], "example.com", &[(0, 0), (0, 1)]);
        // Recording a smaller (or equal) size for the same domain is refused.
        let err = dm.update_domain_tree_root(&root, "example.com", 1).unwrap_err();
        assert!(matches!(err, MapError::Consistency(_)));
        let err = dm.update_domain_tree_root(&root, "example.com", 2).unwrap_err();
        assert!(matches!(err, MapError::Consistency(_)));
    }

    #[test]
    fn publish_validation_table() {
        let dm = new_map();
        dm.source_tree().add_entry([7; 32]);
        let root = grow_domain(&dm, &[0; 32], "example.com", &[(0, 0)]);
        dm.check_and_publish_smh(&root, 1, &[rev(1, 0xaa)]).unwrap();

        // New root must strictly grow the map size.
        let root2 = grow_domain(&dm, &root, "example.com", &[(0, 5)]);
        assert!(dm.check_and_publish_smh(&root2, 1, &[rev(1, 0xaa)]).is_err());
        // Republish must keep the map size.
        assert!(dm.check_and_publish_smh(&root, 2, &[rev(1, 0xaa)]).is_err());
        // Republish must keep revision count and sizes.
        assert!(dm
            .check_and_publish_smh(&root, 1, &[rev(1, 0xaa), rev(1, 0xbb)])
            .is_err());
        assert!(dm.check_and_publish_smh(&root, 1, &[rev(2, 0xaa)]).is_err());
        // Source log sizes cannot shrink on a new head.
        assert!(dm.check_and_publish_smh(&root2, 2, &[rev(0, 0xaa)]).is_err());
        // Nothing was persisted by the failed attempts.
        assert_eq!(dm.get_latest_smh().head.map_size, 1);

        // And the valid follow-up still goes through.
        dm.check_and_publish_smh(&root2, 2, &[rev(2, 0xab)]).unwrap();
        assert_eq!(dm.get_latest_smh().head.map_size, 2);
    }

    #[test]
    fn republish_keeps_fields_and_advances_timestamp() {
        let dm = new_map();
        dm.source_tree().add_entry([7; 32]);
        let root = grow_domain(&dm, &[0; 32], "example.com", &[(0, 0)]);
        dm.check_and_publish_smh(&root, 1, &[rev(1, 0xaa)]).unwrap();
        let first = dm.get_latest_smh();

        dm.check_and_publish_smh(&root, 1, &[rev(1, 0xaa)]).unwrap();
        let second = dm.get_latest_smh();
        assert_eq!(second.head.map_root_hash, first.head.map_root_hash);
        assert_eq!(second.head.map_size, first.head.map_size);
        assert_eq!(second.head.source_log_revisions, first.head.source_log_revisions);
        assert!(second.head.timestamp >= first.head.timestamp);
        second.verify(&dm.public_key()).unwrap();
    }

    #[test]
    fn snapshot_isolation_across_publishes() {
        let dm = new_map();
        dm.source_tree().add_entry([7; 32]);
        let root1 = grow_domain(&dm, &[0; 32], "example.com", &[(0, 0)]);
        dm.check_and_publish_smh(&root1, 1, &[rev(1, 0xaa)]).unwrap();

        let root2 = grow_domain(&dm, &root1, "example.com", &[(0, 3), (0, 4)]);
        dm.check_and_publish_smh(&root2, 3, &[rev(3, 0xab)]).unwrap();

        // The old published root still reads the old value (I5), even after
        // the commit pruned orphans.
        let old = dm.get_domain_tree_root(&root1, "example.com").unwrap();
        assert_eq!(old.domain_tree_size, 1);
        let new = dm.get_domain_tree_root(&root2, "example.com").unwrap();
        assert_eq!(new.domain_tree_size, 3);
    }

    #[test]
    fn add_domain_tree_rejects_duplicates_and_unnormalized() {
        let dm = new_map();
        let tree = Arc::new(DomainTree::new("example.com").unwrap());
        dm.add_domain_tree(tree).unwrap();
        let dup = Arc::new(DomainTree::new("www.example.com").unwrap());
        assert!(dm.add_domain_tree(dup).is_err());
    }
}
