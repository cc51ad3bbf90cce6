// src/mapstore/staged.rs
//! Copy-on-write staging wrapper.
//!
//! Every `set` since the last commit is appended to an ordered staging list.
//! `save_nodes_for_root` marks the staged keys reachable from the given root,
//! commits the staged prefix up to and including the root (orphans deleted),
//! and truncates staging to the entries written after the root. Old roots
//! that were committed stay readable, which is what makes historical
//! sparse-tree snapshots work.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use super::{Base, KeyInfo, Visit, VisitResult, LEAF_PREFIX, NODE_PREFIX};
use crate::error::StoreError;

struct Staging {
    entries: Vec<KeyInfo>,
    index: HashMap<Vec<u8>, usize>,
}

pub struct StagedStore<B: Base> {
    base: B,
    hash_size: usize,
    placeholder: Vec<u8>,

    staging: Mutex<Staging>,
    // Excludes traversal while a prune rewrites the base store.
    traversal: RwLock<()>,
}

impl<B: Base> StagedStore<B> {
    pub fn new(hash_size: usize, base: B) -> Self {
        StagedStore {
            base,
            hash_size,
            placeholder: vec![0u8; hash_size],
            staging: Mutex::new(Staging {
                entries: Vec::new(),
                index: HashMap::new(),
            }),
            traversal: RwLock::new(()),
        }
    }

    pub fn hash_size(&self) -> usize {
        self.hash_size
    }

    /// The empty-subtree key: `hash_size` zero bytes.
    pub fn placeholder(&self) -> &[u8] {
        &self.placeholder
    }

    /// Get a node body. The placeholder key reads as empty.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        if key == self.placeholder {
            return Ok(Vec::new());
        }
        self.base.get(key)
    }

    /// Insert a node body and stage its key for the next commit. Writing an
    /// identical body again is a no-op and does not re-stage the key: the
    /// node is either already staged or already durable, and re-staging a
    /// durable node would expose it to pruning while older roots still
    /// reference it.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if key == self.placeholder {
            return Err(StoreError::CannotSetPlaceholder);
        }

        let mut staging = self.staging.lock();
        if let Ok(existing) = self.base.get(key) {
            if existing == value {
                return Ok(());
            }
            return Err(StoreError::KeyConflict(hex::encode(key)));
        }
        self.base.set(key, value)?;

        let pos = staging.entries.len();
        staging.index.insert(key.to_vec(), pos);
        staging.entries.push(KeyInfo { key: key.to_vec(), keep: false });
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.base.delete(key)
    }

    /// Number of nodes in the underlying store.
    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// DFS over the subtree rooted at `root`. `node_fn` receives
    /// `(hash, left, right)` and may return `Visit::SkipBranch` to skip the
    /// node's descendants; `leaf_fn` receives `(leaf_path, hash, value_hash)`
    /// and its `SkipBranch` is a no-op. Fails if any referenced node is
    /// missing (pruning races are excluded by the traversal lock).
    pub fn traverse_nodes(
        &self,
        root: &[u8],
        node_fn: &mut dyn FnMut(&[u8], &[u8], &[u8]) -> VisitResult,
        leaf_fn: &mut dyn FnMut(&[u8], &[u8], &[u8]) -> VisitResult,
    ) -> Result<(), StoreError> {
        let _guard = self.traversal.read();
        self.traverse_inner(root, node_fn, leaf_fn)
    }

    fn traverse_inner(
        &self,
        root: &[u8],
        node_fn: &mut dyn FnMut(&[u8], &[u8], &[u8]) -> VisitResult,
        leaf_fn: &mut dyn FnMut(&[u8], &[u8], &[u8]) -> VisitResult,
    ) -> Result<(), StoreError> {
        let data = self.get(root)?;

        if data.is_empty() {
            // empty subtree
            leaf_fn(&self.placeholder, root, &data)?;
            return Ok(());
        }

        let expected = 1 + 2 * self.hash_size;
        if data.len() != expected {
            return Err(StoreError::MalformedNode {
                key: hex::encode(root),
                reason: format!("expected length {expected}, got {}", data.len()),
            });
        }

        match data[0] {
            NODE_PREFIX => {
                let left = &data[1..1 + self.hash_size];
                let right = &data[1 + self.hash_size..];
                if node_fn(root, left, right)? == Visit::SkipBranch {
                    return Ok(());
                }
                let (left, right) = (left.to_vec(), right.to_vec());
                self.traverse_inner(&left, node_fn, leaf_fn)?;
                self.traverse_inner(&right, node_fn, leaf_fn)
            }
            LEAF_PREFIX => {
                let path = &data[1..1 + self.hash_size];
                let value_hash = &data[1 + self.hash_size..];
                leaf_fn(path, root, value_hash)?;
                Ok(())
            }
            other => Err(StoreError::MalformedNode {
                key: hex::encode(root),
                reason: format!("invalid node prefix {other:#04x}"),
            }),
        }
    }

    /// Commit all staged nodes reachable from `root` and delete the staged
    /// orphans written up to (and including) it. Entries staged after `root`
    /// stay staged for the next commit.
    pub fn save_nodes_for_root(&self, root: &[u8]) -> Result<(), StoreError> {
        let mut staging = self.staging.lock();

        // Mark phase: collect staged keys reachable from the root. Anything
        // not in the staging index was committed earlier and its subtree is
        // already durable, so the walk can stop there.
        let keep = RefCell::new(HashSet::<Vec<u8>>::new());
        {
            let index = &staging.index;
            let placeholder = &self.placeholder;
            let mark = |hash: &[u8]| -> VisitResult {
                if hash.is_empty() || hash == placeholder.as_slice() {
                    return Ok(Visit::SkipBranch);
                }
                if !index.contains_key(hash) {
                    return Ok(Visit::SkipBranch);
                }
                keep.borrow_mut().insert(hash.to_vec());
                Ok(Visit::Continue)
            };

            let mut node_fn = |hash: &[u8], _left: &[u8], _right: &[u8]| mark(hash);
            let mut leaf_fn = |_path: &[u8], hash: &[u8], value_hash: &[u8]| {
                mark(hash)?;
                mark(value_hash)
            };

            let _guard = self.traversal.read();
            self.traverse_inner(root, &mut node_fn, &mut leaf_fn)?;
        }
        let keep = keep.into_inner();

        // Prune phase: hand the staged prefix up to the root to the base
        // store, then truncate staging.
        let _guard = self.traversal.write();

        let root_idx = match staging.entries.iter().position(|e| e.key == root) {
            Some(i) => i,
            None => {
                warn!("root not found in staging list, pruning all staged nodes");
                if staging.entries.is_empty() {
                    return Ok(());
                }
                staging.entries.len() - 1
            }
        };

        let to_process: Vec<KeyInfo> = staging.entries[..=root_idx]
            .iter()
            .map(|e| KeyInfo {
                key: e.key.clone(),
                keep: keep.contains(&e.key),
            })
            .collect();

        self.base.process_keys(&to_process)?;

        staging.entries.drain(..=root_idx);
        staging.index.clear();
        let rebuilt: Vec<(Vec<u8>, usize)> = staging
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key.clone(), i))
            .collect();
        staging.index.extend(rebuilt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapstore::MemStore;

    // 4-byte hash size keeps the fixtures readable: node bodies are
    // prefix || left(4) || right(4), leaf bodies prefix || path(4) || vhash(4).
    struct Fixture {
        key: &'static [u8; 4],
        prefix: u8,
        a: &'static [u8; 4],
        b: &'static [u8; 4],
    }

    const CASES: &[Fixture] = &[
        Fixture { key: b"abcd", prefix: NODE_PREFIX, a: b"efgh", b: b"eeri" },
        Fixture { key: b"efgh", prefix: NODE_PREFIX, a: b"1e04", b: b"r2er" },
        Fixture { key: b"eeri", prefix: LEAF_PREFIX, a: b"1e05", b: b"r3er" },
        Fixture { key: b"pift", prefix: LEAF_PREFIX, a: b"asrg", b: b"4ysa" }, // orphan
        Fixture { key: b"1e04", prefix: LEAF_PREFIX, a: b"tyui", b: b"asdf" },
        Fixture { key: b"r2er", prefix: LEAF_PREFIX, a: b"cvbf", b: b"345h" },
        Fixture { key: b"adht", prefix: NODE_PREFIX, a: b"asxc", b: b"04ip" }, // orphan
    ];

    fn body(c: &Fixture) -> Vec<u8> {
        let mut v = vec![c.prefix];
        v.extend_from_slice(c.a);
        v.extend_from_slice(c.b);
        v
    }

    fn store_with<'a>(cases: impl Iterator<Item = &'a Fixture>) -> StagedStore<MemStore> {
        let ms = StagedStore::new(4, MemStore::new());
        for c in cases {
            ms.set(c.key, &body(c)).unwrap();
        }
        ms
    }

    #[test]
    fn set_and_get_roundtrip() {
        let ms = store_with(CASES.iter());
        assert_eq!(ms.len(), CASES.len());
        for c in CASES {
            assert_eq!(ms.get(c.key).unwrap(), body(c));
        }
    }

    #[test]
    fn placeholder_rules() {
        let ms = StagedStore::new(4, MemStore::new());
        assert!(matches!(
            ms.set(&[0; 4], b"\x00abcdwxyz"),
            Err(StoreError::CannotSetPlaceholder)
        ));
        assert_eq!(ms.get(&[0; 4]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn traversal_is_depth_first() {
        let ms = store_with(CASES.iter());

        let seen: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
        ms.traverse_nodes(
            b"abcd",
            &mut |hash, _, _| {
                seen.borrow_mut().push(hash.to_vec());
                Ok(Visit::Continue)
            },
            &mut |_, hash, _| {
                seen.borrow_mut().push(hash.to_vec());
                Ok(Visit::Continue)
            },
        )
        .unwrap();

        let expected: Vec<Vec<u8>> = [b"abcd", b"efgh", b"1e04", b"r2er", b"eeri"]
            .iter()
            .map(|k| k.to_vec())
            .collect();
        assert_eq!(seen.into_inner(), expected);
    }

    #[test]
    fn traversal_skip_branch() {
        let ms = store_with(CASES.iter());

        let seen: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
        ms.traverse_nodes(
            b"abcd",
            &mut |hash, _, _| {
                seen.borrow_mut().push(hash.to_vec());
                if hash == b"efgh" {
                    Ok(Visit::SkipBranch)
                } else {
                    Ok(Visit::Continue)
                }
            },
            &mut |_, hash, _| {
                seen.borrow_mut().push(hash.to_vec());
                Ok(Visit::Continue)
            },
        )
        .unwrap();

        let expected: Vec<Vec<u8>> = [b"abcd", b"efgh", b"eeri"]
            .iter()
            .map(|k| k.to_vec())
            .collect();
        assert_eq!(seen.into_inner(), expected);
    }

    #[test]
    fn save_nodes_for_root_prunes_orphans() {
        // Insert in reverse so the root is staged last and the whole staging
        // list is covered by the commit.
        let ms = store_with(CASES.iter().rev());

        ms.save_nodes_for_root(b"abcd").unwrap();

        let orphans: &[usize] = &[3, 6];
        for (i, c) in CASES.iter().enumerate() {
            let found = ms.get(c.key).is_ok();
            if orphans.contains(&i) {
                assert!(!found, "orphan {:?} survived pruning", c.key);
            } else {
                assert!(found, "rooted node {:?} was pruned", c.key);
            }
        }
    }

    #[test]
    fn rewriting_a_committed_node_does_not_restage_it() {
        let ms = store_with(CASES.iter().rev());
        ms.save_nodes_for_root(b"abcd").unwrap();

        // Re-writing a committed node is a no-op...
        ms.set(b"eeri", &body(&CASES[2])).unwrap();
        // ...so a later commit that does not reach it must not prune it.
        ms.set(b"root", &{
            let mut v = vec![NODE_PREFIX];
            v.extend_from_slice(b"1e04");
            v.extend_from_slice(b"r2er");
            v
        })
        .unwrap();
        ms.save_nodes_for_root(b"root").unwrap();
        assert!(ms.get(b"eeri").is_ok());
        // Conflicting content is still refused.
        assert!(matches!(
            ms.set(b"eeri", b"\x00zzzzzzzz"),
            Err(StoreError::KeyConflict(_))
        ));
    }

    #[test]
    fn entries_staged_after_root_survive() {
        let ms = store_with(CASES.iter().rev());
        // Staged after the root: must stay staged, not be pruned.
        ms.set(b"late", b"\x00tyuiasdg").unwrap();

        ms.save_nodes_for_root(b"abcd").unwrap();
        assert!(ms.get(b"late").is_ok());

        // A later commit for a root that doesn't reach it prunes it.
        ms.set(b"root", &{
            let mut v = vec![NODE_PREFIX];
            v.extend_from_slice(b"eeri");
            v.extend_from_slice(b"r2er");
            v
        })
        .unwrap();
        ms.save_nodes_for_root(b"root").unwrap();
        assert!(ms.get(b"late").is_err());
        assert!(ms.get(b"root").is_ok());
    }
}
