// src/map/mod.rs
//! The map core: signed heads, the source tree, per-domain trees, and the
//! composite `DomainMap` that joins them.

mod domain_map;
mod domain_tree;
mod head;
mod source_tree;

pub use domain_map::{DomainMap, DomainProof};
pub use domain_tree::{DomainTree, DomainTreeEntry, DomainTreeRoot};
pub use head::{LogId, LogRevision, MapHead, SignedMapHead, VERSION};
pub use source_tree::SourceTree;
