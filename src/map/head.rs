// src/map/head.rs
//! Map heads and their deterministic encoding.

use p256::ecdsa::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::encoding;
use crate::error::{MapError, MapResult};
use crate::keys;
use crate::merkle::Hash;

/// Domain Transparency version.
pub const VERSION: u8 = 1;

/// 32-byte identifier of a source CT log (the hash of its public key).
pub type LogId = [u8; 32];

/// A snapshot of a source CT log observed at some instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRevision {
    pub tree_size: u64,
    #[serde(with = "encoding::b64hash")]
    pub root_hash: Hash,
}

impl LogRevision {
    pub fn zero() -> Self {
        LogRevision { tree_size: 0, root_hash: [0; 32] }
    }
}

fn default_version() -> u8 {
    VERSION
}

/// The structure that is signed to produce the [`SignedMapHead`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapHead {
    // Not part of the JSON representation; clients pin it to VERSION.
    #[serde(skip, default = "default_version")]
    pub version: u8,
    pub timestamp: u64,
    pub map_size: u64,
    #[serde(with = "encoding::b64hash")]
    pub map_root_hash: Hash,
    #[serde(with = "encoding::b64hash")]
    pub source_tree_root_hash: Hash,
    pub source_log_revisions: Vec<LogRevision>,
}

// Each revision encodes as u64 tree size || 32-byte root hash.
const REVISION_LEN: usize = 40;
// The revision list carries a 3-byte length prefix.
const MAX_REVISIONS_BYTES: usize = (1 << 24) - 1;

impl MapHead {
    pub fn empty() -> Self {
        MapHead {
            version: VERSION,
            timestamp: 0,
            map_size: 0,
            map_root_hash: [0; 32],
            source_tree_root_hash: [0; 32],
            source_log_revisions: Vec::new(),
        }
    }

    /// Deterministic TLS-style encoding: `u8 version || u64 timestamp ||
    /// u64 map_size || map_root_hash || source_tree_root_hash ||
    /// u24 byte-length || revisions`. All integers big-endian.
    pub fn encode(&self) -> MapResult<Vec<u8>> {
        let revisions_len = self.source_log_revisions.len() * REVISION_LEN;
        if revisions_len > MAX_REVISIONS_BYTES {
            return Err(MapError::Crypto(format!(
                "cannot encode map head: {} source log revisions exceed the 2^24-1 byte bound",
                self.source_log_revisions.len()
            )));
        }

        let mut out = Vec::with_capacity(1 + 8 + 8 + 32 + 32 + 3 + revisions_len);
        out.push(self.version);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.map_size.to_be_bytes());
        out.extend_from_slice(&self.map_root_hash);
        out.extend_from_slice(&self.source_tree_root_hash);
        out.extend_from_slice(&(revisions_len as u32).to_be_bytes()[1..]);
        for rev in &self.source_log_revisions {
            out.extend_from_slice(&rev.tree_size.to_be_bytes());
            out.extend_from_slice(&rev.root_hash);
        }
        Ok(out)
    }
}

/// A [`MapHead`] plus its signature, as published to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMapHead {
    #[serde(flatten)]
    pub head: MapHead,
    #[serde(with = "encoding::b64bytes")]
    pub map_head_signature: Vec<u8>,
}

impl SignedMapHead {
    /// The unsigned head an empty map starts with.
    pub fn empty() -> Self {
        SignedMapHead { head: MapHead::empty(), map_head_signature: Vec::new() }
    }

    /// Verify the signature against the deterministic head encoding.
    pub fn verify(&self, public_key: &VerifyingKey) -> MapResult<()> {
        let encoded = self.head.encode()?;
        if !keys::verify_asn1(public_key, &encoded, &self.map_head_signature) {
            return Err(MapError::Crypto("map head signature does not verify".to_string()));
        }
        Ok(())
    }
}
