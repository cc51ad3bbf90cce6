// src/ct/types.rs
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::merkle::{Hash, HASH_SIZE};

/// Response from a CT log's get-sth endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTreeHead {
    pub tree_size: u64,
    pub timestamp: u64,
    pub sha256_root_hash: String,
    #[serde(default)]
    pub tree_head_signature: String,
}

impl SignedTreeHead {
    /// Decode the base64 root hash into its 32-byte form.
    pub fn root_hash(&self) -> Result<Hash> {
        let bytes = BASE64
            .decode(&self.sha256_root_hash)
            .context("failed to decode base64 STH root hash")?;
        let hash: Hash = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("STH root hash is {} bytes, expected {HASH_SIZE}", bytes.len()))?;
        Ok(hash)
    }
}

/// Single entry from a CT log's get-entries endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub leaf_input: String, // base64-encoded MerkleTreeLeaf
    pub extra_data: String, // base64-encoded certificate chain
}

/// Response wrapper for get-entries
#[derive(Debug, Serialize, Deserialize)]
pub struct GetEntriesResponse {
    pub entries: Vec<LogEntry>,
}

/// Response from a CT log's get-entry-and-proof endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEntryAndProofResponse {
    pub leaf_input: String,
    pub extra_data: String,
    pub audit_path: Vec<String>, // base64
}

impl GetEntryAndProofResponse {
    pub fn decoded_audit_path(&self) -> Result<Vec<Hash>> {
        self.audit_path
            .iter()
            .map(|p| {
                let bytes = BASE64.decode(p).context("failed to decode base64 audit path node")?;
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("audit path node is not {HASH_SIZE} bytes"))
            })
            .collect()
    }
}

/// Google's CT log list V3 format, reduced to the fields the server uses.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogListV3 {
    pub operators: Vec<Operator>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Operator {
    pub name: String,
    #[serde(default)]
    pub logs: Vec<LogInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogInfo {
    #[serde(default)]
    pub description: String,
    pub log_id: Option<String>,
    pub key: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub state: Option<StateWrapper>,
}

/// State wrapper that can contain different state types
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateWrapper {
    #[serde(default)]
    pub usable: Option<StateTimestamp>,
    #[serde(default)]
    pub readonly: Option<StateTimestamp>,
    #[serde(default)]
    pub retired: Option<StateTimestamp>,
    #[serde(default)]
    pub rejected: Option<StateTimestamp>,
    #[serde(default)]
    pub qualified: Option<StateTimestamp>,
    #[serde(default)]
    pub pending: Option<StateTimestamp>,
}

impl StateWrapper {
    /// Whether the log is accepting or recently accepted entries.
    pub fn is_usable(&self) -> bool {
        self.usable.is_some() || self.qualified.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTimestamp {
    pub timestamp: String,
}
