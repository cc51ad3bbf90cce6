// src/server/types.rs
//! Request and response types for the `/dt/v1` read API. The same types are
//! used by the server handlers and by `MapClient`.

use serde::{Deserialize, Serialize};

use crate::encoding;
use crate::map::LogId;
use crate::merkle::Hash;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDomainRootAndProofRequest {
    pub domain_name: String,
    pub domain_map_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDomainRootAndProofResponse {
    pub domain_tree_size: u64,
    #[serde(with = "encoding::b64hash")]
    pub domain_tree_root_hash: Hash,
    pub normalized_domain_name: String,
    /// Placeholder for membership proofs and empty slots; otherwise the
    /// foreign leaf body occupying the queried slot.
    #[serde(with = "encoding::b64bytes")]
    pub leaf_hash: Vec<u8>,
    #[serde(with = "encoding::b64hash_list")]
    pub audit_path: Vec<Hash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConsistencyProofRequest {
    pub domain_name: String,
    pub first: u64,
    pub second: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConsistencyProofResponse {
    #[serde(with = "encoding::b64hash_list")]
    pub proof: Vec<Hash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEntriesRequest {
    pub domain_name: String,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEntriesResponse {
    pub entries: Vec<[u64; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEntryAndProofRequest {
    pub domain_name: String,
    pub index: u64,
    pub domain_tree_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEntryAndProofResponse {
    pub entry: [u64; 2],
    #[serde(with = "encoding::b64hash_list")]
    pub audit_path: Vec<Hash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDomainTreeIndexRequest {
    pub domain_name: String,
    pub log_index: u64,
    pub certificate_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDomainTreeIndexResponse {
    pub domain_tree_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSourceLogsRequest {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSourceLogsResponse {
    #[serde(with = "encoding::b64hash_list")]
    pub log_ids: Vec<LogId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSourceLogAndProofRequest {
    pub index: u64,
    pub source_tree_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSourceLogAndProofResponse {
    #[serde(with = "encoding::b64hash")]
    pub log_id: LogId,
    #[serde(with = "encoding::b64hash_list")]
    pub audit_path: Vec<Hash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSourceConsistencyProofRequest {
    pub first: u64,
    pub second: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSourceConsistencyProofResponse {
    #[serde(with = "encoding::b64hash_list")]
    pub proof: Vec<Hash>,
}
