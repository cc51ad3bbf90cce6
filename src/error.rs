// src/error.rs
//! Error types shared by the map core.
//!
//! The pipeline layer (fetchers, binaries) wraps these in `anyhow` with
//! context; HTTP handlers convert them into status codes.

use thiserror::Error;

/// Errors produced by the sparse-tree backing store and the sparse
/// merkle tree built on top of it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such key: {0}")]
    UnknownKey(String),

    #[error("set on existing key {0} with a different value")]
    KeyConflict(String),

    #[error("cannot set the value of the placeholder key")]
    CannotSetPlaceholder,

    #[error("delete is not supported by this store")]
    DeleteUnsupported,

    #[error("invalid node body for key {key}: {reason}")]
    MalformedNode { key: String, reason: String },
}

/// Errors produced by the trees and the domain map.
#[derive(Debug, Error)]
pub enum MapError {
    /// Invalid input from an external caller (bad range, unknown domain,
    /// unknown snapshot, un-normalizable name).
    #[error("{0}")]
    Validation(String),

    /// An update that would move a committed size backward. The worker
    /// treats these as fatal.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// Signing or head-encoding failure. The current publish is aborted
    /// and no state is modified.
    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type MapResult<T> = std::result::Result<T, MapError>;

impl MapError {
    pub fn validation(msg: impl Into<String>) -> Self {
        MapError::Validation(msg.into())
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        MapError::Consistency(msg.into())
    }
}
