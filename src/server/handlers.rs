// src/server/handlers.rs
//! Handlers for the `/dt/v1` read API.
//!
//! Errors map to 404 with a text body (500 for encoding failures), matching
//! what map clients expect.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::types::*;
use crate::error::MapError;
use crate::map::{DomainMap, DomainTreeEntry, SignedMapHead};
use crate::metrics;

pub type AppState = Arc<DomainMap>;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

impl From<MapError> for ApiError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::Crypto(msg) => ApiError::Internal(msg),
            other => ApiError::NotFound(other.to_string()),
        }
    }
}

// GET /dt/v1/get-smh
pub async fn get_smh(State(dm): State<AppState>) -> Json<SignedMapHead> {
    Json(dm.get_latest_smh())
}

// GET /dt/v1/get-domain-root-and-proof
pub async fn get_domain_root_and_proof(
    State(dm): State<AppState>,
    Query(req): Query<GetDomainRootAndProofRequest>,
) -> Result<Json<GetDomainRootAndProofResponse>, ApiError> {
    let smh = dm.get_smh(req.domain_map_size).ok_or_else(|| {
        ApiError::NotFound(format!("invalid domain map size: {}", req.domain_map_size))
    })?;
    let root = smh.head.map_root_hash;

    let normalized = crate::normalize::normalize_domain_name(&req.domain_name)?;
    let dtr = dm.get_domain_tree_root(&root, &normalized)?;
    let proof = dm.get_proof_for_domain(&root, &normalized)?;

    Ok(Json(GetDomainRootAndProofResponse {
        domain_tree_size: dtr.domain_tree_size,
        domain_tree_root_hash: dtr.domain_tree_root_hash,
        normalized_domain_name: normalized,
        leaf_hash: proof.leaf_hash,
        audit_path: proof.audit_path,
    }))
}

// GET /dt/v1/get-consistency-proof
pub async fn get_consistency_proof(
    State(dm): State<AppState>,
    Query(req): Query<GetConsistencyProofRequest>,
) -> Result<Json<GetConsistencyProofResponse>, ApiError> {
    if req.first >= req.second {
        return Err(ApiError::NotFound(format!(
            "invalid sizes: first ({}) >= second ({})",
            req.first, req.second
        )));
    }
    let tree = dm.get_domain_tree(&req.domain_name)?;
    let proof = tree.get_consistency_proof(req.first, req.second)?;
    Ok(Json(GetConsistencyProofResponse { proof }))
}

// GET /dt/v1/get-entries
pub async fn get_entries(
    State(dm): State<AppState>,
    Query(req): Query<GetEntriesRequest>,
) -> Result<Json<GetEntriesResponse>, ApiError> {
    if req.start > req.end {
        return Err(ApiError::NotFound(format!("invalid range: [{},{}]", req.start, req.end)));
    }
    let tree = dm.get_domain_tree(&req.domain_name)?;
    let entries = tree.get_entries(req.start, req.end)?;
    Ok(Json(GetEntriesResponse {
        entries: entries.iter().map(|e| [e.log_index, e.cert_index]).collect(),
    }))
}

// GET /dt/v1/get-entry-and-proof
pub async fn get_entry_and_proof(
    State(dm): State<AppState>,
    Query(req): Query<GetEntryAndProofRequest>,
) -> Result<Json<GetEntryAndProofResponse>, ApiError> {
    let tree = dm.get_domain_tree(&req.domain_name)?;
    let (entry, audit_path) = tree.get_entry_and_proof(req.domain_tree_size, req.index)?;
    Ok(Json(GetEntryAndProofResponse {
        entry: [entry.log_index, entry.cert_index],
        audit_path,
    }))
}

// GET /dt/v1/get-domain-tree-index
pub async fn get_domain_tree_index(
    State(dm): State<AppState>,
    Query(req): Query<GetDomainTreeIndexRequest>,
) -> Result<Json<GetDomainTreeIndexResponse>, ApiError> {
    let entry = DomainTreeEntry { log_index: req.log_index, cert_index: req.certificate_index };
    let domain_tree_index = dm.entry_to_domain_tree_index(entry, &req.domain_name)?;
    Ok(Json(GetDomainTreeIndexResponse { domain_tree_index }))
}

// GET /dt/v1/get-source-logs
pub async fn get_source_logs(
    State(dm): State<AppState>,
    Query(req): Query<GetSourceLogsRequest>,
) -> Result<Json<GetSourceLogsResponse>, ApiError> {
    if req.start > req.end {
        return Err(ApiError::NotFound(format!("invalid range: [{},{}]", req.start, req.end)));
    }
    let log_ids = dm.source_tree().get_entries(req.start, req.end)?;
    Ok(Json(GetSourceLogsResponse { log_ids }))
}

// GET /dt/v1/get-source-log-and-proof
pub async fn get_source_log_and_proof(
    State(dm): State<AppState>,
    Query(req): Query<GetSourceLogAndProofRequest>,
) -> Result<Json<GetSourceLogAndProofResponse>, ApiError> {
    let (log_id, audit_path) = dm
        .source_tree()
        .get_entry_and_proof(req.source_tree_size, req.index)?;
    Ok(Json(GetSourceLogAndProofResponse { log_id, audit_path }))
}

// GET /dt/v1/get-source-consistency-proof
pub async fn get_source_consistency_proof(
    State(dm): State<AppState>,
    Query(req): Query<GetSourceConsistencyProofRequest>,
) -> Result<Json<GetSourceConsistencyProofResponse>, ApiError> {
    if req.first >= req.second {
        return Err(ApiError::NotFound(format!(
            "invalid sizes: first ({}) >= second ({})",
            req.first, req.second
        )));
    }
    let proof = dm.source_tree().get_consistency_proof(req.first, req.second)?;
    Ok(Json(GetSourceConsistencyProofResponse { proof }))
}

// GET /metrics
pub async fn get_metrics() -> String {
    metrics::gather_metrics()
}
