// src/ct/log_list.rs
//! Resolving `--log` specifiers against Google's CT log list.

use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::info;

use super::types::LogListV3;
use crate::map::LogId;

pub const DEFAULT_LOG_LIST_URL: &str =
    "https://www.gstatic.com/ct/log_list/v3/all_logs_list.json";

/// A source log resolved from the log list.
#[derive(Debug, Clone)]
pub struct ResolvedLog {
    pub description: String,
    pub url: String,
    pub log_id: LogId,
    /// DER-encoded public key, used by clients verifying CT proofs.
    pub key: Vec<u8>,
}

/// Fetches the CT log list.
pub struct LogListFetcher {
    http_client: reqwest::Client,
}

impl Default for LogListFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LogListFetcher {
    pub fn new() -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .build()
            .expect("reqwest client construction cannot fail with these options");

        Self { http_client }
    }

    pub async fn fetch(&self, list_url: &str) -> Result<LogListV3> {
        info!("Fetching CT log list from {}", list_url);

        let response = self
            .http_client
            .get(list_url)
            .send()
            .await
            .context("Failed to fetch CT log list")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to fetch log list: HTTP {}", response.status());
        }

        response.json().await.context("Failed to parse log list JSON")
    }
}

fn trim_url(url: &str) -> String {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_lowercase()
}

/// Find the logs matching `spec`, which may be a log description (exact or
/// substring, case-insensitive), a URL, or a base64 log id.
pub fn find_logs(list: &LogListV3, spec: &str) -> Vec<ResolvedLog> {
    let spec_lower = spec.to_lowercase();
    let spec_url = trim_url(spec);

    let mut exact = Vec::new();
    let mut fuzzy = Vec::new();

    for operator in &list.operators {
        for log in &operator.logs {
            let Some(resolved) = resolve(log) else { continue };

            let description = resolved.description.to_lowercase();
            let url = trim_url(&resolved.url);
            let id_b64 = BASE64.encode(resolved.log_id);

            if description == spec_lower || url == spec_url || id_b64 == spec {
                exact.push(resolved);
            } else if description.contains(&spec_lower) {
                fuzzy.push(resolved);
            }
        }
    }

    if !exact.is_empty() {
        exact
    } else {
        fuzzy
    }
}

// A list entry without a key cannot be tracked: the log id is the hash of
// the key, and clients need the key to check CT proofs.
fn resolve(log: &super::types::LogInfo) -> Option<ResolvedLog> {
    if log.url.is_empty() {
        return None;
    }
    let key = BASE64.decode(log.key.as_deref()?).ok()?;

    let log_id: LogId = match &log.log_id {
        Some(id) => BASE64.decode(id).ok()?.as_slice().try_into().ok()?,
        None => Sha256::digest(&key).into(),
    };

    Some(ResolvedLog {
        description: log.description.clone(),
        url: log.url.clone(),
        log_id,
        key,
    })
}

/// Find a log by its 32-byte id.
pub fn find_log_by_id(list: &LogListV3, id: &LogId) -> Option<ResolvedLog> {
    for operator in &list.operators {
        for log in &operator.logs {
            if let Some(resolved) = resolve(log) {
                if resolved.log_id == *id {
                    return Some(resolved);
                }
            }
        }
    }
    None
}
