// src/fetcher.rs
//! Per-log fetchers feeding the worker.
//!
//! One fetcher runs per source CT log. Each sweep pulls the current STH,
//! fetches every new entry in batches, buckets the certificates' normalized
//! domain names, and submits a single `Transaction` for the sweep. Errors
//! never terminate the fetcher; the sweep is retried after the STH check
//! interval.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::ct::{leaf, CtLogClient};
use crate::map::{LogId, LogRevision};
use crate::metrics;
use crate::normalize::normalize_domain_name;
use crate::worker::Transaction;

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Entries below this index are assumed to be already reflected.
    pub initial_tree_size: u64,
    /// How often to check the log for a new STH.
    pub sth_interval: Duration,
    pub batch_size: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        FetcherConfig {
            initial_tree_size: 0,
            sth_interval: Duration::from_secs(5),
            batch_size: 64,
        }
    }
}

pub struct FetchParams {
    pub log_index: u64,
    pub log_id: LogId,
    pub client: CtLogClient,
    pub config: FetcherConfig,
    /// Optional delayed activation (the `seconds:` prefix of a log specifier).
    pub activation_delay: Option<Duration>,
}

/// Fetch the log and pass all new entries to the worker until shutdown.
pub async fn fetch_log_for_worker(
    params: FetchParams,
    tx: mpsc::Sender<Transaction>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Some(delay) = params.activation_delay {
        info!("Fetcher for log {} sleeping {:?} before activation", params.log_index, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    info!("Fetcher for log {} stopped before activation", params.log_index);
                    return;
                }
            }
        }
    }

    info!("Tracking log {}: {}", params.log_index, params.client.base_url());

    let mut start_index = params.config.initial_tree_size;
    loop {
        if *shutdown.borrow() {
            break;
        }

        match run_iteration(&params, start_index, &tx).await {
            Ok(Some(new_start)) => start_index = new_start,
            Ok(None) => {}
            Err(e) => warn!("Error (log {}): {:#}", params.log_index, e),
        }

        tokio::select! {
            _ = tokio::time::sleep(params.config.sth_interval) => {}
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Fetcher for log {} stopped", params.log_index);
}

// One sweep: STH check, batch fetches, one transaction. Returns the next
// start index, or None when the log had nothing new.
async fn run_iteration(
    params: &FetchParams,
    start_index: u64,
    tx: &mpsc::Sender<Transaction>,
) -> Result<Option<u64>> {
    let sth = params.client.sth().await.context("Failed to get STH")?;
    if sth.tree_size <= start_index {
        debug!(
            "Log {} up to date (start_index={}, tree_size={})",
            params.log_index, start_index, sth.tree_size
        );
        return Ok(None);
    }
    let root_hash = sth.root_hash()?;

    info!("Fetcher (log {}): new STH (size={})", params.log_index, sth.tree_size);

    let mut new_cert_indices: HashMap<String, Vec<u64>> = HashMap::new();
    let mut index = start_index;
    while index < sth.tree_size {
        let end = std::cmp::min(index + params.config.batch_size, sth.tree_size) - 1;
        let entries = params
            .client
            .entries(index, end)
            .await
            .context("Failed to get entries")?;
        if entries.is_empty() {
            anyhow::bail!("CT log returned no entries for range {}-{}", index, end);
        }

        for (offset, entry) in entries.iter().enumerate() {
            let leaf_index = index + offset as u64;
            collect_domains(params.log_index, leaf_index, entry, &mut new_cert_indices);
        }

        metrics::ENTRIES_FETCHED_TOTAL.inc_by(entries.len() as u64);
        // Logs may return fewer entries than requested.
        index += entries.len() as u64;
    }

    let transaction = Transaction {
        log_index: params.log_index,
        log_id: params.log_id,
        log_revision: LogRevision { tree_size: sth.tree_size, root_hash },
        new_cert_indices,
    };
    if tx.send(transaction).await.is_err() {
        anyhow::bail!("worker channel closed");
    }
    Ok(Some(sth.tree_size))
}

fn collect_domains(
    log_index: u64,
    leaf_index: u64,
    entry: &crate::ct::LogEntry,
    new_cert_indices: &mut HashMap<String, Vec<u64>>,
) {
    let parsed = match leaf::parse_log_entry(&entry.leaf_input, &entry.extra_data) {
        Ok(p) => p,
        Err(e) => {
            debug!("Ignoring entry {} in log {}: {:#}", leaf_index, log_index, e);
            return;
        }
    };

    // Union of the SAN names and the common name. Names that fail
    // normalization are dropped; the set collapses duplicates so each
    // certificate contributes one entry per domain.
    let mut domains: HashSet<String> = HashSet::new();
    for name in parsed.all_names() {
        match normalize_domain_name(&name) {
            Ok(d) => {
                domains.insert(d);
            }
            Err(_) => {
                debug!(
                    "Ignoring invalid domain name {:?} for certificate at index {} (log {})",
                    name, leaf_index, log_index
                );
            }
        }
    }

    if domains.is_empty() {
        debug!("No valid domain names for certificate at index {} (log {})", leaf_index, log_index);
        return;
    }
    for domain in domains {
        new_cert_indices.entry(domain).or_default().push(leaf_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    // A minimal x509_entry leaf whose "certificate" bytes won't parse; the
    // entry must be skipped without contributing any domains.
    #[test]
    fn malformed_certificates_are_skipped() {
        let mut leaf = vec![0u8; 12];
        leaf.extend_from_slice(&[0, 0, 3]);
        leaf.extend_from_slice(b"xyz");
        let entry = crate::ct::LogEntry {
            leaf_input: BASE64.encode(&leaf),
            extra_data: String::new(),
        };

        let mut buckets = HashMap::new();
        collect_domains(0, 7, &entry, &mut buckets);
        assert!(buckets.is_empty());
    }
}
