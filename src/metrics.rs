// src/metrics.rs
//! Prometheus metrics for the map server.
//!
//! Provides observability into SMH publishing, transaction processing and
//! CT ingestion. Served on `GET /metrics` by the HTTP layer.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total SMHs published
    /// Labels: kind="new|republish"
    pub static ref SMH_PUBLISHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("dtmap_smh_published_total", "Total number of signed map heads published"),
        &["kind"]
    ).expect("metric cannot be created");

    /// Total worker transactions applied
    pub static ref TRANSACTIONS_APPLIED_TOTAL: IntCounter = IntCounter::new(
        "dtmap_transactions_applied_total",
        "Total number of fetcher transactions applied by the worker"
    ).expect("metric cannot be created");

    /// Total CT entries fetched across all source logs
    pub static ref ENTRIES_FETCHED_TOTAL: IntCounter = IntCounter::new(
        "dtmap_ct_entries_fetched_total",
        "Total number of CT log entries fetched"
    ).expect("metric cannot be created");

    /// Current map size (certificates reflected in the map)
    pub static ref MAP_SIZE: IntGauge = IntGauge::new(
        "dtmap_map_size",
        "Certificates reflected in the latest signed map head"
    ).expect("metric cannot be created");

    /// Number of registered domain trees
    pub static ref DOMAIN_TREES: IntGauge = IntGauge::new(
        "dtmap_domain_trees",
        "Number of domain trees registered with the map"
    ).expect("metric cannot be created");

    /// Nodes held by the sparse-tree store after pruning
    pub static ref STORE_NODES: IntGauge = IntGauge::new(
        "dtmap_store_nodes",
        "Nodes held by the sparse-tree backing store"
    ).expect("metric cannot be created");
}

/// Register all metrics with the global registry.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(SMH_PUBLISHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TRANSACTIONS_APPLIED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ENTRIES_FETCHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MAP_SIZE.clone()))?;
    REGISTRY.register(Box::new(DOMAIN_TREES.clone()))?;
    REGISTRY.register(Box::new(STORE_NODES.clone()))?;
    Ok(())
}

/// Render the registry in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&REGISTRY.gather()) {
        Ok(text) => text,
        Err(e) => {
            warn!("failed to encode metrics: {}", e);
            String::new()
        }
    }
}
