// src/server/mod.rs
//! HTTP read API for the domain map.

pub mod handlers;
pub mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::map::DomainMap;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { ip: "127.0.0.1".to_string(), port: 8021 }
    }
}

/// Build the read-API router.
pub fn router(dm: Arc<DomainMap>) -> Router {
    Router::new()
        .route("/dt/v1/get-smh", get(handlers::get_smh))
        .route("/dt/v1/get-domain-root-and-proof", get(handlers::get_domain_root_and_proof))
        .route("/dt/v1/get-consistency-proof", get(handlers::get_consistency_proof))
        .route("/dt/v1/get-entries", get(handlers::get_entries))
        .route("/dt/v1/get-entry-and-proof", get(handlers::get_entry_and_proof))
        .route("/dt/v1/get-domain-tree-index", get(handlers::get_domain_tree_index))
        .route("/dt/v1/get-source-logs", get(handlers::get_source_logs))
        .route("/dt/v1/get-source-log-and-proof", get(handlers::get_source_log_and_proof))
        .route("/dt/v1/get-source-consistency-proof", get(handlers::get_source_consistency_proof))
        .route("/metrics", get(handlers::get_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(dm)
}

/// Serve the read API until the shutdown signal flips.
pub async fn serve(dm: Arc<DomainMap>, config: ServerConfig, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = format!("{}:{}", config.ip, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Starting server on {}", addr);

    axum::serve(listener, router(dm))
        .with_graceful_shutdown(async move {
            // Either a real signal or all senders gone means shutdown.
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
            info!("Shutting down HTTP server");
        })
        .await
        .context("HTTP server error")
}
