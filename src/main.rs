// src/main.rs
use std::sync::Arc;

use clap::Parser;
use dt_map::cli::{parse_log_spec, ServerArgs};
use dt_map::ct::{find_logs, CtLogClient, LogListFetcher};
use dt_map::fetcher::{fetch_log_for_worker, FetchParams};
use dt_map::keys;
use dt_map::map::DomainMap;
use dt_map::metrics;
use dt_map::server;
use dt_map::worker::start_worker;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    args.validate()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level())),
        )
        .init();

    metrics::init_metrics()?;

    let signer = keys::load_or_generate_keys(&args.private_key, &args.public_key)?;
    let dm = Arc::new(DomainMap::new(signer));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (transaction_tx, worker_handle) =
        start_worker(Arc::clone(&dm), args.worker_config(), shutdown_rx.clone());

    // Resolve the --log specifiers against the log list and start one
    // fetcher per source log, in specifier order (this fixes the log
    // indices in the source tree).
    let log_list = LogListFetcher::new().fetch(&args.log_list_url).await?;
    for (log_index, spec) in args.logs.iter().enumerate() {
        let (activation_delay, name) = parse_log_spec(spec);
        let mut matches = find_logs(&log_list, name);
        if matches.len() > 1 {
            anyhow::bail!("ambiguous log specifier {name:?}: got {} matches", matches.len());
        }
        let Some(log) = matches.pop() else {
            anyhow::bail!("specifier {name:?} was not found in the log list");
        };

        let params = FetchParams {
            log_index: log_index as u64,
            log_id: log.log_id,
            client: CtLogClient::new(log.url)?,
            config: args.fetcher_config(),
            activation_delay,
        };
        tokio::spawn(fetch_log_for_worker(params, transaction_tx.clone(), shutdown_rx.clone()));
    }
    // The worker keeps running on shutdown_rx even after all fetchers stop.
    drop(transaction_tx);

    let server_handle = tokio::spawn(server::serve(
        Arc::clone(&dm),
        args.server_config(),
        shutdown_rx.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Stopping workers...");
    let _ = shutdown_tx.send(true);

    if let Err(e) = worker_handle.await? {
        error!("Worker stopped with error: {:#}", e);
    }
    server_handle.await??;
    info!("Shutdown complete");
    Ok(())
}
