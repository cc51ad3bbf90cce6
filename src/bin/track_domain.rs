// src/bin/track_domain.rs
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use dt_map::ct::{LogListFetcher, DEFAULT_LOG_LIST_URL};
use dt_map::keys;
use dt_map::mapclient::MapClient;
use dt_map::tracker::DomainTracker;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// track-domain: follow a Domain Transparency map for a set of domains
///
/// Polls the map for new signed map heads, verifies them, and prints every
/// new certificate observed for the tracked domains.
#[derive(Parser, Debug)]
#[command(name = "track-domain")]
#[command(author, version, about, long_about = None)]
struct TrackArgs {
    /// Base URI of the domain map
    #[arg(long = "map_uri", default_value = "http://127.0.0.1:8021/")]
    map_uri: String,

    /// The map's public key PEM
    #[arg(long = "map_key", default_value = "config/publickey.pem")]
    map_key: PathBuf,

    /// Polling interval, in seconds
    #[arg(long = "interval", default_value_t = 2)]
    interval_secs: u64,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// URL of the CT log list used to resolve source logs
    #[arg(long = "log_list_url", default_value = DEFAULT_LOG_LIST_URL)]
    log_list_url: String,

    /// Track the specified domain (repeatable)
    #[arg(long = "domain")]
    domains: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = TrackArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if args.verbose { "debug" } else { "info" })
        }))
        .init();

    if args.domains.is_empty() {
        anyhow::bail!("no domains specified: pass at least one --domain");
    }

    let interval = Duration::from_secs(args.interval_secs);
    let public_key = keys::load_public_key(&args.map_key)?;
    let log_list = LogListFetcher::new().fetch(&args.log_list_url).await?;

    let mc = MapClient::new(&args.map_uri, Some(public_key))?;
    let mut tracker = DomainTracker::new(mc, args.domains.clone(), log_list);

    // Initialize: wait for a first SMH and record the current tree sizes as
    // the baseline, so only genuinely new certificates are reported.
    loop {
        match tracker.fetch_smh().await {
            Ok(_) => break,
            Err(e) => {
                error!("Error fetching SMH: {:#}", e);
                tokio::time::sleep(interval).await;
            }
        }
    }
    tracker.update_domain_tree_roots(false).await;
    info!("Domain tracker started...");

    loop {
        if let Err(e) = tracker.wait_for_smh(interval).await {
            error!("Error fetching SMH: {:#}", e);
            tokio::time::sleep(interval).await;
            continue;
        }

        let smh = tracker.smh().expect("SMH is set after wait_for_smh");
        if args.verbose {
            info!(
                "New SMH: timestamp={}, size={}, rootHash={}, sourceRootHash={}, sourceLogCount={}",
                smh.head.timestamp,
                smh.head.map_size,
                hex::encode(smh.head.map_root_hash),
                hex::encode(smh.head.source_tree_root_hash),
                smh.head.source_log_revisions.len()
            );
        } else {
            info!(
                "New SMH: timestamp={}, size={}, rootHash={}..., sourceRootHash={}..., sourceLogCount={}",
                smh.head.timestamp,
                smh.head.map_size,
                hex::encode(&smh.head.map_root_hash[..4]),
                hex::encode(&smh.head.source_tree_root_hash[..4]),
                smh.head.source_log_revisions.len()
            );
        }

        for update in tracker.update_domain_tree_roots(true).await {
            info!(
                "New certificate for {}:\n  Issuer: {}\n  SHA-256 Fingerprint: {}\n  Leaf Index: {}{}",
                update.domains.join(", "),
                update.issuer.as_deref().unwrap_or("<unknown>"),
                update.fingerprint,
                update.leaf_index,
                if update.is_precert { " (precertificate)" } else { "" }
            );
        }
    }
}
