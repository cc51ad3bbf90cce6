// src/cli.rs
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::ct::DEFAULT_LOG_LIST_URL;
use crate::fetcher::FetcherConfig;
use crate::server::ServerConfig;
use crate::worker::WorkerConfig;

/// run-server: the Domain Transparency map server
///
/// Tracks one or more CT logs, maintains the domain map, and serves the
/// signed map heads and proofs over HTTP.
#[derive(Parser, Debug, Clone)]
#[command(name = "run-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerArgs {
    /// PEM file with this map's private key (created if missing)
    #[arg(long = "private_key", default_value = "config/privatekey.pem")]
    pub private_key: PathBuf,

    /// PEM file with this map's public key (created if missing)
    #[arg(long = "public_key", default_value = "config/publickey.pem")]
    pub public_key: PathBuf,

    /// IP address on which to run the server
    #[arg(long = "ip", default_value = "127.0.0.1")]
    pub ip: String,

    /// Port on which to run the server
    #[arg(long = "port", default_value_t = 8021)]
    pub port: u16,

    /// How often to try to publish SMHs, in seconds
    #[arg(long = "smh_interval", default_value_t = 5)]
    pub smh_interval_secs: u64,

    /// How often to check for STH updates, in seconds
    #[arg(long = "sth_interval", default_value_t = 5)]
    pub sth_interval_secs: u64,

    /// Maximum interval between SMHs, in seconds
    #[arg(long = "mmd", default_value_t = 60)]
    pub mmd_secs: u64,

    /// A log to pull map updates from, by name, URL or base64 key hash;
    /// must be listed in the log list. A "seconds:" prefix delays the log's
    /// activation. (repeatable)
    #[arg(long = "log")]
    pub logs: Vec<String>,

    /// URL of the CT log list used to resolve --log specifiers
    #[arg(long = "log_list_url", default_value = DEFAULT_LOG_LIST_URL)]
    pub log_list_url: String,

    /// Size of the worker's transaction channel
    #[arg(long = "buffer_size", default_value_t = 32)]
    pub buffer_size: usize,

    /// Verbose logging (set log level to debug)
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Quiet logging (set log level to warn)
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}

impl ServerArgs {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.verbose && self.quiet {
            anyhow::bail!("--verbose and --quiet are mutually exclusive");
        }
        if self.logs.is_empty() {
            anyhow::bail!("no logs specified: pass at least one --log");
        }
        Ok(())
    }

    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            buffer_size: self.buffer_size,
            update_period: Duration::from_secs(self.smh_interval_secs),
            mmd: Duration::from_secs(self.mmd_secs),
        }
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            sth_interval: Duration::from_secs(self.sth_interval_secs),
            ..FetcherConfig::default()
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig { ip: self.ip.clone(), port: self.port }
    }
}

/// Split a log specifier's optional activation-delay prefix:
/// `"30:Argon2025"` means "track Argon2025, starting in 30 seconds".
pub fn parse_log_spec(spec: &str) -> (Option<Duration>, &str) {
    if let Some((prefix, rest)) = spec.split_once(':') {
        if let Ok(secs) = prefix.parse::<u64>() {
            return (Some(Duration::from_secs(secs)), rest);
        }
    }
    (None, spec)
}
