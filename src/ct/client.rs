// src/ct/client.rs
//! HTTP client for the RFC 6962 read API of a source CT log.
//!
//! The fetcher polls logs forever, so transient failures are absorbed here:
//! the read calls it drives (`sth`, `entries`) run under an exponential
//! backoff schedule. The tracker's `entry_and_proof` is not retried; the
//! tracker has its own polling cadence and treats a failed sweep as a
//! warning.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::types::{GetEntriesResponse, GetEntryAndProofResponse, LogEntry, SignedTreeHead};

/// Backoff schedule for transient log failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

pub struct CtLogClient {
    base_url: String,
    http_client: reqwest::Client,
    retry: RetryPolicy,
}

impl CtLogClient {
    pub fn new(base_url: String) -> Result<Self> {
        Self::with_retry(base_url, RetryPolicy::default())
    }

    pub fn with_retry(base_url: String, retry: RetryPolicy) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
            retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // One GET against the log's /ct/v1 surface, JSON-decoded. Throttling
    // (429) gets its own message so it is recognizable in the logs.
    async fn get_json<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T> {
        let url = format!("{}/ct/v1/{}", self.base_url, path_and_query);
        debug!("querying {}", url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            anyhow::bail!("rate limited by {url}");
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{url} answered {status}: {body}");
        }

        response
            .json()
            .await
            .with_context(|| format!("invalid JSON from {url}"))
    }

    // Run `op` under the retry schedule.
    async fn with_backoff<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.retry.attempts => {
                    return Err(e.context(format!("{what} failed after {attempt} attempts")));
                }
                Err(e) => {
                    warn!(
                        "{what} against {} failed (attempt {attempt}/{}): {e:#}; retrying in {:?}",
                        self.base_url, self.retry.attempts, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.max_backoff);
                    attempt += 1;
                }
            }
        }
    }

    /// The log's current signed tree head.
    pub async fn sth(&self) -> Result<SignedTreeHead> {
        let sth: SignedTreeHead = self.with_backoff("get-sth", || self.get_json("get-sth")).await?;
        debug!(
            "STH from {}: tree_size={}, timestamp={}",
            self.base_url, sth.tree_size, sth.timestamp
        );
        Ok(sth)
    }

    /// Entries in the inclusive interval `[start, end]`. The log may return
    /// fewer entries than requested.
    pub async fn entries(&self, start: u64, end: u64) -> Result<Vec<LogEntry>> {
        let query = format!("get-entries?start={start}&end={end}");
        let response: GetEntriesResponse =
            self.with_backoff("get-entries", || self.get_json(&query)).await?;
        debug!(
            "{} returned {} entries for [{start}, {end}]",
            self.base_url,
            response.entries.len()
        );
        Ok(response.entries)
    }

    /// A single entry plus its audit path against the root at `tree_size`.
    pub async fn entry_and_proof(
        &self,
        leaf_index: u64,
        tree_size: u64,
    ) -> Result<GetEntryAndProofResponse> {
        let query = format!("get-entry-and-proof?leaf_index={leaf_index}&tree_size={tree_size}");
        self.get_json(&query).await
    }
}
