// src/ct/mod.rs
//! Certificate Transparency plumbing: the RFC 6962 HTTP client, log entry
//! parsing, and log-list resolution.

pub mod client;
pub mod leaf;
pub mod log_list;
pub mod types;

pub use client::{CtLogClient, RetryPolicy};
pub use log_list::{find_log_by_id, find_logs, LogListFetcher, ResolvedLog, DEFAULT_LOG_LIST_URL};
pub use types::{GetEntriesResponse, LogEntry, LogListV3, SignedTreeHead};
