// src/worker.rs
//! The publishing worker: the map's single writer.
//!
//! One worker drains the transaction channel fed by the fetchers, mutates
//! the `DomainMap`, and publishes signed heads on the update period (when
//! something changed) or at the maximum merge delay (republishing if
//! nothing did). Cross-log ordering and per-publish accounting need a single
//! serialization point, so there is exactly one worker per map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{info, warn};

use crate::map::{DomainMap, DomainTree, DomainTreeEntry, LogId, LogRevision};
use crate::merkle::Hash;
use crate::metrics;
use crate::normalize::normalize_domain_name;

/// Work produced by a fetcher: one STH sweep of one source log.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub log_index: u64,
    pub log_id: LogId,
    pub log_revision: LogRevision,
    /// Newly observed certificate indices, bucketed by domain name.
    pub new_cert_indices: HashMap<String, Vec<u64>>,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub buffer_size: usize,
    pub update_period: Duration,
    /// Should be slightly less than the advertised maximum merge delay.
    pub mmd: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            buffer_size: 32,
            update_period: Duration::from_secs(5),
            mmd: Duration::from_secs(60),
        }
    }
}

struct Worker {
    dm: Arc<DomainMap>,
    map_size: u64,
    source_revisions: Vec<LogRevision>,
    map_root: Hash,
    // Transactions that arrived before their predecessor log was applied.
    queue: Vec<Transaction>,
}

/// Start the worker for `dm`. There may only be one running worker per map,
/// and no manual modifications while it runs. The worker exits cleanly when
/// `shutdown` flips to true or the channel closes; consistency violations
/// make it return an error.
pub fn start_worker(
    dm: Arc<DomainMap>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
) -> (mpsc::Sender<Transaction>, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(config.buffer_size);
    let handle = tokio::spawn(async move {
        let smh = dm.get_latest_smh();
        let mut worker = Worker {
            map_size: smh.head.map_size,
            source_revisions: smh.head.source_log_revisions.clone(),
            map_root: smh.head.map_root_hash,
            dm,
            queue: Vec::new(),
        };
        worker.run(config, rx, shutdown).await
    });
    (tx, handle)
}

impl Worker {
    async fn run(
        &mut self,
        config: WorkerConfig,
        mut rx: mpsc::Receiver<Transaction>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut update_tick =
            interval_at(Instant::now() + config.update_period, config.update_period);
        let mut mmd_tick = interval_at(Instant::now() + config.mmd, config.mmd);

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("worker shutting down");
                        return Ok(());
                    }
                }
                _ = update_tick.tick() => {
                    if self.dm.get_latest_smh().head.map_size != self.map_size {
                        mmd_tick.reset();
                        self.publish(false)?;
                    }
                }
                _ = mmd_tick.tick() => {
                    if self.map_size == 0 {
                        warn!("the MMD expired, but the first STH has not been fetched yet; resetting the MMD timer");
                        continue;
                    }
                    let republish = self.dm.get_latest_smh().head.map_size == self.map_size;
                    self.publish(republish)?;
                }
                t = rx.recv() => match t {
                    Some(t) => self.accept_and_process(t)?,
                    None => {
                        info!("transaction channel closed, stopping worker");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn publish(&self, republish: bool) -> Result<()> {
        self.dm
            .check_and_publish_smh(&self.map_root, self.map_size, &self.source_revisions)
            .context("error publishing new SMH")?;

        let smh = self.dm.get_latest_smh();
        let kind = if republish { "republish" } else { "new" };
        metrics::SMH_PUBLISHED_TOTAL.with_label_values(&[kind]).inc();
        metrics::MAP_SIZE.set(smh.head.map_size as i64);
        metrics::STORE_NODES.set(self.dm.store_size() as i64);

        info!(
            "new SMH: hash={}, signature={}, size={}, timestamp={}{}",
            &BASE64.encode(smh.head.map_root_hash)[..12],
            &BASE64.encode(&smh.map_head_signature)[..12],
            smh.head.map_size,
            smh.head.timestamp,
            if republish { " (republished)" } else { "" },
        );
        Ok(())
    }

    fn accept_and_process(&mut self, t: Transaction) -> Result<()> {
        // A log can only be added once all previous logs have been: buffer
        // anything that arrives early and retry after every apply.
        if t.log_index > self.source_revisions.len() as u64 {
            warn!(
                "got new certificates from log {}, buffering until log {} has been added",
                t.log_index,
                self.source_revisions.len()
            );
            self.queue.push(t);
        } else {
            self.process_transaction(t)?;
        }

        loop {
            let ready = self
                .queue
                .iter()
                .position(|q| q.log_index <= self.source_revisions.len() as u64);
            match ready {
                Some(i) => {
                    let t = self.queue.remove(i);
                    self.process_transaction(t)?;
                }
                None => return Ok(()),
            }
        }
    }

    fn process_transaction(&mut self, t: Transaction) -> Result<()> {
        let log_index = t.log_index as usize;
        if self.source_revisions.len() == log_index {
            info!("adding log {} to the source tree", t.log_index);
            self.source_revisions.push(LogRevision::zero());
            self.dm.source_tree().add_entry(t.log_id);
        } else if self.source_revisions.len() < log_index {
            anyhow::bail!(
                "attempt to add certificates from log {} when log {} has not been added yet",
                t.log_index,
                self.source_revisions.len()
            );
        }

        let old_rev = self.source_revisions[log_index];
        let new_rev = t.log_revision;
        let delta = new_rev.tree_size.checked_sub(old_rev.tree_size).ok_or_else(|| {
            anyhow::anyhow!(
                "source log {} shrank from {} to {}",
                t.log_index,
                old_rev.tree_size,
                new_rev.tree_size
            )
        })?;
        self.map_size += delta;
        self.source_revisions[log_index] = new_rev;

        for (domain, mut cert_indices) in t.new_cert_indices {
            if cert_indices.is_empty() {
                continue;
            }
            let dtree = self.get_domain_tree(&domain)?;
            cert_indices.sort_unstable();
            let mut tree_size = 0;
            for cert_index in cert_indices {
                tree_size = dtree
                    .add_entry(DomainTreeEntry { log_index: t.log_index, cert_index })
                    .with_context(|| format!("error appending to domain tree {domain:?}"))?;
            }
            self.map_root = self
                .dm
                .update_domain_tree_root(&self.map_root, dtree.domain_name(), tree_size)
                .with_context(|| {
                    format!(
                        "error propagating tree root update for {:?} to the domain map",
                        dtree.domain_name()
                    )
                })?;
        }

        metrics::TRANSACTIONS_APPLIED_TOTAL.inc();
        metrics::DOMAIN_TREES.set(self.dm.domain_tree_count() as i64);
        Ok(())
    }

    fn get_domain_tree(&self, domain: &str) -> Result<Arc<DomainTree>> {
        let normalized = normalize_domain_name(domain)
            .with_context(|| format!("error normalizing domain name {domain:?}"))?;
        if let Ok(tree) = self.dm.get_domain_tree(&normalized) {
            return Ok(tree);
        }

        let tree = Arc::new(
            DomainTree::new(&normalized)
                .with_context(|| format!("error creating domain tree for {normalized:?}"))?,
        );
        self.dm
            .add_domain_tree(Arc::clone(&tree))
            .context("error adding new domain tree to the domain map")?;
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;

    fn new_map() -> Arc<DomainMap> {
        let dir = tempfile::tempdir().unwrap();
        let signer = keys::load_or_generate_keys(
            &dir.path().join("priv.pem"),
            &dir.path().join("pub.pem"),
        )
        .unwrap();
        Arc::new(DomainMap::new(signer))
    }

    fn new_worker(dm: Arc<DomainMap>) -> Worker {
        let smh = dm.get_latest_smh();
        Worker {
            map_size: smh.head.map_size,
            source_revisions: smh.head.source_log_revisions.clone(),
            map_root: smh.head.map_root_hash,
            dm,
            queue: Vec::new(),
        }
    }

    fn transaction(log_index: u64, tree_size: u64, domains: &[(&str, &[u64])]) -> Transaction {
        let mut new_cert_indices = HashMap::new();
        for (domain, indices) in domains {
            new_cert_indices.insert(domain.to_string(), indices.to_vec());
        }
        Transaction {
            log_index,
            log_id: [log_index as u8 + 1; 32],
            log_revision: LogRevision { tree_size, root_hash: [0xfe; 32] },
            new_cert_indices,
        }
    }

    #[test]
    fn applies_transaction_and_tracks_sizes() {
        let dm = new_map();
        let mut w = new_worker(Arc::clone(&dm));

        w.accept_and_process(transaction(0, 1, &[("example-1.com", &[0])])).unwrap();
        assert_eq!(w.map_size, 1);
        assert_eq!(w.source_revisions.len(), 1);
        assert_eq!(dm.source_tree().size(), 1);
        assert_eq!(dm.get_domain_tree("example-1.com").unwrap().size(), 1);

        // Second batch: two more certificates at CT indices 1 and 3.
        w.accept_and_process(transaction(0, 3, &[("example-1.com", &[3, 1])])).unwrap();
        assert_eq!(w.map_size, 3);
        assert_eq!(dm.get_domain_tree("example-1.com").unwrap().size(), 3);

        // Publish and read the head back.
        w.publish(false).unwrap();
        let smh = dm.get_latest_smh();
        assert_eq!(smh.head.map_size, 3);
        assert_eq!(smh.head.source_log_revisions[0].tree_size, 3);
    }

    #[test]
    fn out_of_order_logs_are_buffered() {
        let dm = new_map();
        let mut w = new_worker(Arc::clone(&dm));

        // Log 1 arrives before log 0 was ever seen: must be queued.
        w.accept_and_process(transaction(1, 2, &[("example-2.com", &[0, 1])])).unwrap();
        assert_eq!(w.queue.len(), 1);
        assert_eq!(w.map_size, 0);
        assert_eq!(dm.source_tree().size(), 0);

        // Log 0 arrives; the sweep applies both in order.
        w.accept_and_process(transaction(0, 1, &[("example-1.com", &[0])])).unwrap();
        assert!(w.queue.is_empty());
        assert_eq!(w.source_revisions.len(), 2);
        assert_eq!(w.map_size, 3);
        assert_eq!(dm.source_tree().size(), 2);

        w.publish(false).unwrap();
        assert_eq!(dm.get_latest_smh().head.source_log_revisions.len(), 2);
    }

    #[test]
    fn shrinking_source_log_is_fatal() {
        let dm = new_map();
        let mut w = new_worker(dm);
        w.accept_and_process(transaction(0, 5, &[("example-1.com", &[0])])).unwrap();
        assert!(w.accept_and_process(transaction(0, 3, &[])).is_err());
    }

    #[test]
    fn map_size_counts_sth_delta_not_buckets() {
        let dm = new_map();
        let mut w = new_worker(dm);
        // 10 certificates reflected, only one recognizable domain entry.
        w.accept_and_process(transaction(0, 10, &[("example-1.com", &[4])])).unwrap();
        assert_eq!(w.map_size, 10);
    }

    #[test]
    fn any_arrival_order_converges_to_the_same_root() {
        let transactions = [
            transaction(0, 2, &[("example-1.com", &[0]), ("example-2.com", &[1])]),
            transaction(1, 1, &[("example-1.com", &[0])]),
            transaction(2, 3, &[("example-3.com", &[0, 2])]),
        ];

        let reference = {
            let mut w = new_worker(new_map());
            for t in &transactions {
                w.accept_and_process(t.clone()).unwrap();
            }
            w
        };

        let permutations: [[usize; 3]; 5] =
            [[0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for perm in permutations {
            let mut w = new_worker(new_map());
            for &i in &perm {
                w.accept_and_process(transactions[i].clone()).unwrap();
            }
            assert!(w.queue.is_empty(), "permutation {perm:?} left queued work");
            assert_eq!(w.map_root, reference.map_root, "divergent root for {perm:?}");
            assert_eq!(w.map_size, reference.map_size);
            assert_eq!(w.source_revisions, reference.source_revisions);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timer_loop_publishes_and_republishes() {
        let dm = new_map();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = WorkerConfig {
            buffer_size: 4,
            update_period: Duration::from_millis(50),
            mmd: Duration::from_millis(300),
        };
        let (tx, handle) = start_worker(Arc::clone(&dm), config, shutdown_rx);

        tx.send(transaction(0, 1, &[("example-1.com", &[0])])).await.unwrap();

        // The update-period tick publishes the first head.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let first = dm.get_latest_smh();
        assert_eq!(first.head.map_size, 1);
        assert!(!first.map_head_signature.is_empty());

        // With no new transactions, the MMD tick republishes: same root and
        // size, fresh signature event.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let second = dm.get_latest_smh();
        assert_eq!(second.head.map_size, first.head.map_size);
        assert_eq!(second.head.map_root_hash, first.head.map_root_hash);

        drop(tx);
        handle.await.unwrap().unwrap();
    }
}
