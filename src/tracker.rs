// src/tracker.rs
//! Client-side domain tracking.
//!
//! A `DomainTracker` follows a map's SMHs and, for each tracked domain,
//! walks the new domain-tree entries. Every surfaced certificate is checked
//! twice: the domain-tree audit path is verified against the domain root the
//! map returned, and the CT inclusion proof is verified against the source
//! log revision committed in the SMH.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{info, warn};

use crate::ct::{self, leaf, CtLogClient, LogListV3};
use crate::map::{DomainTreeEntry, SignedMapHead};
use crate::mapclient::MapClient;
use crate::merkle;
use crate::server::types::*;
use crate::smt;

/// A certificate newly observed in some domain tree.
#[derive(Debug, Clone)]
pub struct CertUpdate {
    pub domains: Vec<String>,
    pub log_index: u64,
    pub leaf_index: u64,
    pub fingerprint: String,
    pub issuer: Option<String>,
    pub is_precert: bool,
}

pub struct DomainTracker {
    mc: MapClient,
    domains: Vec<String>,
    log_list: LogListV3,

    last_tree_sizes: HashMap<String, u64>,
    smh: Option<SignedMapHead>,
    log_clients: HashMap<u64, CtLogClient>,
}

impl DomainTracker {
    pub fn new(mc: MapClient, domains: Vec<String>, log_list: LogListV3) -> Self {
        DomainTracker {
            mc,
            domains,
            log_list,
            last_tree_sizes: HashMap::new(),
            smh: None,
            log_clients: HashMap::new(),
        }
    }

    pub fn smh(&self) -> Option<&SignedMapHead> {
        self.smh.as_ref()
    }

    /// Fetch (and verify) the latest SMH. Returns whether it changed.
    pub async fn fetch_smh(&mut self) -> Result<bool> {
        let smh = self.mc.get_and_verify_smh().await?;
        if let Some(current) = &self.smh {
            if current.map_head_signature == smh.map_head_signature {
                return Ok(false);
            }
        }
        self.smh = Some(smh);
        Ok(true)
    }

    /// Poll until a new SMH appears.
    pub async fn wait_for_smh(&mut self, fetch_interval: Duration) -> Result<()> {
        loop {
            if self.fetch_smh().await? {
                return Ok(());
            }
            tokio::time::sleep(fetch_interval).await;
        }
    }

    async fn get_client(&mut self, log_index: u64) -> Result<&CtLogClient> {
        if !self.log_clients.contains_key(&log_index) {
            let smh = self.smh.as_ref().context("no SMH fetched yet")?;
            let resp = self
                .mc
                .get_source_log_and_proof(&GetSourceLogAndProofRequest {
                    index: log_index,
                    source_tree_size: smh.head.source_log_revisions.len() as u64,
                })
                .await?;
            let log = ct::find_log_by_id(&self.log_list, &resp.log_id)
                .with_context(|| format!("unknown log with key hash {}", hex::encode(resp.log_id)))?;
            info!("Resolved source log {}: {}", log_index, log.url);
            self.log_clients.insert(log_index, CtLogClient::new(log.url)?);
        }
        Ok(&self.log_clients[&log_index])
    }

    /// Refresh the tracked domain-tree roots. With `return_updates`, walks
    /// the new entries and returns the verified certificates; otherwise only
    /// records the current sizes as the baseline.
    pub async fn update_domain_tree_roots(&mut self, return_updates: bool) -> Vec<CertUpdate> {
        let smh = match &self.smh {
            Some(smh) => smh.clone(),
            None => return Vec::new(),
        };

        let mut updates: HashMap<(u64, u64), CertUpdate> = HashMap::new();
        for domain in self.domains.clone() {
            let domain_root = match self
                .mc
                .get_domain_root_and_proof(&GetDomainRootAndProofRequest {
                    domain_name: domain.clone(),
                    domain_map_size: smh.head.map_size,
                })
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("Error getting domain tree root for {:?}: {:#}", domain, e);
                    continue;
                }
            };

            if !verify_domain_root(&domain_root, &smh) {
                warn!("Domain proof for {:?} does not match the SMH root, skipping", domain);
                continue;
            }

            if return_updates {
                let from = *self
                    .last_tree_sizes
                    .get(&domain_root.normalized_domain_name)
                    .unwrap_or(&0);
                let to = domain_root.domain_tree_size;
                if let Err(e) = self.get_tree_updates(&domain_root, from, to, &mut updates).await {
                    warn!("Error updating tree for {:?}: {:#}", domain, e);
                    continue;
                }
            } else {
                self.last_tree_sizes
                    .insert(domain_root.normalized_domain_name.clone(), domain_root.domain_tree_size);
            }
        }
        updates.into_values().collect()
    }

    async fn get_tree_updates(
        &mut self,
        domain_root: &GetDomainRootAndProofResponse,
        from: u64,
        to: u64,
        updates: &mut HashMap<(u64, u64), CertUpdate>,
    ) -> Result<()> {
        for index in from..to {
            self.get_tree_update(domain_root, index, updates).await?;
            self.last_tree_sizes
                .insert(domain_root.normalized_domain_name.clone(), index + 1);
        }
        Ok(())
    }

    async fn get_tree_update(
        &mut self,
        domain_root: &GetDomainRootAndProofResponse,
        index: u64,
        updates: &mut HashMap<(u64, u64), CertUpdate>,
    ) -> Result<()> {
        let entry_and_proof = self
            .mc
            .get_entry_and_proof(&GetEntryAndProofRequest {
                domain_name: domain_root.normalized_domain_name.clone(),
                index,
                domain_tree_size: domain_root.domain_tree_size,
            })
            .await?;
        let [log_index, leaf_index] = entry_and_proof.entry;

        // The entry must really be part of the domain tree the map committed.
        let entry = DomainTreeEntry { log_index, cert_index: leaf_index };
        if !merkle::verify_inclusion(
            &merkle::leaf_hash(&entry.encode()),
            index,
            domain_root.domain_tree_size,
            &entry_and_proof.audit_path,
            &domain_root.domain_tree_root_hash,
        ) {
            anyhow::bail!(
                "domain tree audit path for entry {index} of {:?} does not verify",
                domain_root.normalized_domain_name
            );
        }

        if let Some(update) = updates.get_mut(&(log_index, leaf_index)) {
            update.domains.push(domain_root.normalized_domain_name.clone());
            return Ok(());
        }

        let smh = self.smh.as_ref().context("no SMH fetched yet")?.clone();
        let revision = smh
            .head
            .source_log_revisions
            .get(log_index as usize)
            .with_context(|| format!("SMH has no revision for log {log_index}"))?;

        let client = self.get_client(log_index).await?;
        let resp = client.entry_and_proof(leaf_index, revision.tree_size).await?;

        // CT inclusion: the leaf hash is computed over the raw leaf_input.
        let leaf_bytes = BASE64
            .decode(&resp.leaf_input)
            .context("failed to decode CT leaf_input")?;
        let audit_path = resp.decoded_audit_path()?;
        if !merkle::verify_inclusion(
            &merkle::leaf_hash(&leaf_bytes),
            leaf_index,
            revision.tree_size,
            &audit_path,
            &revision.root_hash,
        ) {
            anyhow::bail!("CT audit proof for entry ({log_index},{leaf_index}) does not verify");
        }

        let parsed = match leaf::parse_log_entry(&resp.leaf_input, &resp.extra_data) {
            Ok(parsed) => parsed,
            Err(e) => {
                info!("Entry ({log_index},{leaf_index}) could not be parsed, skipping: {:#}", e);
                return Ok(());
            }
        };

        updates.insert(
            (log_index, leaf_index),
            CertUpdate {
                domains: vec![domain_root.normalized_domain_name.clone()],
                log_index,
                leaf_index,
                fingerprint: parsed.fingerprint,
                issuer: parsed.issuer,
                is_precert: parsed.is_precert,
            },
        );
        Ok(())
    }
}

// Check the sparse-tree proof: for a tracked domain it must rebuild the
// SMH's map root from the returned domain-tree root (or prove absence).
fn verify_domain_root(domain_root: &GetDomainRootAndProofResponse, smh: &SignedMapHead) -> bool {
    let value = if domain_root.domain_tree_size == 0 {
        None
    } else {
        Some(
            crate::map::DomainTreeRoot {
                domain_tree_size: domain_root.domain_tree_size,
                domain_tree_root_hash: domain_root.domain_tree_root_hash,
            }
            .encode(),
        )
    };
    smt::verify_proof(
        &domain_root.audit_path,
        &domain_root.leaf_hash,
        domain_root.normalized_domain_name.as_bytes(),
        value.as_ref().map(|v| v.as_slice()),
        &smh.head.map_root_hash,
    )
}
