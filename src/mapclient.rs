// src/mapclient.rs
//! Typed HTTP client for a domain map's read API.

use std::time::Duration;

use anyhow::{Context, Result};
use p256::ecdsa::VerifyingKey;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::map::SignedMapHead;
use crate::server::types::*;

#[derive(Serialize)]
struct NoParams {}

/// A client for a domain map.
pub struct MapClient {
    uri: String,
    http_client: reqwest::Client,
    public_key: Option<VerifyingKey>,
}

impl MapClient {
    /// Create a new client. When a public key is given, fetched SMHs are
    /// verified against it.
    pub fn new(uri: &str, public_key: Option<VerifyingKey>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .gzip(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(MapClient {
            uri: format!("{}/", uri.trim_end_matches('/')),
            http_client,
            public_key,
        })
    }

    /// The map's URI, always with a trailing slash.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    async fn get<T: DeserializeOwned, P: Serialize>(&self, command: &str, params: &P) -> Result<T> {
        let url = format!("{}{}", self.uri, command);
        let response = self
            .http_client
            .get(&url)
            .query(params)
            .send()
            .await
            .with_context(|| format!("request to {command} failed"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!(
                "got http response {status} from {command}: {}",
                response.text().await.unwrap_or_default()
            );
        }
        response
            .json()
            .await
            .with_context(|| format!("failed to decode {command} response"))
    }

    /// `GET /dt/v1/get-smh`, verifying the signature when a key is available.
    pub async fn get_and_verify_smh(&self) -> Result<SignedMapHead> {
        let smh: SignedMapHead = self.get("dt/v1/get-smh", &NoParams {}).await?;
        if let Some(key) = &self.public_key {
            smh.verify(key).context("SMH signature verification failed")?;
        }
        Ok(smh)
    }

    pub async fn get_domain_root_and_proof(
        &self,
        req: &GetDomainRootAndProofRequest,
    ) -> Result<GetDomainRootAndProofResponse> {
        self.get("dt/v1/get-domain-root-and-proof", req).await
    }

    pub async fn get_consistency_proof(
        &self,
        req: &GetConsistencyProofRequest,
    ) -> Result<GetConsistencyProofResponse> {
        self.get("dt/v1/get-consistency-proof", req).await
    }

    pub async fn get_entries(&self, req: &GetEntriesRequest) -> Result<GetEntriesResponse> {
        self.get("dt/v1/get-entries", req).await
    }

    pub async fn get_entry_and_proof(
        &self,
        req: &GetEntryAndProofRequest,
    ) -> Result<GetEntryAndProofResponse> {
        self.get("dt/v1/get-entry-and-proof", req).await
    }

    pub async fn get_domain_tree_index(
        &self,
        req: &GetDomainTreeIndexRequest,
    ) -> Result<GetDomainTreeIndexResponse> {
        self.get("dt/v1/get-domain-tree-index", req).await
    }

    pub async fn get_source_logs(&self, req: &GetSourceLogsRequest) -> Result<GetSourceLogsResponse> {
        self.get("dt/v1/get-source-logs", req).await
    }

    pub async fn get_source_log_and_proof(
        &self,
        req: &GetSourceLogAndProofRequest,
    ) -> Result<GetSourceLogAndProofResponse> {
        self.get("dt/v1/get-source-log-and-proof", req).await
    }

    pub async fn get_source_consistency_proof(
        &self,
        req: &GetSourceConsistencyProofRequest,
    ) -> Result<GetSourceConsistencyProofResponse> {
        self.get("dt/v1/get-source-consistency-proof", req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_gets_a_trailing_slash() {
        let mc = MapClient::new("http://127.0.0.1:8021", None).unwrap();
        assert_eq!(mc.uri(), "http://127.0.0.1:8021/");
        let mc = MapClient::new("http://127.0.0.1:8021///", None).unwrap();
        assert_eq!(mc.uri(), "http://127.0.0.1:8021/");
    }
}
