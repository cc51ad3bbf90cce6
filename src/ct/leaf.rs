// src/ct/leaf.rs
//! CT log entry parsing: recover the certificate behind a leaf and the
//! domain names it was issued for.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::*;

/// Certificate data extracted from a log entry.
#[derive(Debug, Clone)]
pub struct ParsedCert {
    pub dns_names: Vec<String>,
    pub common_name: Option<String>,
    pub fingerprint: String,
    pub issuer: Option<String>,
    pub is_precert: bool,
}

impl ParsedCert {
    /// SAN DNS names plus the subject common name (deduplicated).
    pub fn all_names(&self) -> Vec<String> {
        let mut names = self.dns_names.clone();
        if let Some(cn) = &self.common_name {
            if !names.contains(cn) {
                names.push(cn.clone());
            }
        }
        names
    }
}

/// Extract the certificate DER from a log entry.
///
/// `leaf_input` is the base64 MerkleTreeLeaf; the entry type lives at bytes
/// 10-11. For x509 entries the certificate is embedded in the leaf; for
/// precert entries the full precertificate is the first element of
/// `extra_data`. Other entry types (JSON data) are unsupported and skipped
/// by the caller.
pub fn cert_der_from_entry(base64_leaf_input: &str, base64_extra_data: &str) -> Result<(Vec<u8>, bool)> {
    let leaf_bytes = BASE64
        .decode(base64_leaf_input)
        .context("Failed to decode base64 leaf_input")?;

    if leaf_bytes.len() < 12 {
        anyhow::bail!("Leaf input too short: {} bytes", leaf_bytes.len());
    }

    // entry type at bytes 10-11 (big-endian u16)
    let entry_type = ((leaf_bytes[10] as u16) << 8) | (leaf_bytes[11] as u16);

    match entry_type {
        0 => {
            // x509_entry: certificate is in leaf_input behind a 3-byte length
            if leaf_bytes.len() < 15 {
                anyhow::bail!("x509_entry too short");
            }

            let cert_len = ((leaf_bytes[12] as usize) << 16)
                | ((leaf_bytes[13] as usize) << 8)
                | (leaf_bytes[14] as usize);

            let end_pos = std::cmp::min(15 + cert_len, leaf_bytes.len());
            Ok((leaf_bytes[15..end_pos].to_vec(), false))
        }
        1 => {
            // precert_entry: the full precertificate is in extra_data
            let extra_bytes = BASE64
                .decode(base64_extra_data)
                .context("Failed to decode base64 extra_data")?;

            if extra_bytes.len() < 3 {
                anyhow::bail!("extra_data too short for precert_entry");
            }

            let precert_len = ((extra_bytes[0] as usize) << 16)
                | ((extra_bytes[1] as usize) << 8)
                | (extra_bytes[2] as usize);

            if extra_bytes.len() < 3 + precert_len {
                anyhow::bail!("extra_data truncated: expected {} bytes", 3 + precert_len);
            }

            Ok((extra_bytes[3..3 + precert_len].to_vec(), true))
        }
        other => anyhow::bail!("Unsupported entry type: {}", other),
    }
}

/// Parse a log entry down to the certificate's names and metadata.
pub fn parse_log_entry(base64_leaf_input: &str, base64_extra_data: &str) -> Result<ParsedCert> {
    let (der, is_precert) = cert_der_from_entry(base64_leaf_input, base64_extra_data)?;
    parse_cert_der(&der, is_precert)
}

/// Extract names and metadata from DER-encoded certificate bytes.
pub fn parse_cert_der(der_bytes: &[u8], is_precert: bool) -> Result<ParsedCert> {
    let fingerprint = {
        let mut hasher = Sha256::new();
        hasher.update(der_bytes);
        hex::encode(hasher.finalize())
    };

    let (_, cert) = X509Certificate::from_der(der_bytes)
        .map_err(|e| anyhow::anyhow!("Failed to parse certificate from DER: {:?}", e))?;

    let mut dns_names = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for general_name in &san.general_names {
                if let GeneralName::DNSName(dns_name) = general_name {
                    dns_names.push(dns_name.to_string());
                }
            }
        }
    }

    let common_name = extract_cn(&cert);
    let issuer = extract_issuer(&cert);

    Ok(ParsedCert { dns_names, common_name, fingerprint, issuer, is_precert })
}

fn extract_cn(cert: &X509Certificate) -> Option<String> {
    for rdn in cert.subject().iter() {
        for attr in rdn.iter() {
            if attr.attr_type() == &oid_registry::OID_X509_COMMON_NAME {
                if let Ok(cn) = attr.attr_value().as_str() {
                    return Some(cn.to_string());
                }
            }
        }
    }
    None
}

fn extract_issuer(cert: &X509Certificate) -> Option<String> {
    for rdn in cert.issuer().iter() {
        for attr in rdn.iter() {
            if attr.attr_type() == &oid_registry::OID_X509_COMMON_NAME {
                if let Ok(cn) = attr.attr_value().as_str() {
                    return Some(cn.to_string());
                }
            }
        }
    }
    Some(cert.issuer().to_string())
}
