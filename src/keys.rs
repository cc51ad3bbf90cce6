// src/keys.rs
//! ECDSA P-256 keys for signing map heads.
//!
//! Private keys are SEC1 `EC PRIVATE KEY` PEM files, created on first run if
//! missing; public keys are saved as PKIX `PUBLIC KEY` PEM. Signatures are
//! ASN.1 DER. Signing is RFC 6979 deterministic, so republishing the same
//! head yields a byte-identical signature.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use p256::SecretKey;
use rand_core::OsRng;
use tracing::info;

/// The map's signer. Internally thread-safe; signing hashes the message with
/// SHA-256 before the ECDSA operation.
pub struct MapSigner {
    signing_key: SigningKey,
}

impl MapSigner {
    pub fn new(signing_key: SigningKey) -> Self {
        MapSigner { signing_key }
    }

    pub fn public_key(&self) -> VerifyingKey {
        *self.signing_key.verifying_key()
    }

    /// ASN.1 DER signature over `sha256(message)`.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let sig: Signature = self.signing_key.sign(message);
        sig.to_der().as_bytes().to_vec()
    }
}

/// Verify an ASN.1 DER signature over `sha256(message)`.
pub fn verify_asn1(public_key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    match Signature::from_der(signature) {
        Ok(sig) => public_key.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}

fn generate_and_save_private_key(pemfile: &Path) -> Result<SigningKey> {
    let secret = SecretKey::random(&mut OsRng);
    let pem = secret
        .to_sec1_pem(LineEnding::LF)
        .context("error encoding ECDSA private key")?;
    fs::write(pemfile, pem.as_bytes())
        .with_context(|| format!("error saving ECDSA private key to {}", pemfile.display()))?;
    info!("created new ECDSA private key: saved to {}", pemfile.display());
    Ok(SigningKey::from(secret))
}

fn load_or_generate_private_key(pemfile: &Path) -> Result<SigningKey> {
    if !pemfile.exists() {
        return generate_and_save_private_key(pemfile);
    }
    let pemdata = fs::read_to_string(pemfile)
        .with_context(|| format!("error reading PEM file {}", pemfile.display()))?;
    let secret = SecretKey::from_sec1_pem(&pemdata)
        .map_err(|e| anyhow::anyhow!("invalid EC private key in {}: {e}", pemfile.display()))?;
    Ok(SigningKey::from(secret))
}

fn save_public_key(public_key: &VerifyingKey, pemfile: &Path) -> Result<()> {
    let pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .context("error encoding ECDSA public key")?;
    fs::write(pemfile, pem)
        .with_context(|| format!("error saving ECDSA public key to {}", pemfile.display()))?;
    info!("saved public ECDSA key to {}", pemfile.display());
    Ok(())
}

/// Load the private key (creating it if missing) and make sure the matching
/// public key file exists.
pub fn load_or_generate_keys(private_pem: &Path, public_pem: &Path) -> Result<MapSigner> {
    let key = load_or_generate_private_key(private_pem)?;
    if !public_pem.exists() {
        save_public_key(&VerifyingKey::from(&key), public_pem)?;
    }
    Ok(MapSigner::new(key))
}

/// Load a PKIX public key PEM.
pub fn load_public_key(pemfile: &Path) -> Result<VerifyingKey> {
    let pemdata = fs::read_to_string(pemfile)
        .with_context(|| format!("error reading PEM file {}", pemfile.display()))?;
    VerifyingKey::from_public_key_pem(&pemdata)
        .map_err(|e| anyhow::anyhow!("invalid public key in {}: {e}", pemfile.display()))
}
