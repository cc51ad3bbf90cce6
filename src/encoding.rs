// src/encoding.rs
//! serde helpers for the JSON wire format: byte strings travel as base64.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serializer};

use crate::merkle::{Hash, HASH_SIZE};

pub mod b64hash {
    use super::*;

    pub fn serialize<S: Serializer>(hash: &Hash, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Hash, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = STANDARD.decode(&s).map_err(DeError::custom)?;
        if bytes.len() != HASH_SIZE {
            return Err(DeError::custom(format!(
                "expected {HASH_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&bytes);
        Ok(hash)
    }
}

pub mod b64bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(DeError::custom)
    }
}

pub mod b64hash_list {
    use super::*;

    pub fn serialize<S: Serializer>(hashes: &Vec<Hash>, s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(hashes.iter().map(|h| STANDARD.encode(h)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Hash>, D::Error> {
        let strings = Vec::<String>::deserialize(d)?;
        strings
            .into_iter()
            .map(|s| {
                let bytes = STANDARD.decode(&s).map_err(DeError::custom)?;
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| DeError::custom(format!("expected {HASH_SIZE} bytes")))
            })
            .collect()
    }
}
