// src/mapstore/mem.rs
//! In-memory `Base` store.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{Base, KeyInfo};
use crate::error::StoreError;

/// HashMap-backed store. `set` on an existing key is a no-op when the value
/// is identical (content addressing makes collision equivalent to identity)
/// and an error otherwise.
#[derive(Default)]
pub struct MemStore {
    mem: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Base for MemStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.mem
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::UnknownKey(hex::encode(key)))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut mem = self.mem.write();
        if let Some(old) = mem.get(key) {
            if old == value {
                return Ok(());
            }
            return Err(StoreError::KeyConflict(hex::encode(key)));
        }
        mem.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, _key: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::DeleteUnsupported)
    }

    fn len(&self) -> usize {
        self.mem.read().len()
    }

    fn process_keys(&self, keys: &[KeyInfo]) -> Result<(), StoreError> {
        let mut mem = self.mem.write();
        for ki in keys {
            if !ki.keep {
                mem.remove(&ki.key);
            }
        }
        Ok(())
    }
}
