//! In-memory store
//!
//! Holds serialized records so decoding failures behave like the file store.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{CacheEntry, KeyValueStore};
use crate::error::DetectorError;

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw text under a key, bypassing serialization
    pub fn insert_raw(&self, key: &str, text: &str) {
        self.records().insert(key.to_string(), text.to_string());
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, DetectorError> {
        let Some(text) = self.records().get(key).cloned() else {
            return Ok(None);
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| DetectorError::CacheCorrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), DetectorError> {
        let text = serde_json::to_string(entry)?;
        self.records().insert(key.to_string(), text);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, DetectorError> {
        Ok(self.records().remove(key).is_some())
    }

    fn retain(&self, keep: &dyn Fn(&CacheEntry) -> bool) -> Result<usize, DetectorError> {
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, text| {
            serde_json::from_str::<CacheEntry>(text).is_ok_and(|entry| keep(&entry))
        });
        Ok(before - records.len())
    }

    fn keys(&self) -> Result<Vec<String>, DetectorError> {
        let mut keys: Vec<String> = self.records().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> Result<usize, DetectorError> {
        let mut records = self.records();
        let n = records.len();
        records.clear();
        Ok(n)
    }

    fn len(&self) -> Result<usize, DetectorError> {
        Ok(self.records().len())
    }
}
