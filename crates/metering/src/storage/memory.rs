//! In-memory backend.

use super::KvBackend;
use crate::error::MeterError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Ordered in-memory keyspace. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MeterError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn insert(&self, key: &str, value: &[u8]) -> Result<(), MeterError> {
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, MeterError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, MeterError> {
        let mut entries = self.entries.lock();
        if entries.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                entries.insert(key.to_string(), value.to_vec());
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }

    fn scan_prefix(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, MeterError> {
        let entries = self.entries.lock();
        let lower = match start_after {
            Some(after) if after >= prefix => Bound::Excluded(after),
            _ => Bound::Included(prefix),
        };

        Ok(entries
            .range::<str, _>((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> Result<(), MeterError> {
        Ok(())
    }
}
