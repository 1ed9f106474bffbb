//! Persistent backend on sled.

use super::KvBackend;
use crate::error::MeterError;
use std::ops::Bound;
use std::path::Path;
use tracing::info;

/// sled-backed keyspace. sled keeps keys in byte order and supports
/// compare-and-swap natively.
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    pub fn open(path: &Path) -> Result<Self, MeterError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(path)?;
        info!("Opened store at {:?} ({} keys)", path, db.len());
        Ok(Self { db })
    }
}

impl KvBackend for SledBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MeterError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn insert(&self, key: &str, value: &[u8]) -> Result<(), MeterError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, MeterError> {
        Ok(self.db.remove(key)?.is_some())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, MeterError> {
        Ok(self.db.compare_and_swap(key, expected, new)?.is_ok())
    }

    fn scan_prefix(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, MeterError> {
        let iter = match start_after {
            Some(after) if after >= prefix => self.db.range::<&[u8], _>((
                Bound::Excluded(after.as_bytes()),
                Bound::Unbounded,
            )),
            _ => self.db.scan_prefix(prefix),
        };

        let mut out = Vec::new();
        for item in iter {
            if out.len() >= limit {
                break;
            }
            let (k, v) = item?;
            if !k.starts_with(prefix.as_bytes()) {
                break;
            }
            out.push((String::from_utf8_lossy(&k).into_owned(), v.to_vec()));
        }
        Ok(out)
    }

    fn flush(&self) -> Result<(), MeterError> {
        self.db.flush()?;
        Ok(())
    }
}
