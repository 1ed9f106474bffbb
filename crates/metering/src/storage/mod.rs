//! Key-value persistence shared by the ledger, usage recorder and job store.
//!
//! All three stores live in one ordered keyspace. Ordering is what makes
//! recency listing and queue scans work without secondary indexes, so the
//! backends must iterate keys in byte order.

mod memory;
mod sled_backend;

pub use memory::MemoryBackend;
pub use sled_backend::SledBackend;

use crate::error::MeterError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Ordered key-value backend.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MeterError>;

    fn insert(&self, key: &str, value: &[u8]) -> Result<(), MeterError>;

    /// Remove a key. Returns whether it existed.
    fn remove(&self, key: &str) -> Result<bool, MeterError>;

    /// Atomically replace `expected` with `new` (`None` meaning absent).
    /// Returns `false` without writing when the current value differs.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, MeterError>;

    /// Keys starting with `prefix` in ascending order, strictly after
    /// `start_after` when given, at most `limit` entries.
    fn scan_prefix(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, MeterError>;

    fn flush(&self) -> Result<(), MeterError>;
}

/// Monotonic nanosecond clock. Stamps are strictly increasing within one
/// process so keys derived from them never collide or reorder.
#[derive(Debug, Default)]
pub struct StampClock {
    last: AtomicU64,
}

impl StampClock {
    pub fn next(&self) -> u64 {
        let now = now_nanos();
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Nanoseconds since the Unix epoch.
pub fn now_nanos() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or_default()
}

/// Handle to the shared keyspace.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn KvBackend>,
    clock: Arc<StampClock>,
}

impl Storage {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            clock: Arc::new(StampClock::default()),
        }
    }

    /// In-memory storage (tests and non-persistent deployments).
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Persistent storage backed by a sled database at `path`.
    pub fn open(path: &Path) -> Result<Self, MeterError> {
        Ok(Self::new(Arc::new(SledBackend::open(path)?)))
    }

    /// Next ordering stamp.
    pub fn next_stamp(&self) -> u64 {
        self.clock.next()
    }

    pub fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, MeterError> {
        self.backend.get(key)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, MeterError> {
        match self.backend.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), MeterError> {
        let bytes = serde_json::to_vec(value)?;
        self.backend.insert(key, &bytes)
    }

    pub fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), MeterError> {
        self.backend.insert(key, value)
    }

    pub fn remove(&self, key: &str) -> Result<bool, MeterError> {
        self.backend.remove(key)
    }

    pub fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, MeterError> {
        self.backend.compare_and_swap(key, expected, new)
    }

    pub fn scan_prefix(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>, MeterError> {
        self.backend.scan_prefix(prefix, start_after, limit)
    }

    pub fn flush(&self) -> Result<(), MeterError> {
        self.backend.flush()
    }
}
