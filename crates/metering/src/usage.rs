//! Append-only usage log.
//!
//! Events are keyed `usage:{identity}:{reverse stamp}:{id}` so a forward
//! prefix scan yields the newest event first. A second key under
//! `usage_age:` orders the same events oldest-first for retention.

use crate::error::MeterError;
use crate::storage::Storage;
use crate::types::{stamp_to_datetime, IndexEntry, UsageEvent};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

pub(crate) const USAGE_PREFIX: &str = "usage:";
pub(crate) const USAGE_AGE_PREFIX: &str = "usage_age:";

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;

fn identity_prefix(identity: &str) -> String {
    format!("{USAGE_PREFIX}{identity}:")
}

/// One billed call, before it is stamped.
#[derive(Debug, Clone)]
pub struct NewUsage {
    pub route: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost_credits: Decimal,
    pub provider: String,
    pub model: String,
    pub meta: Value,
}

/// One page of usage, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct UsagePage {
    pub items: Vec<UsageEvent>,
    /// Opaque; pass back to continue. `None` on the last page.
    pub next_cursor: Option<String>,
}

#[derive(Clone)]
pub struct UsageRecorder {
    storage: Storage,
}

impl UsageRecorder {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Record a billed event.
    pub fn append_usage(&self, identity: &str, usage: NewUsage) -> Result<UsageEvent, MeterError> {
        let stamp = self.storage.next_stamp();
        let id = Uuid::new_v4().to_string();

        let event = UsageEvent {
            id: id.clone(),
            identity: identity.to_string(),
            route: usage.route,
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            cost_credits: usage.cost_credits,
            provider: usage.provider,
            model: usage.model,
            created_at: stamp_to_datetime(stamp),
            meta: usage.meta,
        };

        let key = format!(
            "{}{:020}:{}",
            identity_prefix(identity),
            u64::MAX - stamp,
            id
        );
        self.storage.put_json(&key, &event)?;
        self.storage.put_json(
            &format!("{USAGE_AGE_PREFIX}{stamp:020}:{id}"),
            &IndexEntry {
                identity: identity.to_string(),
                key,
            },
        )?;

        debug!(
            identity,
            route = %event.route,
            cost = %event.cost_credits,
            "Usage recorded"
        );
        Ok(event)
    }

    /// List an identity's events, most recent first.
    pub fn list_usage(
        &self,
        identity: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<UsagePage, MeterError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let prefix = identity_prefix(identity);

        if let Some(cursor) = cursor {
            if !cursor.starts_with(&prefix) {
                return Err(MeterError::InvalidRequest("invalid cursor".into()));
            }
        }

        // One extra entry tells us whether another page exists.
        let wanted = limit + 1;
        let mut found: Vec<(String, UsageEvent)> = Vec::with_capacity(wanted);
        let mut after = cursor.map(str::to_string);

        loop {
            let requested = wanted - found.len();
            let batch = self
                .storage
                .scan_prefix(&prefix, after.as_deref(), requested)?;
            let exhausted = batch.len() < requested;

            for (key, bytes) in batch {
                let event: UsageEvent = serde_json::from_slice(&bytes)?;
                after = Some(key.clone());
                // Identities containing ':' can share a key prefix with another identity
                if event.identity == identity {
                    found.push((key, event));
                }
            }

            if exhausted || found.len() >= wanted {
                break;
            }
        }

        let next_cursor = if found.len() > limit {
            found.truncate(limit);
            found.last().map(|(key, _)| key.clone())
        } else {
            None
        };

        Ok(UsagePage {
            items: found.into_iter().map(|(_, event)| event).collect(),
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn usage(route: &str, cost: &str) -> NewUsage {
        NewUsage {
            route: route.to_string(),
            tokens_in: 10,
            tokens_out: 20,
            cost_credits: cost.parse().unwrap(),
            provider: "a".into(),
            model: "m".into(),
            meta: json!({}),
        }
    }

    #[test]
    fn test_append_then_list_returns_new_event_first() {
        let recorder = UsageRecorder::new(Storage::memory());
        let id = "a@example.com";

        recorder.append_usage(id, usage("/si/ask", "0.01")).unwrap();
        recorder.append_usage(id, usage("/si/ask", "0.02")).unwrap();
        let newest = recorder.append_usage(id, usage("si", "0.03")).unwrap();

        let page = recorder.list_usage(id, 10, None).unwrap();
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.items[0].id, newest.id);
        assert_eq!(page.items[0].route, "si");
        assert!(page.items[0].created_at >= page.items[1].created_at);
        assert!(page.items[1].created_at >= page.items[2].created_at);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_list_pagination() {
        let recorder = UsageRecorder::new(Storage::memory());
        let id = "a@example.com";

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(recorder.append_usage(id, usage("/si/ask", "0.01")).unwrap().id);
        }
        ids.reverse();

        let first = recorder.list_usage(id, 2, None).unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next_cursor.clone().unwrap();

        let second = recorder.list_usage(id, 2, Some(&cursor)).unwrap();
        let third = recorder
            .list_usage(id, 2, second.next_cursor.as_deref())
            .unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.next_cursor.is_none());

        let seen: Vec<String> = first
            .items
            .iter()
            .chain(&second.items)
            .chain(&third.items)
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(seen, ids);
    }

    #[test]
    fn test_list_is_per_identity() {
        let recorder = UsageRecorder::new(Storage::memory());
        recorder.append_usage("a", usage("/si/ask", "0.01")).unwrap();
        recorder.append_usage("a:b", usage("/si/ask", "0.01")).unwrap();
        recorder.append_usage("b", usage("/si/ask", "0.01")).unwrap();

        let page = recorder.list_usage("a", 10, None).unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.items.iter().all(|e| e.identity == "a"));

        assert!(recorder.list_usage("nobody", 10, None).unwrap().items.is_empty());
    }

    #[test]
    fn test_list_rejects_foreign_cursor() {
        let recorder = UsageRecorder::new(Storage::memory());
        recorder.append_usage("a", usage("/si/ask", "0.01")).unwrap();
        recorder.append_usage("a", usage("/si/ask", "0.01")).unwrap();
        let cursor = recorder.list_usage("a", 1, None).unwrap().next_cursor.unwrap();

        let err = recorder.list_usage("b", 1, Some(&cursor)).unwrap_err();
        assert!(matches!(err, MeterError::InvalidRequest(_)));
    }

    #[test]
    fn test_age_index_written() {
        let storage = Storage::memory();
        let recorder = UsageRecorder::new(storage.clone());
        let event = recorder.append_usage("a", usage("/si/ask", "0.01")).unwrap();

        let index = storage.scan_prefix(USAGE_AGE_PREFIX, None, 10).unwrap();
        assert_eq!(index.len(), 1);
        let entry: IndexEntry = serde_json::from_slice(&index[0].1).unwrap();
        assert_eq!(entry.identity, "a");
        assert!(entry.key.ends_with(&event.id));
        assert!(storage.get_raw(&entry.key).unwrap().is_some());
    }
}
