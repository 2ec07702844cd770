//! In-process run store.
//!
//! Implements both store contracts on plain maps. Expiry is enforced lazily:
//! an expired key is dropped the next time anything touches it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::runs::persistence::{EntryId, LogEntry, LogStore, MetadataStore, StoreError};

#[derive(Debug, Default)]
struct LogKey {
    entries: Vec<LogEntry>,
    last_id: Option<EntryId>,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct MetaKey {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

fn expired(expires_at: Option<Instant>) -> bool {
    expires_at.is_some_and(|at| at <= Instant::now())
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Memory-backed Durable Log Store and Metadata Store.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    logs: Mutex<HashMap<String, LogKey>>,
    meta: Mutex<HashMap<String, MetaKey>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn logs(&self) -> MutexGuard<'_, HashMap<String, LogKey>> {
        let mut guard = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        guard.retain(|_, log| !expired(log.expires_at));
        guard
    }

    fn meta(&self) -> MutexGuard<'_, HashMap<String, MetaKey>> {
        let mut guard = self.meta.lock().unwrap_or_else(PoisonError::into_inner);
        guard.retain(|_, meta| !expired(meta.expires_at));
        guard
    }
}

#[async_trait]
impl LogStore for MemoryRunStore {
    async fn append(&self, key: &str, fields: &[(&str, &str)]) -> Result<EntryId, StoreError> {
        let mut logs = self.logs();
        let log = logs.entry(key.to_string()).or_default();
        let id = EntryId::next_after(log.last_id, now_ms());
        log.last_id = Some(id);
        log.entries.push(LogEntry {
            id,
            fields: fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        });
        Ok(id)
    }

    async fn read(
        &self,
        key: &str,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let logs = self.logs();
        let Some(log) = logs.get(key) else {
            return Ok(Vec::new());
        };
        Ok(log
            .entries
            .iter()
            .filter(|entry| after.is_none_or(|after| entry.id > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(log) = self.logs().get_mut(key) {
            log.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.logs().remove(key);
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MemoryRunStore {
    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        let mut meta = self.meta();
        let entry = meta.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.fields.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn get_all_fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self
            .meta()
            .get(key)
            .map(|entry| entry.fields.clone())
            .unwrap_or_default())
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(entry) = self.meta().get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.meta().remove(key);
        Ok(())
    }
}
