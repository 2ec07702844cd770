use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};

use crate::runs::persistence::{EntryId, LogEntry, LogStore, MetadataStore, StoreError};

impl From<surrealdb::Error> for StoreError {
    fn from(err: surrealdb::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Run store on SurrealDB.
///
/// Log entries live in `run_log` (one row per entry), metadata hashes in
/// `run_meta` and key expiries in `run_ttl`. Expired keys are purged when
/// they are next read.
#[derive(Debug)]
pub struct SurrealRunStore {
    db: Surreal<Any>,
}

/// Appends give up after this many id collisions in a row.
const APPEND_ATTEMPTS: u32 = 16;

/// Record id of a log entry. Zero-padded so ids sort like entries.
fn log_record_id(key: &str, id: EntryId) -> String {
    format!("{key}|{:020}|{:020}", id.ms, id.seq)
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRow {
    key: String,
    ms: u64,
    seq: u64,
    fields: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetaRow {
    fields: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TtlRow {
    expires_at_ms: i64,
}

impl SurrealRunStore {
    pub async fn new(connection_string: &str) -> Result<Self, StoreError> {
        let db = connect(connection_string).await?;
        db.use_ns("orchestrator").use_db("runs").await?;
        Ok(Self { db })
    }

    /// Drop `key` everywhere if its expiry has passed. Returns whether it did.
    async fn purge_if_expired(&self, key: &str) -> Result<bool, StoreError> {
        let ttl: Option<TtlRow> = self.db.select(("run_ttl", key)).await?;
        let Some(ttl) = ttl else {
            return Ok(false);
        };
        if ttl.expires_at_ms > chrono::Utc::now().timestamp_millis() {
            return Ok(false);
        }
        self.remove_key(key).await?;
        Ok(true)
    }

    async fn remove_key(&self, key: &str) -> Result<(), StoreError> {
        self.db
            .query("DELETE run_log WHERE key = $key")
            .bind(("key", key.to_owned()))
            .await?
            .check()?;
        let _: Option<MetaRow> = self.db.delete(("run_meta", key)).await?;
        let _: Option<TtlRow> = self.db.delete(("run_ttl", key)).await?;
        Ok(())
    }

    async fn last_id(&self, key: &str) -> Result<Option<EntryId>, StoreError> {
        #[derive(Deserialize)]
        struct LastId {
            ms: u64,
            seq: u64,
        }

        let mut response = self
            .db
            .query("SELECT ms, seq FROM run_log WHERE key = $key ORDER BY ms DESC, seq DESC LIMIT 1")
            .bind(("key", key.to_owned()))
            .await?;
        let last: Vec<LastId> = response.take(0)?;
        Ok(last.first().map(|row| EntryId {
            ms: row.ms,
            seq: row.seq,
        }))
    }

    async fn write_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let row = TtlRow {
            expires_at_ms: chrono::Utc::now()
                .timestamp_millis()
                .saturating_add(ttl_ms),
        };
        let _: Option<TtlRow> = self.db.upsert(("run_ttl", key)).content(row).await?;
        Ok(())
    }
}

#[async_trait]
impl LogStore for SurrealRunStore {
    async fn append(&self, key: &str, fields: &[(&str, &str)]) -> Result<EntryId, StoreError> {
        self.purge_if_expired(key).await?;

        let fields: HashMap<String, String> = fields
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut last = self.last_id(key).await?;
        let mut attempt = 0;
        loop {
            let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
            let id = EntryId::next_after(last, now);
            let row = LogRow {
                key: key.to_owned(),
                ms: id.ms,
                seq: id.seq,
                fields: fields.clone(),
            };
            // The record id is derived from the entry id, so two writers that
            // pick the same id cannot both succeed.
            let created: Result<Option<LogRow>, _> = self
                .db
                .create(("run_log", log_record_id(key, id)))
                .content(row)
                .await;
            let Err(err) = created else {
                return Ok(id);
            };

            attempt += 1;
            last = self.last_id(key).await?;
            let lost_race = last.is_some_and(|last| last >= id);
            if !lost_race || attempt >= APPEND_ATTEMPTS {
                return Err(err.into());
            }
            tracing::debug!(key, attempt, "Log entry id taken, retrying append");
        }
    }

    async fn read(
        &self,
        key: &str,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError> {
        if self.purge_if_expired(key).await? {
            return Ok(Vec::new());
        }
        let query = if after.is_some() {
            "SELECT key, ms, seq, fields FROM run_log \
             WHERE key = $key AND (ms > $ms OR (ms = $ms AND seq > $seq)) \
             ORDER BY ms ASC, seq ASC LIMIT $limit"
        } else {
            "SELECT key, ms, seq, fields FROM run_log \
             WHERE key = $key ORDER BY ms ASC, seq ASC LIMIT $limit"
        };
        let after = after.unwrap_or_default();
        let mut response = self
            .db
            .query(query)
            .bind(("key", key.to_owned()))
            .bind(("ms", after.ms))
            .bind(("seq", after.seq))
            .bind(("limit", limit))
            .await?;
        let rows: Vec<LogRow> = response.take(0)?;
        Ok(rows
            .into_iter()
            .map(|row| LogEntry {
                id: EntryId {
                    ms: row.ms,
                    seq: row.seq,
                },
                fields: row.fields,
            })
            .collect())
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.write_expiry(key, ttl).await
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.remove_key(key).await
    }
}

#[async_trait]
impl MetadataStore for SurrealRunStore {
    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        self.purge_if_expired(key).await?;
        let existing: Option<MetaRow> = self.db.select(("run_meta", key)).await?;
        let mut merged = existing.map(|row| row.fields).unwrap_or_default();
        for (field, value) in fields {
            merged.insert((*field).to_string(), value.clone());
        }
        let _: Option<MetaRow> = self
            .db
            .upsert(("run_meta", key))
            .content(MetaRow { fields: merged })
            .await?;
        Ok(())
    }

    async fn get_all_fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        if self.purge_if_expired(key).await? {
            return Ok(HashMap::new());
        }
        let row: Option<MetaRow> = self.db.select(("run_meta", key)).await?;
        Ok(row.map(|row| row.fields).unwrap_or_default())
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.write_expiry(key, ttl).await
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.remove_key(key).await
    }
}
