//! Client contracts for the Durable Log Store and the Metadata Store.
//!
//! A run's output lines go to an append-only, per-key ordered log so other
//! consumers can replay them; its status snapshot goes to a small keyed hash.
//! Both keys carry an expiry so abandoned runs clean themselves up.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod providers;

/// Errors raised by a store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("malformed store record: {0}")]
    Corrupt(String),
}

/// Identifier of a log entry: milliseconds plus a per-millisecond sequence,
/// ordered and strictly increasing within one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    /// The smallest id strictly greater than `last` that is not older than `now_ms`.
    pub fn next_after(last: Option<Self>, now_ms: u64) -> Self {
        match last {
            Some(last) if now_ms <= last.ms => Self {
                ms: last.ms,
                seq: last.seq + 1,
            },
            _ => Self { ms: now_ms, seq: 0 },
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || StoreError::Corrupt(format!("invalid entry id '{s}'"));
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(Self {
            ms: ms.parse().map_err(|_| bad())?,
            seq: seq.parse().map_err(|_| bad())?,
        })
    }
}

impl Serialize for EntryId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Field holding the relayed line in each log entry.
pub const DATA_FIELD: &str = "data";

/// One entry of a run's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: EntryId,
    pub fields: HashMap<String, String>,
}

impl LogEntry {
    pub fn data(&self) -> Option<&str> {
        self.fields.get(DATA_FIELD).map(String::as_str)
    }
}

/// Append-only ordered log keyed by stream name.
#[async_trait]
pub trait LogStore: Send + Sync + fmt::Debug {
    /// Append an entry; the returned id is greater than every earlier id of `key`.
    async fn append(&self, key: &str, fields: &[(&str, &str)]) -> Result<EntryId, StoreError>;

    /// Entries of `key` with ids strictly greater than `after`, oldest first.
    async fn read(
        &self,
        key: &str,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, StoreError>;

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// Keyed field/value hash with key-level expiry.
#[async_trait]
pub trait MetadataStore: Send + Sync + fmt::Debug {
    /// Merge `fields` into the hash at `key`, creating it if absent.
    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError>;

    /// All fields of `key`; empty when the key is missing or expired.
    async fn get_all_fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// Builds the per-run store keys.
#[derive(Debug, Clone)]
pub struct RunKeys {
    prefix: String,
}

impl RunKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn stream(&self, run_id: &str) -> String {
        format!("{}:{run_id}:stream", self.prefix)
    }

    pub fn meta(&self, run_id: &str) -> String {
        format!("{}:{run_id}:meta", self.prefix)
    }
}

impl Default for RunKeys {
    fn default() -> Self {
        Self::new("agent-run")
    }
}
