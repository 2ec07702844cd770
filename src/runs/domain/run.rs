//! Run identity, lifecycle status, and the metadata snapshot published for it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata field names as they appear in the Metadata Store hash.
pub mod fields {
    pub const STATUS: &str = "status";
    pub const WORKSPACE_ID: &str = "workspaceId";
    pub const PERSONA: &str = "persona";
    pub const CREATED_AT: &str = "createdAt";
    pub const STARTED_AT: &str = "startedAt";
    pub const COMPLETED_AT: &str = "completedAt";
    pub const ERROR: &str = "error";
    pub const TURN_ID: &str = "turnId";
    pub const PENDING_INTERRUPT: &str = "pendingInterrupt";
}

/// Lifecycle status of an agent run.
///
/// `Completed`, `Failed` and `Cancelled` are terminal. `AwaitingApproval` is a
/// paused state: the run keeps its context so it can be resumed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is an edge of the run state machine.
    pub fn can_transition_to(self, next: Self) -> bool {
        use RunStatus::{AwaitingApproval, Cancelled, Completed, Failed, Queued, Running};
        match (self, next) {
            (Queued, Running)
            | (Running, AwaitingApproval | Completed | Failed)
            | (AwaitingApproval, Queued) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown run status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for RunStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Status snapshot of a run as other processes see it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRun {
    pub run_id: String,
    pub workspace_id: String,
    pub persona: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_interrupt: Option<String>,
}

impl AgentRun {
    /// Rebuild a run from its metadata hash. Returns `None` when the hash is
    /// empty (never written or expired) or lacks a readable status.
    pub fn from_fields(run_id: &str, map: &HashMap<String, String>) -> Option<Self> {
        if map.is_empty() {
            return None;
        }
        let status = map.get(fields::STATUS)?.parse().ok()?;
        let created_at = parse_timestamp(map.get(fields::CREATED_AT))?;

        Some(Self {
            run_id: run_id.to_string(),
            workspace_id: map.get(fields::WORKSPACE_ID).cloned().unwrap_or_default(),
            persona: map.get(fields::PERSONA).cloned().unwrap_or_default(),
            status,
            created_at,
            started_at: parse_timestamp(map.get(fields::STARTED_AT)),
            completed_at: parse_timestamp(map.get(fields::COMPLETED_AT)),
            error: non_empty(map.get(fields::ERROR)),
            turn_id: non_empty(map.get(fields::TURN_ID)),
            pending_interrupt: non_empty(map.get(fields::PENDING_INTERRUPT)),
        })
    }
}

/// Format a timestamp the way it is stored in the metadata hash.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: Option<&String>) -> Option<DateTime<Utc>> {
    let raw = raw.filter(|s| !s.is_empty())?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn non_empty(raw: Option<&String>) -> Option<String> {
    raw.filter(|s| !s.is_empty()).cloned()
}
