//! Queued Mutations
//!
//! State-changing operations issued while offline (or speculatively before
//! server confirmation). Owned by the offline mutation queue and changed
//! only through its API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a queued mutation.
pub type MutationId = String;

/// Sync status of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Waiting for the next drain.
    #[default]
    Pending,
    /// A remote write is in flight (or its result is unknown).
    Syncing,
    /// Written to the server. Entries are removed as soon as they reach this state.
    Synced,
    /// Retry budget exhausted; waits for an explicit retry.
    Failed,
}

impl SyncStatus {
    /// Get the status name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }
}

/// A state-changing operation awaiting sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    /// Unique mutation id.
    pub id: MutationId,
    /// Mutation type, e.g. `watchlist.update`. Selects the conflict strategy.
    #[serde(rename = "type")]
    pub mutation_type: String,
    /// The value to write.
    pub payload: Value,
    /// When the mutation was enqueued.
    pub created_at: DateTime<Utc>,
    /// Current sync status.
    pub sync_status: SyncStatus,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// When the last write attempt started.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time the next attempt may start.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Last error observed, if any.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedMutation {
    /// Create a pending mutation with a fresh id.
    #[must_use]
    pub fn new(mutation_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mutation_type: mutation_type.into(),
            payload,
            created_at: Utc::now(),
            sync_status: SyncStatus::Pending,
            retry_count: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Whether a drain at `now` may claim this entry.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.sync_status == SyncStatus::Pending && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Queue depth by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Entries waiting to sync.
    pub pending: usize,
    /// Entries with a write in flight or unknown result.
    pub syncing: usize,
    /// Entries that exhausted their retries.
    pub failed: usize,
}

impl QueueStats {
    /// Total entries in the queue.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.pending + self.syncing + self.failed
    }
}

impl<'a> FromIterator<&'a QueuedMutation> for QueueStats {
    fn from_iter<I: IntoIterator<Item = &'a QueuedMutation>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::default(), |mut stats, m| {
                match m.sync_status {
                    SyncStatus::Pending => stats.pending += 1,
                    SyncStatus::Syncing => stats.syncing += 1,
                    SyncStatus::Failed => stats.failed += 1,
                    SyncStatus::Synced => {}
                }
                stats
            })
    }
}
