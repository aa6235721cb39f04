//! Database schema definitions for SQLx.
//!
//! This module contains the row types of the `tasks` table and the status
//! state machine they move through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Priority value for urgent work.
pub const PRIORITY_HIGH: i16 = 0;
/// Priority value used when nothing else is requested.
pub const PRIORITY_NORMAL: i16 = 1;
/// Priority value for work that can wait.
pub const PRIORITY_LOW: i16 = 2;

/// Lifecycle state of a task.
///
/// ```text
/// pending/scheduled --claim--> processing --success--> completed
/// processing --recoverable failure, budget left--> pending (backoff)
/// processing --budget exhausted / unrecoverable--> failed
/// pending/scheduled --cancel--> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Eligible as soon as its dependencies are satisfied.
    Pending,
    /// Submitted with a `scheduled_at` in the future.
    Scheduled,
    /// Claimed by exactly one worker.
    Processing,
    /// Handler succeeded. Terminal.
    Completed,
    /// Retry budget exhausted or unrecoverable error. Terminal.
    Failed,
    /// Cancelled before it was claimed. Terminal.
    Cancelled,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Scheduled,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// The value stored in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further automatic transition can happen from this status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether a task in this status may be claimed (dependencies and
    /// schedule time permitting).
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Scheduled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when the `status` column holds a value this crate does not know.
#[derive(Debug, thiserror::Error)]
#[error("unknown task status `{0}`")]
pub struct UnknownStatus(pub String);

impl TryFrom<String> for TaskStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| UnknownStatus(value.to_owned()))
    }
}

/// Represents a task record in the database
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for the task
    pub id: Uuid,
    /// Tenant owning the task
    pub tenant_id: Uuid,
    /// Type identifier for the task (used for dispatch)
    pub task_type: String,
    /// Current lifecycle state
    #[sqlx(try_from = "String")]
    pub status: TaskStatus,
    /// Priority of the task (lower = more urgent)
    pub priority: i16,
    /// JSON data interpreted by the handler
    pub payload: Value,
    /// Handler output, or error detail after a failed attempt
    pub result: Option<Value>,
    /// Earliest time the task may be claimed
    pub scheduled_at: DateTime<Utc>,
    /// Set when the current claim was taken
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the task reached `completed` or `failed`
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of retries already scheduled
    pub retry_count: i32,
    /// Retry budget
    pub max_retries: i32,
    /// Per-attempt execution ceiling
    pub timeout_seconds: i32,
    /// Tasks that must be `completed` before this one is eligible
    pub depends_on: Vec<Uuid>,
    /// Timestamp when the task was submitted
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last state change
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Per-attempt timeout as a [`std::time::Duration`].
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::try_from(self.timeout_seconds).unwrap_or(1).max(1))
    }

    /// Whether the retry budget allows another attempt after a failure.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// The column list selected wherever a full [`Task`] is read.
pub(crate) const TASK_COLUMNS: &str = "id, tenant_id, task_type, status, priority, payload, result, \
     scheduled_at, started_at, completed_at, retry_count, max_retries, timeout_seconds, \
     depends_on, created_at, updated_at";

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_column_text() {
        for status in TaskStatus::ALL {
            let parsed = TaskStatus::try_from(status.as_str().to_owned()).unwrap();
            assert_eq!(parsed, status);
        }
        assert!(TaskStatus::try_from("running".to_owned()).is_err());
    }

    #[test]
    fn terminal_and_claimable_statuses_are_disjoint() {
        for status in TaskStatus::ALL {
            assert!(!(status.is_terminal() && status.is_claimable()), "{status}");
        }
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(!TaskStatus::Processing.is_claimable());
    }
}
