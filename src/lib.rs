#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod cleaner;
mod config;
mod dependency;
mod errors;
mod notify;
mod query;
mod rate_limit;
mod registry;
mod retry;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod task;
mod util;
mod worker;

/// Configuration loaded at process start.
pub use self::config::{ConfigError, SchedulerConfig};
/// Dependency gating check.
pub use self::dependency::is_eligible;
/// Error types and the unrecoverable marker.
pub use self::errors::{ResultExt, SubmitError, Unrecoverable, is_unrecoverable};
/// Wake-up channel.
pub use self::notify::{NOTIFY_CHANNEL, WakeSignal, notify};
/// Task listing and statistics.
pub use self::query::{TaskFilter, TaskStats};
/// Per-type concurrency limits.
pub use self::rate_limit::{RateLimiter, RatePermit};
/// Backoff and failure classification.
pub use self::retry::{FailureReport, RetryDecision, RetryPolicy};
/// The main runner that orchestrates task processing.
pub use self::runner::{Configured, RunHandle, Runner, Unconfigured};
/// Core task row types.
pub use self::schema::{Task, TaskStatus};
/// Persistence of tasks.
pub use self::storage::{SubmitDefaults, TaskStore};
/// The main trait for defining background tasks, and untyped submissions.
pub use self::task::{BackgroundTask, NewTask};

use sqlx::PgPool;
use sqlx::migrate::MigrateError;

/// Create or upgrade the `tasks` table and its indexes.
pub async fn setup_database(pool: &PgPool) -> Result<(), MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
