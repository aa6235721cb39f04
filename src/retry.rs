//! Backoff and failure classification.
//!
//! The planner only looks at the recoverable/unrecoverable flag and the
//! retry budget of the task. It never inspects the error message.

use crate::errors::is_unrecoverable;
use crate::schema::Task;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::time::Duration;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3600);

/// Exponential backoff with a ceiling: `min(2^retry_count * base, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a policy. A `max_delay` below `base_delay` caps every delay at `max_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// The delay applied after the attempt made with `retry_count` prior retries.
    pub fn delay(&self, retry_count: i32) -> Duration {
        let exponent = u32::try_from(retry_count.max(0)).unwrap_or(0);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// Decide what happens to `task` after its handler failed with `error`.
    pub fn plan(&self, task: &Task, error: &anyhow::Error, now: DateTime<Utc>) -> RetryDecision {
        let unrecoverable = is_unrecoverable(error);
        let message = format!("{error:#}");

        if unrecoverable {
            return RetryDecision::Terminal(FailureReport {
                error: message,
                retry_count: task.retry_count,
                unrecoverable: true,
                reason: "failed immediately, will not retry".to_owned(),
            });
        }

        if !task.has_retry_budget() {
            return RetryDecision::Terminal(FailureReport {
                error: message,
                retry_count: task.retry_count,
                unrecoverable: false,
                reason: gave_up_reason(task.retry_count + 1),
            });
        }

        let delay = TimeDelta::from_std(self.delay(task.retry_count)).unwrap_or(TimeDelta::MAX);
        let next = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Reschedule {
            next_scheduled_at: next,
            report: FailureReport {
                error: message,
                retry_count: task.retry_count + 1,
                unrecoverable: false,
                reason: format!("retry {} of {} scheduled", task.retry_count + 1, task.max_retries),
            },
        }
    }
}

fn gave_up_reason(attempts: i32) -> String {
    if attempts == 1 {
        "gave up after 1 attempt".to_owned()
    } else {
        format!("gave up after {attempts} attempts")
    }
}

/// Outcome of [`RetryPolicy::plan`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Put the task back to `pending`, eligible again at `next_scheduled_at`.
    Reschedule {
        /// When the next attempt becomes eligible.
        next_scheduled_at: DateTime<Utc>,
        /// Detail stored in the task's `result` column.
        report: FailureReport,
    },
    /// Move the task to terminal `failed`.
    Terminal(FailureReport),
}

/// Error detail written to the `result` column of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    /// The handler error, including its context chain.
    pub error: String,
    /// Retry count after this failure was recorded.
    pub retry_count: i32,
    /// Whether the handler classified the failure as unrecoverable.
    pub unrecoverable: bool,
    /// Human-readable summary of what happens next.
    pub reason: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::errors::Unrecoverable;
    use crate::schema::TaskStatus;
    use anyhow::anyhow;
    use serde_json::Value;
    use uuid::Uuid;

    fn task(retry_count: i32, max_retries: i32) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            task_type: "transcode".into(),
            status: TaskStatus::Processing,
            priority: 0,
            payload: Value::Null,
            result: None,
            scheduled_at: now,
            started_at: Some(now),
            completed_at: None,
            retry_count,
            max_retries,
            timeout_seconds: 300,
            depends_on: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn delays_double_until_the_ceiling() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..9).map(|k| policy.delay(k).as_secs()).collect();
        assert_eq!(delays, [60, 120, 240, 480, 960, 1920, 3600, 3600, 3600]);
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn huge_retry_counts_saturate() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.delay(i32::MAX), Duration::from_secs(10));
        assert_eq!(policy.delay(-3), Duration::from_secs(1));
    }

    #[test]
    fn recoverable_failures_walk_the_budget() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let error = anyhow!("upstream returned 503");

        for (retry_count, expected_secs) in [(0, 60), (1, 120), (2, 240)] {
            match policy.plan(&task(retry_count, 3), &error, now) {
                RetryDecision::Reschedule {
                    next_scheduled_at,
                    report,
                } => {
                    assert_eq!((next_scheduled_at - now).num_seconds(), expected_secs);
                    assert_eq!(report.retry_count, retry_count + 1);
                    assert!(!report.unrecoverable);
                }
                other => panic!("expected reschedule, got {other:?}"),
            }
        }

        match policy.plan(&task(3, 3), &error, now) {
            RetryDecision::Terminal(report) => {
                assert_eq!(report.retry_count, 3);
                assert!(!report.unrecoverable);
                assert_eq!(report.reason, "gave up after 4 attempts");
            }
            other => panic!("expected terminal, got {other:?}"),
        }

        match policy.plan(&task(0, 0), &error, now) {
            RetryDecision::Terminal(report) => {
                assert_eq!(report.reason, "gave up after 1 attempt");
            }
            other => panic!("expected terminal, got {other:?}"),
        }
    }

    #[test]
    fn unrecoverable_failures_ignore_the_budget() {
        let policy = RetryPolicy::default();
        let error: anyhow::Error = Unrecoverable::msg("missing API key").into();

        match policy.plan(&task(0, 5), &error, Utc::now()) {
            RetryDecision::Terminal(report) => {
                assert_eq!(report.retry_count, 0);
                assert!(report.unrecoverable);
                assert_eq!(report.error, "missing API key");
                assert_eq!(report.reason, "failed immediately, will not retry");
            }
            other => panic!("expected terminal, got {other:?}"),
        }
    }

    #[test]
    fn report_serializes_to_result_json() {
        let report = FailureReport {
            error: "boom".into(),
            retry_count: 2,
            unrecoverable: false,
            reason: "gave up after 3 attempts".into(),
        };
        insta::assert_compact_json_snapshot!(
            serde_json::to_value(&report).unwrap(),
            @r#"{"error": "boom", "reason": "gave up after 3 attempts", "retry_count": 2, "unrecoverable": false}"#
        );
    }
}
