use crate::notify::WakeSignal;
use crate::rate_limit::RateLimiter;
use crate::registry::TaskRegistry;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::storage::TaskStore;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use anyhow::anyhow;
use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};
use uuid::Uuid;

/// What one iteration of the worker loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Iteration {
    /// A task was claimed and its outcome recorded.
    Processed(Uuid),
    /// Every task type is at its rate limit, or the claimed one was.
    RateLimited,
    /// Nothing is eligible right now.
    Idle,
}

/// One slot of the worker pool.
pub(crate) struct Worker<Context> {
    pub(crate) store: TaskStore,
    pub(crate) context: Context,
    pub(crate) task_registry: Arc<TaskRegistry<Context>>,
    pub(crate) task_types: Arc<[String]>,
    pub(crate) rate_limiter: RateLimiter,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) wake: WakeSignal,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run tasks forever, or until nothing is eligible if `shutdown_when_queue_empty` is set.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        loop {
            match self.run_next_task().await {
                Ok(Iteration::Processed(_)) => {}
                Ok(Iteration::Idle) if self.shutdown_when_queue_empty => {
                    debug!("No eligible tasks found. Shutting down the worker…");
                    break;
                }
                Ok(Iteration::Idle) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No eligible tasks found. Waiting up to {sleep_duration:?}…");
                    self.wake.wait(sleep_duration).await;
                }
                Ok(Iteration::RateLimited) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("All claimable task types are rate limited. Retrying in {sleep_duration:?}…");
                    sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to run task: {error}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Claim and run the next eligible task, if there is one.
    ///
    /// Errors are store failures. They leave the task row as it was and the
    /// caller retries on its next tick.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run_next_task(&self) -> anyhow::Result<Iteration> {
        let task_types = self.rate_limiter.available_types(&self.task_types);
        if task_types.is_empty() {
            return Ok(Iteration::RateLimited);
        }

        trace!("Looking for next task…");

        let Some(task) = self.store.claim_next(&task_types).await? else {
            return Ok(Iteration::Idle);
        };

        let span = info_span!("task", task.id = %task.id, task.type = %task.task_type);

        let Some(_permit) = self.rate_limiter.try_acquire(&task.task_type) else {
            debug!(parent: &span, "Rate limit reached, releasing claim…");
            self.store.release_claim(&task).await?;
            return Ok(Iteration::RateLimited);
        };

        debug!(parent: &span, "Running task…");

        let context = self.context.clone();
        let run_task_fn = self.task_registry.get(&task.task_type).cloned();
        let timeout = task.timeout();

        let future = with_sentry_transaction(&task.task_type, || async {
            let run_task_fn =
                run_task_fn.ok_or_else(|| anyhow!("Unknown task type {}", task.task_type))?;

            let attempt = AssertUnwindSafe(run_task_fn(context, task.clone())).catch_unwind();
            match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(try_to_extract_panic_info(&*panic)),
                Err(_) => Err(anyhow!("task timed out after {}s", task.timeout_seconds)),
            }
        });

        let result = future
            .instrument(span.clone())
            .bind_hub(Hub::current())
            .await;

        match result {
            Ok(output) => {
                debug!(parent: &span, "Marking task as completed…");
                if !self.store.mark_completed(&task, output).await? {
                    warn!(parent: &span, "Claim was lost before the result could be recorded");
                }
            }
            Err(error) => {
                warn!(parent: &span, "Failed to run task: {error:#}");
                let recorded = match self.retry_policy.plan(&task, &error, Utc::now()) {
                    RetryDecision::Reschedule {
                        next_scheduled_at,
                        report,
                    } => {
                        debug!(parent: &span, %next_scheduled_at, "Rescheduling task…");
                        self.store
                            .increment_retry(&task, next_scheduled_at, &report)
                            .await?
                    }
                    RetryDecision::Terminal(report) => {
                        debug!(parent: &span, reason = %report.reason, "Marking task as failed…");
                        self.store.mark_failed(&task, &report).await?
                    }
                };
                if !recorded {
                    warn!(parent: &span, "Claim was lost before the failure could be recorded");
                }
            }
        }

        Ok(Iteration::Processed(task.id))
    }
}
