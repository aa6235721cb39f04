use crate::dependency::{DEPENDENCIES_SATISFIED, check_batch_acyclic};
use crate::errors::SubmitError;
use crate::notify;
use crate::retry::{FailureReport, RetryDecision, RetryPolicy};
use crate::schema::{TASK_COLUMNS, Task};
use crate::task::NewTask;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

const DEFAULT_MAX_RETRIES: i32 = 3;
const DEFAULT_TIMEOUT_SECONDS: i32 = 300;

const ABANDONED_CLAIM_ERROR: &str = "claim abandoned: worker did not report within the timeout";

/// Values used for submissions that do not set them explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitDefaults {
    /// Retry budget.
    pub max_retries: i32,
    /// Per-attempt timeout in seconds.
    pub timeout_seconds: i32,
}

impl Default for SubmitDefaults {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

/// Persistence of task rows and the atomic transitions between statuses.
#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: PgPool,
    defaults: SubmitDefaults,
}

impl TaskStore {
    /// Create a store on top of an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            defaults: SubmitDefaults::default(),
        }
    }

    /// Replace the submission defaults.
    pub fn with_defaults(mut self, defaults: SubmitDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The submission defaults in use.
    pub fn defaults(&self) -> SubmitDefaults {
        self.defaults
    }

    /// Insert a task and wake idle workers.
    pub async fn submit(&self, task: NewTask) -> Result<Uuid, SubmitError> {
        let mut tx = self.pool.begin().await?;
        let id = self.submit_tx(&mut tx, task).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Insert a task as part of the caller's transaction.
    ///
    /// The task and its wake event only become visible when `tx` commits.
    pub async fn submit_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        task: NewTask,
    ) -> Result<Uuid, SubmitError> {
        let mut ids = self.submit_batch(tx, vec![task]).await?;
        ids.pop()
            .ok_or_else(|| SubmitError::Invalid("empty submission".to_owned()))
    }

    /// Insert several tasks, possibly depending on each other, atomically.
    ///
    /// Dependencies must either already be stored for the same tenant or be
    /// part of `tasks`. Cycles are rejected.
    #[instrument(name = "tasks.submit_batch", skip_all, fields(count = tasks.len()))]
    pub async fn submit_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tasks: Vec<NewTask>,
    ) -> Result<Vec<Uuid>, SubmitError> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let tasks: Vec<(Uuid, NewTask)> = tasks
            .into_iter()
            .map(|task| (task.id.unwrap_or_else(Uuid::new_v4), task))
            .collect();
        self.validate_batch(tx, &tasks).await?;

        let mut task_types = BTreeSet::new();
        for (id, task) in &tasks {
            let max_retries = task.max_retries.unwrap_or(self.defaults.max_retries);
            let timeout_seconds = task.timeout_seconds.unwrap_or(self.defaults.timeout_seconds);

            sqlx::query(
                r"
                INSERT INTO tasks (
                    id, tenant_id, task_type, status, priority, payload,
                    scheduled_at, max_retries, timeout_seconds, depends_on
                )
                VALUES (
                    $1, $2, $3,
                    CASE WHEN $6::timestamptz > NOW() THEN 'scheduled' ELSE 'pending' END,
                    $4, $5, COALESCE($6, NOW()), $7, $8, $9
                )
                ",
            )
            .bind(id)
            .bind(task.tenant_id)
            .bind(&task.task_type)
            .bind(task.priority)
            .bind(&task.payload)
            .bind(task.scheduled_at)
            .bind(max_retries)
            .bind(timeout_seconds)
            .bind(&task.depends_on)
            .execute(&mut **tx)
            .await?;

            task_types.insert(task.task_type.as_str());
        }

        for task_type in task_types {
            notify::notify(&mut **tx, task_type).await?;
        }

        Ok(tasks.into_iter().map(|(id, _)| id).collect())
    }

    async fn validate_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tasks: &[(Uuid, NewTask)],
    ) -> Result<(), SubmitError> {
        let mut tenants: HashMap<Uuid, Uuid> = HashMap::new();
        for (id, task) in tasks {
            if tenants.insert(*id, task.tenant_id).is_some() {
                return Err(SubmitError::DuplicateId(*id));
            }
            if task.task_type.is_empty() {
                return Err(SubmitError::Invalid("task_type must not be empty".to_owned()));
            }
            if task.max_retries.is_some_and(|max_retries| max_retries < 0) {
                return Err(SubmitError::Invalid(format!(
                    "max_retries must not be negative for task {id}"
                )));
            }
            if task.timeout_seconds.is_some_and(|timeout| timeout <= 0) {
                return Err(SubmitError::Invalid(format!(
                    "timeout_seconds must be positive for task {id}"
                )));
            }
        }

        let edges: Vec<(Uuid, &[Uuid])> = tasks
            .iter()
            .map(|(id, task)| (*id, task.depends_on.as_slice()))
            .collect();
        check_batch_acyclic(&edges)?;

        let external: Vec<Uuid> = tasks
            .iter()
            .flat_map(|(_, task)| task.depends_on.iter().copied())
            .filter(|dependency| !tenants.contains_key(dependency))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        if !external.is_empty() {
            let stored: Vec<(Uuid, Uuid)> =
                sqlx::query_as("SELECT id, tenant_id FROM tasks WHERE id = ANY($1)")
                    .bind(&external)
                    .fetch_all(&mut **tx)
                    .await?;
            tenants.extend(stored);
        }

        for (id, task) in tasks {
            for dependency in &task.depends_on {
                if tenants.get(dependency) != Some(&task.tenant_id) {
                    return Err(SubmitError::UnknownDependency {
                        task: *id,
                        dependency: *dependency,
                    });
                }
            }
        }

        Ok(())
    }

    /// Atomically claim the most urgent eligible task of one of `task_types`.
    ///
    /// Rows locked by a concurrent claimer are skipped, not waited on.
    pub async fn claim_next(&self, task_types: &[String]) -> Result<Option<Task>, sqlx::Error> {
        if task_types.is_empty() {
            return Ok(None);
        }

        let query = format!(
            r"
            UPDATE tasks
            SET status = 'processing', started_at = clock_timestamp(), updated_at = NOW()
            FROM (
                SELECT t.id AS claimed_id
                FROM tasks t
                WHERE t.status IN ('pending', 'scheduled')
                  AND t.scheduled_at <= NOW()
                  AND t.task_type = ANY($1)
                  AND {DEPENDENCIES_SATISFIED}
                ORDER BY t.priority ASC, t.scheduled_at ASC, t.created_at ASC
                LIMIT 1
                FOR UPDATE OF t SKIP LOCKED
            ) next
            WHERE tasks.id = next.claimed_id
            RETURNING {TASK_COLUMNS}
            "
        );

        sqlx::query_as::<_, Task>(&query)
            .bind(task_types)
            .fetch_optional(&self.pool)
            .await
    }

    /// Record a successful run. Returns `false` if the claim was lost meanwhile.
    pub async fn mark_completed(&self, task: &Task, result: Value) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'completed', result = $3, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND started_at = $2
            ",
        )
        .bind(task.id)
        .bind(task.started_at)
        .bind(result)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if updated {
            let has_dependents = sqlx::query_scalar::<_, bool>(
                r"
                SELECT EXISTS (
                    SELECT 1 FROM tasks
                    WHERE $1 = ANY(depends_on) AND status IN ('pending', 'scheduled')
                )
                ",
            )
            .bind(task.id)
            .fetch_one(&mut *tx)
            .await?;

            if has_dependents {
                debug!("Waking workers for dependents…");
                notify::notify(&mut *tx, &task.task_type).await?;
            }
        }

        tx.commit().await?;
        Ok(updated)
    }

    /// Move a claimed task to terminal `failed`.
    pub async fn mark_failed(
        &self,
        task: &Task,
        report: &FailureReport,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'failed', result = $3, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND started_at = $2
            ",
        )
        .bind(task.id)
        .bind(task.started_at)
        .bind(Json(report))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Consume one unit of retry budget and put the task back to `pending`.
    ///
    /// Does nothing if the budget is already exhausted.
    pub async fn increment_retry(
        &self,
        task: &Task,
        next_scheduled_at: DateTime<Utc>,
        report: &FailureReport,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'pending',
                retry_count = retry_count + 1,
                scheduled_at = $3,
                started_at = NULL,
                result = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND started_at = $2
              AND retry_count < max_retries
            ",
        )
        .bind(task.id)
        .bind(task.started_at)
        .bind(next_scheduled_at)
        .bind(Json(report))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Return a claimed task to `pending` without touching its retry state.
    pub async fn release_claim(&self, task: &Task) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'pending', started_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND started_at = $2
            ",
        )
        .bind(task.id)
        .bind(task.started_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancel a task that has not been claimed yet.
    ///
    /// Returns `false` if the task does not exist for this tenant or is
    /// already processing or terminal.
    pub async fn cancel(&self, tenant_id: Uuid, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND tenant_id = $2 AND status IN ('pending', 'scheduled')
            ",
        )
        .bind(id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Load a task by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Task>, sqlx::Error> {
        sqlx::query_as::<_, Task>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Delete terminal tasks that finished more than `retention` ago.
    ///
    /// Completed tasks still awaited by a non-terminal dependent are kept. A
    /// zero retention disables purging.
    pub async fn purge(&self, retention: Duration) -> Result<u64, sqlx::Error> {
        if retention.is_zero() {
            return Ok(0);
        }

        let result = sqlx::query(
            r"
            DELETE FROM tasks
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND COALESCE(completed_at, updated_at) < NOW() - make_interval(secs => $1::float8)
              AND NOT EXISTS (
                  SELECT 1 FROM tasks dependent
                  WHERE tasks.id = ANY(dependent.depends_on)
                    AND dependent.status IN ('pending', 'scheduled', 'processing')
              )
            ",
        )
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Recover claims whose worker died.
    ///
    /// Rows still `processing` more than `grace` past their timeout are
    /// treated as a recoverable failure and planned with `retry_policy`, like
    /// any other failed attempt. Returns the number of claims recovered.
    pub async fn reap_stale_claims(
        &self,
        grace: Duration,
        retry_policy: &RetryPolicy,
    ) -> Result<u64, sqlx::Error> {
        let query = format!(
            r"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE status = 'processing'
              AND started_at + make_interval(secs => timeout_seconds + $1::float8) < NOW()
            "
        );

        let stale = sqlx::query_as::<_, Task>(&query)
            .bind(grace.as_secs_f64())
            .fetch_all(&self.pool)
            .await?;

        let mut recovered = 0;
        for task in stale {
            let error = anyhow!(ABANDONED_CLAIM_ERROR);
            // Both writes are fenced on the claim, so a worker that reports
            // late or a concurrent reaper makes them a no-op.
            let updated = match retry_policy.plan(&task, &error, Utc::now()) {
                RetryDecision::Reschedule {
                    next_scheduled_at,
                    report,
                } => self.increment_retry(&task, next_scheduled_at, &report).await?,
                RetryDecision::Terminal(report) => self.mark_failed(&task, &report).await?,
            };
            if updated {
                debug!(task.id = %task.id, task.type = %task.task_type, "Recovered abandoned claim");
                recovered += 1;
            }
        }

        Ok(recovered)
    }
}
