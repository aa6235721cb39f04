//! Tenant-scoped read access: listing and aggregate statistics.

use crate::schema::{TASK_COLUMNS, Task, TaskStatus};
use crate::storage::TaskStore;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

const DEFAULT_LIST_LIMIT: i64 = 100;

/// Optional filters for [`TaskStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Only tasks in this status.
    pub status: Option<TaskStatus>,
    /// Only tasks of this type.
    pub task_type: Option<String>,
    /// Page size, 100 when unset.
    pub limit: Option<i64>,
    /// Rows to skip.
    pub offset: Option<i64>,
}

impl TaskFilter {
    /// Filter on status.
    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter on task type.
    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Limit the number of rows returned.
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first `offset` rows.
    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Aggregates over one tenant's tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskStats {
    /// Number of tasks per status. Statuses without tasks are absent.
    pub counts_by_status: BTreeMap<TaskStatus, i64>,
    /// Number of tasks per task type.
    pub counts_by_type: BTreeMap<String, i64>,
    /// Mean run time of completed tasks, in seconds.
    pub avg_duration_seconds: Option<f64>,
    /// `completed / (completed + failed)`, absent until a task finished.
    pub success_rate: Option<f64>,
}

impl TaskStats {
    /// Count for a single status, zero when absent.
    pub fn count(&self, status: TaskStatus) -> i64 {
        self.counts_by_status.get(&status).copied().unwrap_or(0)
    }
}

impl TaskStore {
    /// A page of the tenant's tasks, newest first.
    pub async fn list(&self, tenant_id: Uuid, filter: &TaskFilter) -> Result<Vec<Task>, sqlx::Error> {
        let query = format!(
            r"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR task_type = $3)
            ORDER BY created_at DESC, id
            LIMIT $4 OFFSET $5
            "
        );

        sqlx::query_as::<_, Task>(&query)
            .bind(tenant_id)
            .bind(filter.status.map(TaskStatus::as_str))
            .bind(filter.task_type.as_deref())
            .bind(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(0))
            .bind(filter.offset.unwrap_or(0).max(0))
            .fetch_all(self.pool())
            .await
    }

    /// Status and type counts, mean duration and success rate for a tenant.
    pub async fn stats(&self, tenant_id: Uuid) -> Result<TaskStats, sqlx::Error> {
        let by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM tasks WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await?;

        let by_type: Vec<(String, i64)> = sqlx::query_as(
            "SELECT task_type, COUNT(*) FROM tasks WHERE tenant_id = $1 GROUP BY task_type",
        )
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await?;

        let avg_duration_seconds: Option<f64> = sqlx::query_scalar(
            r"
            SELECT AVG(EXTRACT(EPOCH FROM (completed_at - started_at)))::float8
            FROM tasks
            WHERE tenant_id = $1 AND status = 'completed'
              AND started_at IS NOT NULL AND completed_at IS NOT NULL
            ",
        )
        .bind(tenant_id)
        .fetch_one(self.pool())
        .await?;

        let counts_by_status: BTreeMap<TaskStatus, i64> = by_status
            .into_iter()
            .filter_map(|(status, count)| Some((status.parse().ok()?, count)))
            .collect();

        let completed = counts_by_status.get(&TaskStatus::Completed).copied().unwrap_or(0);
        let failed = counts_by_status.get(&TaskStatus::Failed).copied().unwrap_or(0);
        #[allow(clippy::cast_precision_loss)]
        let success_rate =
            (completed + failed > 0).then(|| completed as f64 / (completed + failed) as f64);

        Ok(TaskStats {
            counts_by_status,
            counts_by_type: by_type.into_iter().collect(),
            avg_duration_seconds,
            success_rate,
        })
    }
}
