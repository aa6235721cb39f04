use crate::errors::SubmitError;
use crate::schema::{PRIORITY_NORMAL, Task};
use crate::storage::TaskStore;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

/// A task waiting to be inserted into the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub(crate) id: Option<Uuid>,
    pub(crate) tenant_id: Uuid,
    pub(crate) task_type: String,
    pub(crate) payload: Value,
    pub(crate) priority: i16,
    pub(crate) scheduled_at: Option<DateTime<Utc>>,
    pub(crate) depends_on: Vec<Uuid>,
    pub(crate) max_retries: Option<i32>,
    pub(crate) timeout_seconds: Option<i32>,
}

impl NewTask {
    /// A normal-priority task, eligible immediately, using the store's defaults.
    pub fn new(tenant_id: Uuid, task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            tenant_id,
            task_type: task_type.into(),
            payload,
            priority: PRIORITY_NORMAL,
            scheduled_at: None,
            depends_on: Vec::new(),
            max_retries: None,
            timeout_seconds: None,
        }
    }

    /// Use a pre-allocated id, e.g. when building a dependency chain in one batch.
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Lower values are claimed first.
    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    /// Defer the task until `scheduled_at`.
    pub fn scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    /// Tasks that must be `completed` before this one may run.
    pub fn depends_on(mut self, depends_on: impl IntoIterator<Item = Uuid>) -> Self {
        self.depends_on = depends_on.into_iter().collect();
        self
    }

    /// Override the default retry budget.
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Override the default per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = Some(i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX));
        self
    }

    /// The task type this submission dispatches to.
    pub fn task_type(&self) -> &str {
        &self.task_type
    }
}

/// Trait for defining background tasks that can be submitted and executed asynchronously.
///
/// The implementing type is the task payload: it is serialized on submission
/// and deserialized again before [`Self::run`] is called.
pub trait BackgroundTask: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task type.
    ///
    /// This MUST be unique for the whole application.
    const TASK_TYPE: &'static str;

    /// Default priority of the task (lower is more urgent).
    const PRIORITY: i16 = PRIORITY_NORMAL;

    /// Retry budget. `None` uses the store default.
    const MAX_RETRIES: Option<i32> = None;

    /// Per-attempt timeout. `None` uses the store default.
    const TIMEOUT: Option<Duration> = None;

    /// The application data provided to this task at runtime.
    type Context: Clone + Send + 'static;

    /// The value stored in the task's `result` column on success.
    type Output: Serialize + Send;

    /// Execute the task.
    ///
    /// Handlers must be idempotent: a crash between claim and the final
    /// status write makes the task run again. Errors are retried unless
    /// marked with [`Unrecoverable`](crate::Unrecoverable).
    fn run(
        &self,
        ctx: Self::Context,
        task: &Task,
    ) -> impl Future<Output = anyhow::Result<Self::Output>> + Send;

    /// Build the untyped submission for this task.
    fn to_new_task(&self, tenant_id: Uuid) -> Result<NewTask, SubmitError> {
        let mut task = NewTask::new(tenant_id, Self::TASK_TYPE, serde_json::to_value(self)?)
            .priority(Self::PRIORITY);
        if let Some(max_retries) = Self::MAX_RETRIES {
            task = task.max_retries(max_retries);
        }
        if let Some(timeout) = Self::TIMEOUT {
            task = task.timeout(timeout);
        }
        Ok(task)
    }

    /// Submit this task for background execution.
    #[instrument(name = "tasks.submit", skip(self, store), fields(message = Self::TASK_TYPE))]
    fn submit<'a>(
        &'a self,
        store: &'a TaskStore,
        tenant_id: Uuid,
    ) -> BoxFuture<'a, Result<Uuid, SubmitError>> {
        let task = match self.to_new_task(tenant_id) {
            Ok(task) => task,
            Err(err) => return async move { Err(err) }.boxed(),
        };

        store.submit(task).boxed()
    }
}
