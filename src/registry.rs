use crate::BackgroundTask;
use crate::errors::ResultExt;
use crate::schema::Task;
use anyhow::Context as _;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub(crate) type RunTaskFn<Context> =
    Arc<dyn Fn(Context, Task) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Maps task type names to the functions that run them.
pub(crate) struct TaskRegistry<Context> {
    handlers: HashMap<String, RunTaskFn<Context>>,
}

impl<Context> Default for TaskRegistry<Context> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<Context> Clone for TaskRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<Context> fmt::Debug for TaskRegistry<Context> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

impl<Context: Clone + Send + 'static> TaskRegistry<Context> {
    pub(crate) fn register<T: BackgroundTask<Context = Context>>(&mut self) {
        let run: RunTaskFn<Context> = Arc::new(|context: Context, task: Task| {
            async move {
                let payload: T = serde_json::from_value(task.payload.clone())
                    .with_context(|| format!("invalid payload for task type {}", T::TASK_TYPE))
                    .map_err(crate::Unrecoverable::new)?;
                let output = payload.run(context, &task).await?;
                serde_json::to_value(output)
                    .with_context(|| format!("invalid output of task type {}", T::TASK_TYPE))
                    .unrecoverable()
            }
            .boxed()
        });

        self.handlers.insert(T::TASK_TYPE.to_owned(), run);
    }
}

impl<Context> TaskRegistry<Context> {
    pub(crate) fn get(&self, task_type: &str) -> Option<&RunTaskFn<Context>> {
        self.handlers.get(task_type)
    }

    /// Registered task types, sorted.
    pub(crate) fn task_types(&self) -> Vec<String> {
        let mut task_types: Vec<String> = self.handlers.keys().cloned().collect();
        task_types.sort();
        task_types
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::errors::is_unrecoverable;
    use crate::schema::TaskStatus;
    use chrono::Utc;
    use claims::{assert_none, assert_some};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[derive(Serialize, Deserialize)]
    struct Embed {
        document: String,
    }

    impl BackgroundTask for Embed {
        const TASK_TYPE: &'static str = "embed";
        type Context = usize;
        type Output = Value;

        async fn run(&self, dimensions: usize, task: &Task) -> anyhow::Result<Value> {
            Ok(json!({ "document": self.document, "dimensions": dimensions, "tenant": task.tenant_id }))
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Fingerprint;

    impl BackgroundTask for Fingerprint {
        const TASK_TYPE: &'static str = "fingerprint";
        type Context = usize;
        type Output = BTreeMap<Vec<u8>, usize>;

        async fn run(&self, dimensions: usize, _task: &Task) -> anyhow::Result<Self::Output> {
            Ok(BTreeMap::from([(vec![0xde, 0xad], dimensions)]))
        }
    }

    fn task(payload: Value) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            task_type: "embed".into(),
            status: TaskStatus::Processing,
            priority: 1,
            payload,
            result: None,
            scheduled_at: now,
            started_at: Some(now),
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
            timeout_seconds: 30,
            depends_on: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn registered_handlers_receive_payload_and_context() {
        let mut registry = TaskRegistry::<usize>::default();
        registry.register::<Embed>();
        assert_eq!(registry.task_types(), vec!["embed".to_owned()]);
        assert_none!(registry.get("transcode").map(|_| ()));

        let run = assert_some!(registry.get("embed"));
        let output = run(768, task(json!({ "document": "a.pdf" }))).await.unwrap();
        insta::assert_compact_json_snapshot!(
            output,
            @r#"{"dimensions": 768, "document": "a.pdf", "tenant": "00000000-0000-0000-0000-000000000000"}"#
        );
    }

    #[tokio::test]
    async fn malformed_payloads_are_unrecoverable() {
        let mut registry = TaskRegistry::<usize>::default();
        registry.register::<Embed>();

        let run = assert_some!(registry.get("embed"));
        let error = run(768, task(json!({ "doc": 1 }))).await.unwrap_err();
        assert!(is_unrecoverable(&error));
    }

    #[tokio::test]
    async fn unserializable_output_is_unrecoverable() {
        let mut registry = TaskRegistry::<usize>::default();
        registry.register::<Fingerprint>();

        let run = assert_some!(registry.get("fingerprint"));
        let error = run(768, task(Value::Null)).await.unwrap_err();
        assert!(is_unrecoverable(&error));
        assert_eq!(error.to_string(), "invalid output of task type fingerprint");
    }
}
