use crate::BackgroundTask;
use crate::cleaner::Cleaner;
use crate::config::SchedulerConfig;
use crate::notify::{self, WakeSignal};
use crate::rate_limit::RateLimiter;
use crate::registry::TaskRegistry;
use crate::retry::RetryPolicy;
use crate::storage::TaskStore;
use crate::worker::Worker;
use futures_util::future::join_all;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const DEFAULT_STALE_CLAIM_GRACE: Duration = Duration::from_secs(60);

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The core runner responsible for claiming and running tasks
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    store: TaskStore,
    task_registry: TaskRegistry<Context>,
    context: Context,
    max_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    rate_limits: BTreeMap<String, usize>,
    retry_policy: RetryPolicy,
    retention: Duration,
    cleanup_interval: Duration,
    stale_claim_grace: Duration,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send, State: std::fmt::Debug> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("task_types", &self.task_registry.task_types())
            .field("context", &self.context)
            .field("max_workers", &self.max_workers)
            .field("rate_limits", &self.rate_limits)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool and context.
    pub fn new(connection_pool: PgPool, context: Context) -> Self {
        Self::with_store(TaskStore::new(connection_pool), context)
    }

    /// Create a new runner on top of an existing store.
    pub fn with_store(store: TaskStore, context: Context) -> Self {
        Self {
            store,
            task_registry: TaskRegistry::default(),
            context,
            max_workers: DEFAULT_MAX_WORKERS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            rate_limits: BTreeMap::new(),
            retry_policy: RetryPolicy::default(),
            retention: DEFAULT_RETENTION,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            stale_claim_grace: DEFAULT_STALE_CLAIM_GRACE,
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    /// Register a task type to be run by this runner.
    pub fn register<T: BackgroundTask<Context = Context>>(mut self) -> Runner<Context, Configured> {
        self.task_registry.register::<T>();

        Runner {
            store: self.store,
            task_registry: self.task_registry,
            context: self.context,
            max_workers: self.max_workers,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            rate_limits: self.rate_limits,
            retry_policy: self.retry_policy,
            retention: self.retention,
            cleanup_interval: self.cleanup_interval,
            stale_claim_grace: self.stale_claim_grace,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }

    /// Apply every setting of a [`SchedulerConfig`].
    pub fn configure(mut self, config: &SchedulerConfig) -> Self {
        self.store = self.store.with_defaults(config.submit_defaults());
        self.max_workers = config.max_workers;
        self.poll_interval = config.poll_interval();
        self.jitter = config.jitter();
        self.rate_limits = config.rate_limits.clone();
        self.retry_policy = RetryPolicy::new(config.retry_base_delay(), config.retry_max_delay());
        self.retention = config.retention();
        self.cleanup_interval = config.cleanup_interval();
        self.stale_claim_grace = config.stale_claim_grace();
        self
    }

    /// Set the number of tasks this process runs concurrently.
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set how long idle workers wait for a notification before polling.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for tasks simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Allow at most `max_concurrent` tasks of `task_type` to run at once.
    pub fn rate_limit(mut self, task_type: impl Into<String>, max_concurrent: usize) -> Self {
        self.rate_limits.insert(task_type.into(), max_concurrent);
        self
    }

    /// Set the backoff applied to recoverable failures.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Set how long terminal tasks are kept. Zero disables purging.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set how often retention purge and stale claim recovery run.
    pub fn cleanup_interval(mut self, cleanup_interval: Duration) -> Self {
        self.cleanup_interval = cleanup_interval;
        self
    }

    /// Set how long past its timeout a claim may stay `processing` before it
    /// is considered abandoned. Zero disables recovery.
    pub fn stale_claim_grace(mut self, stale_claim_grace: Duration) -> Self {
        self.stale_claim_grace = stale_claim_grace;
        self
    }

    /// Set the runner to shut down when no task is eligible.
    ///
    /// In this mode neither the notification listener nor the cleaner is started.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// The store tasks are claimed from.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the background workers.
    ///
    /// This returns a `RunHandle` which can be used to wait for the workers to shutdown.
    pub fn start(&self) -> RunHandle {
        let wake = WakeSignal::default();
        let task_registry = Arc::new(self.task_registry.clone());
        let task_types: Arc<[String]> = task_registry.task_types().into();
        let rate_limiter = RateLimiter::new(self.rate_limits.clone());

        let mut workers = Vec::new();
        for i in 1..=self.max_workers.max(1) {
            let name = format!("task-worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                store: self.store.clone(),
                context: self.context.clone(),
                task_registry: task_registry.clone(),
                task_types: task_types.clone(),
                rate_limiter: rate_limiter.clone(),
                retry_policy: self.retry_policy,
                wake: wake.clone(),
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
            };

            let span = info_span!("worker", worker.name = %name);
            let handle = tokio::spawn(async move { worker.run().instrument(span).await });

            workers.push(handle);
        }

        let mut background = Vec::new();
        if !self.shutdown_when_queue_empty {
            background.push(notify::spawn_listener(
                self.store.pool().clone(),
                wake.clone(),
            ));

            let cleaner = Cleaner::new(
                self.store.clone(),
                self.cleanup_interval,
                self.retention,
                self.stale_claim_grace,
                self.retry_policy,
            );
            if let Some(cleaner) = cleaner {
                background.push(cleaner.start());
            }
        }

        RunHandle {
            workers,
            background,
            wake,
        }
    }
}

/// Handle to a running task processing system
#[derive(Debug)]
pub struct RunHandle {
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    wake: WakeSignal,
}

impl RunHandle {
    /// Wake idle workers of this process without going through the database.
    pub fn wake(&self) {
        self.wake.wake_all();
    }

    /// Wait for all workers to shut down, then stop the listener and cleaner.
    pub async fn wait_for_shutdown(self) {
        join_all(self.workers).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Task worker panicked");
            }
        });

        for handle in &self.background {
            handle.abort();
        }
        join_all(self.background).await;
    }

    /// Stop all workers immediately.
    ///
    /// Tasks interrupted mid-execution stay `processing` until stale claim
    /// recovery picks them up.
    pub async fn shutdown(self) {
        for handle in self.workers.iter().chain(&self.background) {
            handle.abort();
        }
        join_all(self.workers.into_iter().chain(self.background)).await;
    }
}
