//! A small media pipeline built from dependent tasks
//!
//! Every upload is turned into three tasks submitted in one transaction:
//! `inspect`, then `transcode` once inspection completed, then `thumbnail` once
//! transcoding completed. Transcoding is rate limited to two concurrent runs,
//! one encoder run crashes once and is retried, and one of the uploads is
//! corrupt so its inspection fails without retries.
//!
//! ```bash
//! cargo run --example media_pipeline
//! ```

use anyhow::{Result, bail};
use durable_tasks::{
    BackgroundTask, ResultExt, RetryPolicy, Runner, Task, TaskStatus, TaskStore, setup_database,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct Inspect {
    file: String,
}

impl BackgroundTask for Inspect {
    const TASK_TYPE: &'static str = "inspect";
    type Context = ();
    type Output = serde_json::Value;

    async fn run(&self, _ctx: (), _task: &Task) -> Result<Self::Output> {
        if self.file.ends_with(".corrupt") {
            return Err(anyhow::anyhow!("{} has no video stream", self.file)).unrecoverable();
        }
        info!(file = %self.file, "Inspecting");
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(serde_json::json!({ "codec": "h264", "duration_secs": 42 }))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Transcode {
    file: String,
}

impl BackgroundTask for Transcode {
    const TASK_TYPE: &'static str = "transcode";
    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));
    type Context = ();
    type Output = String;

    async fn run(&self, _ctx: (), task: &Task) -> Result<String> {
        if task.retry_count == 0 && self.file.starts_with('b') {
            bail!("encoder crashed, will try again");
        }
        info!(file = %self.file, "Transcoding");
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(format!("{}.mp4", self.file))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Thumbnail {
    file: String,
}

impl BackgroundTask for Thumbnail {
    const TASK_TYPE: &'static str = "thumbnail";
    type Context = ();
    type Output = String;

    async fn run(&self, _ctx: (), _task: &Task) -> Result<String> {
        info!(file = %self.file, "Rendering thumbnail");
        Ok(format!("{}.jpg", self.file))
    }
}

/// Set up a `PostgreSQL` database using `TestContainers`
async fn start_database() -> Result<(PgPool, ContainerAsync<Postgres>)> {
    info!("Starting PostgreSQL container...");
    let container = Postgres::default().start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    info!("Connecting to database at {}:{}...", host, port);
    let pool = PgPool::connect(&connection_string).await?;

    info!("Running database migrations...");
    setup_database(&pool).await?;

    Ok((pool, container))
}

async fn submit_pipeline(store: &TaskStore, tenant_id: Uuid, file: &str) -> Result<()> {
    let (inspect_id, transcode_id) = (Uuid::new_v4(), Uuid::new_v4());
    let tasks = vec![
        Inspect { file: file.into() }.to_new_task(tenant_id)?.id(inspect_id),
        Transcode { file: file.into() }
            .to_new_task(tenant_id)?
            .id(transcode_id)
            .depends_on([inspect_id]),
        Thumbnail { file: file.into() }
            .to_new_task(tenant_id)?
            .depends_on([transcode_id]),
    ];

    let mut tx = store.pool().begin().await?;
    let ids = store.submit_batch(&mut tx, tasks).await?;
    tx.commit().await?;

    info!(file, ?ids, "Submitted pipeline");
    Ok(())
}

const FILES: [&str; 4] = ["a.mov", "b.mov", "c.mov", "d.corrupt"];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,media_pipeline=info,durable_tasks=info".into()),
        )
        .compact()
        .init();
    let (pool, _container) = start_database().await?;

    let store = TaskStore::new(pool.clone());
    let tenant_id = Uuid::new_v4();
    for file in FILES {
        submit_pipeline(&store, tenant_id, file).await?;
    }

    let runner = Runner::new(pool.clone(), ())
        .register::<Inspect>()
        .register::<Transcode>()
        .register::<Thumbnail>()
        .max_workers(4)
        .rate_limit(Transcode::TASK_TYPE, 2)
        .retry_policy(RetryPolicy::new(
            Duration::from_millis(200),
            Duration::from_secs(1),
        ));

    info!("Processing tasks...");
    let handle = runner.start();

    // The corrupt upload fails inspection, so its transcode and thumbnail
    // stay pending forever. Everything else finishes.
    let expected_finished = 3 * FILES.len() - 2;
    let stats = loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = store.stats(tenant_id).await?;
        let finished = stats.count(TaskStatus::Completed) + stats.count(TaskStatus::Failed);
        if usize::try_from(finished)? >= expected_finished {
            break stats;
        }
    };
    handle.shutdown().await;

    info!(
        completed = stats.count(TaskStatus::Completed),
        failed = stats.count(TaskStatus::Failed),
        blocked = stats.count(TaskStatus::Pending),
        success_rate = ?stats.success_rate,
        "Pipeline finished"
    );

    Ok(())
}
