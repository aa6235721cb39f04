//! Retention purge of finished tasks
//!
//! Runs ten short tasks, then lets the runner's maintenance loop delete
//! finished tasks older than the retention window. One completed task is
//! still awaited by a delayed dependent and survives the purge.
//!
//! ```bash
//! cargo run --example retention_cleanup
//! ```

use anyhow::Result;
use chrono::{TimeDelta, Utc};
use durable_tasks::{BackgroundTask, Runner, SchedulerConfig, Task, TaskFilter, TaskStore};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct SendReceipt {
    order: u32,
}

impl BackgroundTask for SendReceipt {
    const TASK_TYPE: &'static str = "send_receipt";
    type Context = ();
    type Output = ();

    async fn run(&self, _ctx: (), _task: &Task) -> Result<()> {
        info!(order = self.order, "Sending receipt");
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
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
    durable_tasks::setup_database(&pool).await?;

    Ok((pool, container))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,retention_cleanup=info,durable_tasks=info".into()),
        )
        .compact()
        .init();
    let (pool, _container) = start_database().await?;

    let config = SchedulerConfig::from_toml_str(
        r"
        max_workers = 2
        poll_interval_secs = 0.2
        retention_secs = 2
        cleanup_interval_secs = 1
        ",
    )?;

    let store = TaskStore::new(pool.clone()).with_defaults(config.submit_defaults());
    let tenant_id = Uuid::new_v4();
    let mut ids = Vec::new();
    for order in 0..10 {
        ids.push(SendReceipt { order }.submit(&store, tenant_id).await?);
    }

    // Keeps the first receipt alive until it runs tomorrow.
    let awaited = ids.first().copied().into_iter();
    let invoice = SendReceipt { order: 99 }
        .to_new_task(tenant_id)?
        .depends_on(awaited)
        .scheduled_at(Utc::now() + TimeDelta::days(1));
    store.submit(invoice).await?;

    info!("Submitted 10 receipts and one delayed dependent");

    let runner = Runner::with_store(store.clone(), ())
        .configure(&config)
        .register::<SendReceipt>();
    let handle = runner.start();

    tokio::time::sleep(Duration::from_secs(5)).await;
    handle.shutdown().await;

    let remaining = store.list(tenant_id, &TaskFilter::default()).await?;
    for task in &remaining {
        info!(id = %task.id, status = %task.status, "Kept");
    }
    assert_eq!(remaining.len(), 2);

    info!("Finished receipts were purged, except the one a pending task depends on.");
    Ok(())
}
