#![allow(dead_code)]

use anyhow::Context as _;
use durable_tasks::{BackgroundTask, NewTask, Task, TaskStore, setup_database};
use serde_json::Value;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// A throwaway database. A container backing it is stopped on drop.
pub struct TestDb {
    pub pool: PgPool,
    pub store: TaskStore,
    _container: Option<ContainerAsync<Postgres>>,
}

/// Create an empty, migrated database for one test.
///
/// With `DATABASE_URL` set, a fresh database is created on that server.
/// Otherwise PostgreSQL is started with testcontainers, and the test fails if
/// no container runtime is reachable.
pub async fn setup_test_db() -> anyhow::Result<TestDb> {
    let (options, container) = match std::env::var("DATABASE_URL") {
        Ok(database_url) => (create_database(&database_url).await?, None),
        Err(_) => {
            let container = Postgres::default().start().await.context(
                "could not start PostgreSQL, set DATABASE_URL or make Docker available",
            )?;

            let host = container.get_host().await?;
            let port = container.get_host_port_ipv4(5432).await?;

            // Use the standard postgres/postgres credentials for testcontainers
            let connection_string =
                format!("postgresql://postgres:postgres@{host}:{port}/postgres");
            (connection_string.parse()?, Some(container))
        }
    };

    let pool = PgPool::connect_with(options).await?;
    setup_database(&pool).await?;

    Ok(TestDb {
        store: TaskStore::new(pool.clone()),
        pool,
        _container: container,
    })
}

/// Tests claim tasks of any tenant, so each one gets its own database.
async fn create_database(database_url: &str) -> anyhow::Result<PgConnectOptions> {
    let options: PgConnectOptions = database_url.parse()?;
    let name = format!("durable_tasks_test_{}", Uuid::new_v4().simple());

    let mut conn = PgConnection::connect_with(&options).await?;
    sqlx::query(&format!("CREATE DATABASE {name}"))
        .execute(&mut conn)
        .await?;
    conn.close().await?;

    Ok(options.database(&name))
}

pub async fn submit(store: &TaskStore, task: NewTask) -> anyhow::Result<Uuid> {
    Ok(store.submit(task).await?)
}

pub fn new_task(tenant_id: Uuid, task_type: &str) -> NewTask {
    NewTask::new(tenant_id, task_type, Value::Null)
}

pub async fn get(store: &TaskStore, id: Uuid) -> anyhow::Result<Task> {
    store
        .get(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task {id} not found"))
}

pub async fn submit_typed<T: BackgroundTask>(
    store: &TaskStore,
    task: &T,
    tenant_id: Uuid,
) -> anyhow::Result<Uuid> {
    Ok(task.submit(store, tenant_id).await?)
}

/// Move a task's reference timestamps into the past.
pub async fn backdate(pool: &PgPool, id: Uuid, column: &str, seconds: i64) -> anyhow::Result<()> {
    let query = format!(
        "UPDATE tasks SET {column} = NOW() - make_interval(secs => $2::float8) WHERE id = $1"
    );
    #[allow(clippy::cast_precision_loss)]
    sqlx::query(&query)
        .bind(id)
        .bind(seconds as f64)
        .execute(pool)
        .await?;
    Ok(())
}
