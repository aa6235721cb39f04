//! Wake-up signals over PostgreSQL `LISTEN`/`NOTIFY`.
//!
//! Notifications only shorten the time an idle worker sleeps. Workers always
//! re-run the claim query, and fall back to polling if a signal is lost.

use sqlx::PgExecutor;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// The channel every task wake event is published on.
pub const NOTIFY_CHANNEL: &str = "durable_tasks";

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Publish a wake event for `task_type`.
///
/// Inside a transaction the event is delivered on commit, and dropped on rollback.
pub async fn notify<'e>(executor: impl PgExecutor<'e>, task_type: &str) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(NOTIFY_CHANNEL)
        .bind(task_type)
        .execute(executor)
        .await?;
    Ok(())
}

/// In-process fan-out of wake events to the worker slots of one runner.
#[derive(Debug, Clone, Default)]
pub struct WakeSignal {
    inner: Arc<Notify>,
}

impl WakeSignal {
    /// Wake every slot that is currently waiting.
    pub fn wake_all(&self) {
        self.inner.notify_waiters();
    }

    /// Wait for the next wake event, or until `timeout` elapses.
    ///
    /// Returns `true` if woken by an event.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.inner.notified())
            .await
            .is_ok()
    }
}

/// Forward notifications from [`NOTIFY_CHANNEL`] to `signal` until aborted.
pub(crate) fn spawn_listener(pool: PgPool, signal: WakeSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(listener) => listener,
                Err(error) => {
                    warn!(%error, "Failed to connect task notification listener");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            if let Err(error) = listener.listen(NOTIFY_CHANNEL).await {
                warn!(%error, "Failed to LISTEN on task channel");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
            debug!(channel = NOTIFY_CHANNEL, "Listening for task notifications");

            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        trace!(task.type = notification.payload(), "Task notification received");
                        signal.wake_all();
                    }
                    Err(error) => {
                        warn!(%error, "Task notification listener failed, reconnecting");
                        // Anything submitted while disconnected is picked up by polling.
                        signal.wake_all();
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        break;
                    }
                }
            }
        }
    })
}
