use crate::retry::RetryPolicy;
use crate::storage::TaskStore;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Periodic housekeeping: purges terminal tasks past the retention window and
/// recovers claims abandoned by crashed workers.
///
/// Failures are logged and retried on the next tick.
#[derive(Debug, Clone)]
pub(crate) struct Cleaner {
    pub(crate) store: TaskStore,
    pub(crate) interval: Duration,
    pub(crate) retention: Duration,
    pub(crate) stale_claim_grace: Duration,
    pub(crate) retry_policy: RetryPolicy,
}

impl Cleaner {
    /// `None` when both retention and stale claim recovery are disabled.
    pub(crate) fn new(
        store: TaskStore,
        interval: Duration,
        retention: Duration,
        stale_claim_grace: Duration,
        retry_policy: RetryPolicy,
    ) -> Option<Self> {
        if interval.is_zero() || (retention.is_zero() && stale_claim_grace.is_zero()) {
            return None;
        }

        Some(Self {
            store,
            interval,
            retention,
            stale_claim_grace,
            retry_policy,
        })
    }

    pub(crate) fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    pub(crate) async fn run_once(&self) {
        if !self.stale_claim_grace.is_zero() {
            let reaped = self
                .store
                .reap_stale_claims(self.stale_claim_grace, &self.retry_policy)
                .await;
            match reaped {
                Ok(0) => debug!("No abandoned claims found"),
                Ok(count) => warn!(count, "Recovered abandoned task claims"),
                Err(error) => warn!(%error, "Failed to recover abandoned task claims"),
            }
        }

        if !self.retention.is_zero() {
            match self.store.purge(self.retention).await {
                Ok(0) => debug!("No expired tasks to purge"),
                Ok(count) => info!(count, "Purged expired tasks"),
                Err(error) => warn!(%error, "Failed to purge expired tasks"),
            }
        }
    }
}
