//! Per-task-type concurrency ceilings, independent of the worker pool size.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
struct Limit {
    max_concurrent: usize,
    slots: Arc<Semaphore>,
}

/// Limits how many tasks of one type run concurrently in this process.
///
/// Task types without a configured limit are only bounded by the worker pool.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    limits: Arc<HashMap<String, Limit>>,
}

/// Holds one slot of a task type's limit. The slot is released on drop.
#[derive(Debug)]
pub struct RatePermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl RateLimiter {
    /// Create a limiter from `(task_type, max_concurrent)` pairs.
    pub fn new(limits: impl IntoIterator<Item = (String, usize)>) -> Self {
        let limits = limits
            .into_iter()
            .map(|(task_type, max_concurrent)| {
                let limit = Limit {
                    max_concurrent,
                    slots: Arc::new(Semaphore::new(max_concurrent)),
                };
                (task_type, limit)
            })
            .collect();

        Self {
            limits: Arc::new(limits),
        }
    }

    /// The configured ceiling for a task type, if any.
    pub fn limit(&self, task_type: &str) -> Option<usize> {
        self.limits.get(task_type).map(|limit| limit.max_concurrent)
    }

    /// Try to take a slot for `task_type` without waiting.
    ///
    /// Returns `None` when the type is at its ceiling. That is a scheduling
    /// deferral, not a failure.
    pub fn try_acquire(&self, task_type: &str) -> Option<RatePermit> {
        let Some(limit) = self.limits.get(task_type) else {
            return Some(RatePermit { _permit: None });
        };

        limit
            .slots
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| RatePermit {
                _permit: Some(permit),
            })
    }

    /// Whether `task_type` currently has a free slot.
    pub fn has_capacity(&self, task_type: &str) -> bool {
        self.limits
            .get(task_type)
            .is_none_or(|limit| limit.slots.available_permits() > 0)
    }

    /// The subset of `task_types` that currently have a free slot.
    pub fn available_types(&self, task_types: &[String]) -> Vec<String> {
        task_types
            .iter()
            .filter(|task_type| self.has_capacity(task_type))
            .cloned()
            .collect()
    }
}
