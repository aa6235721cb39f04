use std::fmt::{Debug, Display};
use thiserror::Error;
use uuid::Uuid;

/// Error type for task submission operations.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// An error occurred while serializing the task payload.
    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    /// An error occurred while inserting the task into the database.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),

    /// The task would never become eligible because it depends on itself.
    #[error("task {0} depends on itself")]
    SelfDependency(Uuid),

    /// A dependency is neither stored for the tenant nor part of the batch.
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency {
        /// The task being submitted.
        task: Uuid,
        /// The id that could not be found.
        dependency: Uuid,
    },

    /// The submitted batch contains a dependency cycle.
    #[error("dependency cycle between tasks {0:?}")]
    DependencyCycle(Vec<Uuid>),

    /// The same id appears twice in one batch.
    #[error("task id {0} appears more than once in the batch")]
    DuplicateId(Uuid),

    /// A submission field is out of range.
    #[error("invalid task: {0}")]
    Invalid(String),
}

/// Marks a handler error as unrecoverable.
///
/// A task whose handler fails with an error chain containing `Unrecoverable`
/// goes straight to `failed`, regardless of the remaining retry budget.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct Unrecoverable(anyhow::Error);

impl Unrecoverable {
    /// Wrap an error as unrecoverable.
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self(error.into())
    }

    /// Build an unrecoverable error from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: Display + Debug + Send + Sync + 'static,
    {
        Self(anyhow::Error::msg(message))
    }
}

/// Whether any error in the chain was marked [`Unrecoverable`].
pub fn is_unrecoverable(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<Unrecoverable>())
}

/// Classify the error of a fallible handler step as unrecoverable.
pub trait ResultExt<T> {
    /// Convert the error into an [`Unrecoverable`] one.
    fn unrecoverable(self) -> anyhow::Result<T>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn unrecoverable(self) -> anyhow::Result<T> {
        self.map_err(|error| Unrecoverable::new(error).into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn plain_errors_are_recoverable() {
        assert!(!is_unrecoverable(&anyhow!("connection reset")));
    }

    #[test]
    fn marker_is_found_through_context() {
        let error: anyhow::Error = Unrecoverable::msg("missing API key").into();
        assert!(is_unrecoverable(&error));
        assert_eq!(error.to_string(), "missing API key");

        let wrapped = Err::<(), _>(error)
            .context("calling embedding provider")
            .unwrap_err();
        assert!(is_unrecoverable(&wrapped));
    }

    #[test]
    fn result_ext_marks_errors() {
        let parsed: Result<u32, _> = "not a number".parse::<u32>();
        let error = parsed.unrecoverable().unwrap_err();
        assert!(is_unrecoverable(&error));
    }
}
