//! Error taxonomy of the queue manager.

use std::any::Any;

use dropqueue_core::{DomainError, JobId};

use crate::types::JobStatus;

/// Errors surfaced synchronously by [`JobQueueManager`](crate::JobQueueManager) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("queue already exists: {0}")]
    QueueExists(String),
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("cannot {action} job {job_id} while it is {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        action: &'static str,
    },
    #[error(transparent)]
    Validation(#[from] DomainError),
}

impl QueueError {
    pub(crate) fn invalid_transition(job_id: JobId, from: JobStatus, action: &'static str) -> Self {
        Self::InvalidTransition {
            job_id,
            from,
            action,
        }
    }
}

/// Failure raised while performing a job's underlying work.
///
/// Recorded on the job and converted into a retry or a `failed` transition;
/// never returned to the submitter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Build from a panic payload caught around a handler.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::new(format!("job handler panicked: {detail}"))
    }
}

impl From<anyhow::Error> for ExecutionError {
    fn from(err: anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line.
        Self::new(format!("{err:#}"))
    }
}

/// Failure of a best-effort mirror write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MirrorError {
    #[error("mirror storage error: {0}")]
    Storage(String),
    #[error("mirror serialization error: {0}")]
    Serialization(String),
}
