//! Worker Error Types

use thiserror::Error;

use super::task::TaskId;

/// Queue infrastructure errors. All are transient from the caller's view.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// The lease expired and the task was re-leased or archived meanwhile
    #[error("lease lost on task {0}")]
    LeaseLost(TaskId),

    #[error("queue corrupted: {0}")]
    Corrupted(String),

    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueueError {
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::Encode(_) => "ENCODE_FAILED",
            QueueError::Unavailable(_) => "QUEUE_UNAVAILABLE",
            QueueError::TaskNotFound(_) => "TASK_NOT_FOUND",
            QueueError::LeaseLost(_) => "LEASE_LOST",
            QueueError::Corrupted(_) => "QUEUE_CORRUPTED",
            QueueError::Database(_) => "QUEUE_DATABASE_ERROR",
        }
    }
}

/// Outcome of a failed handler run
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The task can never succeed; archive it without another attempt
    #[error("{0}: skip retry")]
    SkipRetry(String),

    /// Anything else; retried with backoff until the budget runs out
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn skip_retry(reason: impl Into<String>) -> Self {
        HandlerError::SkipRetry(reason.into())
    }

    pub fn is_skip_retry(&self) -> bool {
        matches!(self, HandlerError::SkipRetry(_))
    }
}
