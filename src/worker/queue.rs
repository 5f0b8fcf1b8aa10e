//! Durable task queue contract and retry backoff

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::error::QueueError;
use super::task::{QueueClass, Task, TaskInfo};

/// Storage for enqueued tasks.
///
/// A dequeued task is leased to the caller. If the lease runs out before
/// `complete`, `retry` or `archive` is called, the task becomes deliverable
/// again with its retry counter bumped; once its retries are exhausted an
/// expired lease archives it instead.
///
/// Settling takes the [`TaskInfo`] returned by `dequeue`: it only applies
/// while that delivery's lease is still the current one, otherwise it fails
/// with [`QueueError::LeaseLost`] and leaves the task untouched.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<TaskInfo, QueueError>;

    /// Lease the next due task of `queue`, oldest first
    async fn dequeue(
        &self,
        queue: QueueClass,
        lease: Duration,
    ) -> Result<Option<TaskInfo>, QueueError>;

    /// Drop a successfully processed task
    async fn complete(&self, task: &TaskInfo) -> Result<(), QueueError>;

    /// Schedule another attempt after `delay`, bumping the retry counter
    async fn retry(&self, task: &TaskInfo, delay: Duration, error: &str) -> Result<(), QueueError>;

    /// Stop delivering the task and keep it for inspection
    async fn archive(&self, task: &TaskInfo, error: &str) -> Result<(), QueueError>;
}

/// Delay between failed attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// `retried^4 + 15 + rand(0..30) * (retried + 1)` seconds
    #[default]
    Default,
    Fixed(Duration),
}

impl Backoff {
    pub fn delay(&self, retried: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Default => {
                let n = u64::from(retried);
                let jitter = rand::thread_rng().gen_range(0..30u64);
                let secs = n
                    .saturating_pow(4)
                    .saturating_add(15)
                    .saturating_add(jitter.saturating_mul(n + 1));
                Duration::from_secs(secs)
            }
        }
    }
}
