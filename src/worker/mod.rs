//! Background Tasks
//!
//! Durable queue of typed tasks with three priority classes.
//!
//! - [`TaskDistributor`] enqueues tasks (producer side)
//! - [`TaskProcessor`] runs a pool of workers that lease, execute and settle them
//! - [`TaskQueue`] is the storage contract: [`PgTaskQueue`] in production,
//!   [`MemoryQueue`] in tests
//!
//! # Delivery
//!
//! At-least-once. A handler error is retried with [`Backoff`] until the
//! task's `max_retry` budget is spent, then archived. A
//! [`HandlerError::SkipRetry`] archives at once. Handlers must be idempotent.

pub mod distributor;
pub mod error;
pub mod memory_queue;
pub mod pg_queue;
pub mod processor;
pub mod queue;
pub mod send_verify_email;
pub mod task;

pub use distributor::{QueueTaskDistributor, TaskDistributor};
pub use error::{HandlerError, QueueError};
pub use memory_queue::MemoryQueue;
pub use pg_queue::PgTaskQueue;
pub use processor::{ProcessorConfig, TaskHandler, TaskOutcome, TaskProcessor};
pub use queue::{Backoff, TaskQueue};
pub use send_verify_email::{
    PayloadSendVerifyEmail, SendVerifyEmailHandler, TASK_SEND_VERIFY_EMAIL,
};
pub use task::{DEFAULT_MAX_RETRY, QueueClass, Task, TaskId, TaskInfo, TaskOptions};
