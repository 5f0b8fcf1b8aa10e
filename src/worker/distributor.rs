//! Task Distributor - producer side of the task queue

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::error::QueueError;
use super::queue::TaskQueue;
use super::send_verify_email::{PayloadSendVerifyEmail, TASK_SEND_VERIFY_EMAIL};
use super::task::{Task, TaskInfo, TaskOptions};

/// Enqueues background tasks
#[async_trait]
pub trait TaskDistributor: Send + Sync {
    async fn enqueue_task(&self, task: Task) -> Result<TaskInfo, QueueError>;

    /// Serialize the payload and enqueue a `task:send_verify_email`
    async fn distribute_task_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
        opts: TaskOptions,
    ) -> Result<TaskInfo, QueueError> {
        let bytes = serde_json::to_vec(payload)?;
        self.enqueue_task(Task::new(TASK_SEND_VERIFY_EMAIL, bytes, opts))
            .await
    }
}

/// Distributor writing straight into a [`TaskQueue`]
#[derive(Clone)]
pub struct QueueTaskDistributor {
    queue: Arc<dyn TaskQueue>,
}

impl QueueTaskDistributor {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl TaskDistributor for QueueTaskDistributor {
    async fn enqueue_task(&self, task: Task) -> Result<TaskInfo, QueueError> {
        let info = self.queue.enqueue(task).await?;
        info!(
            task_id = info.id,
            task_type = %info.task_type,
            queue = %info.queue,
            max_retry = info.max_retry,
            "Enqueued task"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::memory_queue::MemoryQueue;
    use crate::worker::task::QueueClass;

    #[tokio::test]
    async fn test_distribute_send_verify_email() {
        let queue = Arc::new(MemoryQueue::new());
        let distributor = QueueTaskDistributor::new(queue.clone());

        let info = distributor
            .distribute_task_send_verify_email(
                &PayloadSendVerifyEmail {
                    username: "alice".to_string(),
                },
                TaskOptions::default().queue(QueueClass::Critical).max_retry(10),
            )
            .await
            .unwrap();

        assert_eq!(info.task_type, TASK_SEND_VERIFY_EMAIL);
        let pending = queue.pending(QueueClass::Critical);
        assert_eq!(pending.len(), 1);
        let payload: PayloadSendVerifyEmail = serde_json::from_slice(&pending[0].payload).unwrap();
        assert_eq!(payload.username, "alice");
        assert_eq!(pending[0].max_retry, 10);
    }

    #[tokio::test]
    async fn test_unavailable_queue_surfaces_error() {
        let queue = Arc::new(MemoryQueue::new());
        queue.set_unavailable(Some("connection refused"));
        let distributor = QueueTaskDistributor::new(queue);

        let err = distributor
            .enqueue_task(Task::new("task:test", Vec::new(), TaskOptions::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUEUE_UNAVAILABLE");
    }
}
