//! In-process [`TaskQueue`] for tests and single-node runs

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::QueueError;
use super::queue::TaskQueue;
use super::task::{QueueClass, Task, TaskId, TaskInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskState {
    Pending,
    Active { lease_until: DateTime<Utc> },
    Archived,
}

#[derive(Debug, Clone)]
struct StoredTask {
    info: TaskInfo,
    state: TaskState,
    last_error: Option<String>,
}

#[derive(Default)]
struct Inner {
    next_id: TaskId,
    tasks: BTreeMap<TaskId, StoredTask>,
    completed: Vec<TaskId>,
    unavailable: Option<String>,
}

impl Inner {
    fn check_available(&self) -> Result<(), QueueError> {
        match &self.unavailable {
            Some(reason) => Err(QueueError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut StoredTask, QueueError> {
        self.tasks.get_mut(&id).ok_or(QueueError::TaskNotFound(id))
    }

    /// The stored task, if `leased` still holds its current lease
    fn leased_mut(&mut self, leased: &TaskInfo) -> Result<&mut StoredTask, QueueError> {
        let task = self.task_mut(leased.id)?;
        let current = matches!(task.state, TaskState::Active { .. })
            && leased.lease_until.is_some()
            && task.info.lease_until == leased.lease_until;
        if !current {
            return Err(QueueError::LeaseLost(leased.id));
        }
        Ok(task)
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Queue held in memory; lost on restart
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every operation with `Unavailable` until cleared with `None`
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.lock().unavailable = reason.map(str::to_string);
    }

    /// Every task still held (pending, leased or archived)
    pub fn tasks(&self) -> Vec<TaskInfo> {
        self.lock().tasks.values().map(|t| t.info.clone()).collect()
    }

    /// Tasks waiting for delivery on `queue`
    pub fn pending(&self, queue: QueueClass) -> Vec<TaskInfo> {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.info.queue == queue && t.state == TaskState::Pending)
            .map(|t| t.info.clone())
            .collect()
    }

    /// Archived tasks with the error that archived them
    pub fn archived(&self) -> Vec<(TaskInfo, String)> {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Archived)
            .map(|t| (t.info.clone(), t.last_error.clone().unwrap_or_default()))
            .collect()
    }

    pub fn completed(&self) -> Vec<TaskId> {
        self.lock().completed.clone()
    }

    /// Make a scheduled task (or an expired lease) deliverable now
    pub fn force_due(&self, id: TaskId) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let task = inner.task_mut(id)?;
        let now = Utc::now();
        task.info.next_process_at = now;
        if let TaskState::Active { lease_until } = &mut task.state {
            *lease_until = now;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: Task) -> Result<TaskInfo, QueueError> {
        let mut inner = self.lock();
        inner.check_available()?;

        inner.next_id += 1;
        let info = TaskInfo {
            id: inner.next_id,
            task_type: task.task_type,
            payload: task.payload,
            queue: task.opts.queue,
            max_retry: task.opts.max_retry,
            retried: 0,
            next_process_at: after(Utc::now(), task.opts.process_in),
            lease_until: None,
        };
        inner.tasks.insert(
            info.id,
            StoredTask {
                info: info.clone(),
                state: TaskState::Pending,
                last_error: None,
            },
        );
        Ok(info)
    }

    async fn dequeue(
        &self,
        queue: QueueClass,
        lease: Duration,
    ) -> Result<Option<TaskInfo>, QueueError> {
        let mut inner = self.lock();
        inner.check_available()?;
        let now = Utc::now();

        // Expired leases with no retries left are archived, not redelivered
        for task in inner.tasks.values_mut() {
            let expired = matches!(task.state, TaskState::Active { lease_until } if lease_until <= now);
            if expired && task.info.queue == queue && task.info.retries_exhausted() {
                task.state = TaskState::Archived;
                task.info.lease_until = None;
                task.last_error = Some("lease expired".to_string());
            }
        }

        let next = inner
            .tasks
            .values_mut()
            .filter(|t| t.info.queue == queue)
            .filter(|t| match t.state {
                TaskState::Pending => t.info.next_process_at <= now,
                TaskState::Active { lease_until } => lease_until <= now,
                TaskState::Archived => false,
            })
            .min_by_key(|t| (t.info.next_process_at, t.info.id));

        Ok(next.map(|task| {
            if matches!(task.state, TaskState::Active { .. }) {
                task.info.retried += 1;
                task.last_error = Some("lease expired".to_string());
            }
            let lease_until = after(now, lease);
            task.state = TaskState::Active { lease_until };
            task.info.lease_until = Some(lease_until);
            task.info.clone()
        }))
    }

    async fn complete(&self, task: &TaskInfo) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.leased_mut(task)?;
        inner.tasks.remove(&task.id);
        inner.completed.push(task.id);
        Ok(())
    }

    async fn retry(&self, task: &TaskInfo, delay: Duration, error: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner.check_available()?;
        let stored = inner.leased_mut(task)?;
        stored.info.retried += 1;
        stored.info.next_process_at = after(Utc::now(), delay);
        stored.info.lease_until = None;
        stored.state = TaskState::Pending;
        stored.last_error = Some(error.to_string());
        Ok(())
    }

    async fn archive(&self, task: &TaskInfo, error: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        inner.check_available()?;
        let stored = inner.leased_mut(task)?;
        stored.info.lease_until = None;
        stored.state = TaskState::Archived;
        stored.last_error = Some(error.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::task::TaskOptions;

    const LEASE: Duration = Duration::from_secs(30);

    fn task(queue: QueueClass, process_in: Duration) -> Task {
        Task::new(
            "task:test",
            b"{}".to_vec(),
            TaskOptions::default().queue(queue).process_in(process_in),
        )
    }

    #[tokio::test]
    async fn test_scheduled_task_waits_until_due() {
        let queue = MemoryQueue::new();
        let info = queue
            .enqueue(task(QueueClass::Default, Duration::from_secs(10)))
            .await
            .unwrap();

        assert!(queue.dequeue(QueueClass::Default, LEASE).await.unwrap().is_none());
        queue.force_due(info.id).unwrap();
        let leased = queue.dequeue(QueueClass::Default, LEASE).await.unwrap().unwrap();
        assert_eq!(leased.id, info.id);
    }

    #[tokio::test]
    async fn test_leased_task_is_not_redelivered() {
        let queue = MemoryQueue::new();
        queue.enqueue(task(QueueClass::Low, Duration::ZERO)).await.unwrap();

        assert!(queue.dequeue(QueueClass::Low, LEASE).await.unwrap().is_some());
        assert!(queue.dequeue(QueueClass::Low, LEASE).await.unwrap().is_none());
        assert!(queue.dequeue(QueueClass::Critical, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_redelivers_with_bumped_retry() {
        let queue = MemoryQueue::new();
        let info = queue
            .enqueue(task(QueueClass::Default, Duration::ZERO))
            .await
            .unwrap();
        queue.dequeue(QueueClass::Default, LEASE).await.unwrap();

        queue.force_due(info.id).unwrap();
        let again = queue.dequeue(QueueClass::Default, LEASE).await.unwrap().unwrap();
        assert_eq!(again.id, info.id);
        assert_eq!(again.retried, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_without_budget_archives() {
        let queue = MemoryQueue::new();
        let info = queue
            .enqueue(Task::new(
                "task:test",
                Vec::new(),
                TaskOptions::default().max_retry(0),
            ))
            .await
            .unwrap();
        queue.dequeue(QueueClass::Default, LEASE).await.unwrap();

        queue.force_due(info.id).unwrap();
        assert!(queue.dequeue(QueueClass::Default, LEASE).await.unwrap().is_none());
        let archived = queue.archived();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].1, "lease expired");
    }

    #[tokio::test]
    async fn test_unavailable_rejects_enqueue() {
        let queue = MemoryQueue::new();
        queue.set_unavailable(Some("redis down"));
        let err = queue
            .enqueue(task(QueueClass::Default, Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Unavailable(_)));

        queue.set_unavailable(None);
        assert!(queue.enqueue(task(QueueClass::Default, Duration::ZERO)).await.is_ok());
    }

    #[tokio::test]
    async fn test_complete_removes_task() {
        let queue = MemoryQueue::new();
        let info = queue
            .enqueue(task(QueueClass::Critical, Duration::ZERO))
            .await
            .unwrap();
        let leased = queue.dequeue(QueueClass::Critical, LEASE).await.unwrap().unwrap();
        assert!(leased.lease_until.is_some());
        queue.complete(&leased).await.unwrap();

        assert!(queue.tasks().is_empty());
        assert_eq!(queue.completed(), vec![info.id]);
        assert!(matches!(
            queue.complete(&leased).await,
            Err(QueueError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unleased_task_cannot_be_settled() {
        let queue = MemoryQueue::new();
        let info = queue
            .enqueue(task(QueueClass::Default, Duration::ZERO))
            .await
            .unwrap();

        assert!(matches!(
            queue.complete(&info).await,
            Err(QueueError::LeaseLost(_))
        ));
        assert_eq!(queue.pending(QueueClass::Default).len(), 1);
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_settle_redelivered_task() {
        let queue = MemoryQueue::new();
        let info = queue
            .enqueue(task(QueueClass::Default, Duration::ZERO))
            .await
            .unwrap();
        let stale = queue.dequeue(QueueClass::Default, LEASE).await.unwrap().unwrap();
        queue.force_due(info.id).unwrap();
        let current = queue.dequeue(QueueClass::Default, LEASE).await.unwrap().unwrap();
        assert_ne!(stale.lease_until, current.lease_until);

        for result in [
            queue.complete(&stale).await,
            queue.retry(&stale, Duration::ZERO, "late").await,
            queue.archive(&stale, "late").await,
        ] {
            assert!(matches!(result, Err(QueueError::LeaseLost(id)) if id == info.id));
        }
        assert!(queue.completed().is_empty());
        assert!(queue.archived().is_empty());

        queue.complete(&current).await.unwrap();
        assert_eq!(queue.completed(), vec![info.id]);
    }

    #[tokio::test]
    async fn test_lease_archived_on_expiry_cannot_be_settled() {
        let queue = MemoryQueue::new();
        let info = queue
            .enqueue(Task::new(
                "task:test",
                Vec::new(),
                TaskOptions::default().max_retry(0),
            ))
            .await
            .unwrap();
        let stale = queue.dequeue(QueueClass::Default, LEASE).await.unwrap().unwrap();
        queue.force_due(info.id).unwrap();
        assert!(queue.dequeue(QueueClass::Default, LEASE).await.unwrap().is_none());

        assert!(matches!(
            queue.complete(&stale).await,
            Err(QueueError::LeaseLost(_))
        ));
        assert_eq!(queue.archived().len(), 1);
    }
}
