//! Task Processor
//!
//! Consumer side of the task queue. A pool of worker loops leases due tasks,
//! dispatches them to the handler registered for their type and settles each
//! one: completed, retried with backoff, or archived.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::error::{HandlerError, QueueError};
use super::queue::{Backoff, TaskQueue};
use super::task::{QueueClass, TaskId, TaskInfo};
use crate::config::WorkerConfig;

/// Processes one task type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskInfo) -> Result<(), HandlerError>;
}

/// Runtime settings for [`TaskProcessor`]
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Number of concurrent worker loops
    pub concurrency: usize,
    /// Queues to consume with their relative weights
    pub queues: Vec<(QueueClass, u32)>,
    /// Always drain higher-weight queues first
    pub strict_priority: bool,
    /// Sleep between polls when every queue is empty
    pub poll_interval: Duration,
    /// Handler runs longer than this count as a failed attempt
    pub task_timeout: Duration,
    /// How long a dequeued task stays leased to a worker
    pub lease: Duration,
    pub backoff: Backoff,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: QueueClass::ALL
                .iter()
                .map(|q| (*q, q.default_weight()))
                .collect(),
            strict_priority: false,
            poll_interval: Duration::from_secs(1),
            task_timeout: Duration::from_secs(1800),
            lease: Duration::from_secs(1830),
            backoff: Backoff::Default,
        }
    }
}

impl ProcessorConfig {
    pub fn from_worker_config(config: &WorkerConfig) -> anyhow::Result<Self> {
        let mut queues = Vec::with_capacity(config.queues.len());
        for (name, weight) in &config.queues {
            let queue = name
                .parse::<QueueClass>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid worker.queues entry: {}", name))?;
            if *weight > 0 {
                queues.push((queue, *weight));
            }
        }
        if queues.is_empty() {
            anyhow::bail!("worker.queues must list at least one queue with a positive weight");
        }
        if config.concurrency == 0 {
            anyhow::bail!("worker.concurrency must be positive");
        }
        if config.lease_secs <= config.task_timeout_secs {
            anyhow::bail!(
                "worker.lease_secs ({}) must exceed worker.task_timeout_secs ({})",
                config.lease_secs,
                config.task_timeout_secs
            );
        }

        Ok(Self {
            concurrency: config.concurrency,
            queues,
            strict_priority: config.strict_priority,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            task_timeout: Duration::from_secs(config.task_timeout_secs),
            lease: Duration::from_secs(config.lease_secs),
            backoff: Backoff::Default,
        })
    }
}

/// How a processed task was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Retried { delay: Duration },
    Archived { reason: String },
    /// The lease ran out before the task was settled; its new owner decides
    LeaseLost,
}

/// Task Processor - leases tasks and dispatches them to handlers
pub struct TaskProcessor {
    queue: Arc<dyn TaskQueue>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    config: ProcessorConfig,
}

impl TaskProcessor {
    pub fn new(queue: Arc<dyn TaskQueue>, config: ProcessorConfig) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            config,
        }
    }

    /// Register the handler for `task_type`
    pub fn handle(mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(task_type.into(), handler);
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Order in which queues are polled for the next task. Zero-weight
    /// queues are never polled.
    ///
    /// Strict mode sorts by weight. Otherwise queues are drawn at random
    /// without replacement, each draw proportional to weight, so a busy
    /// high-priority queue cannot starve the others.
    pub fn queue_order(&self) -> Vec<QueueClass> {
        let mut remaining: Vec<(QueueClass, u64)> = self
            .config
            .queues
            .iter()
            .filter(|(_, w)| *w > 0)
            .map(|(q, w)| (*q, u64::from(*w)))
            .collect();
        if self.config.strict_priority {
            remaining.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            return remaining.into_iter().map(|(q, _)| q).collect();
        }

        let mut rng = rand::thread_rng();
        let mut order = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let total: u64 = remaining.iter().map(|(_, w)| *w).sum();
            let mut pick = rng.gen_range(0..total);
            let index = remaining
                .iter()
                .position(|(_, w)| {
                    if pick < *w {
                        true
                    } else {
                        pick -= *w;
                        false
                    }
                })
                .unwrap_or(remaining.len() - 1);
            order.push(remaining.remove(index).0);
        }
        order
    }

    /// Lease and execute at most one task. `None` when every queue is idle.
    pub async fn process_next(&self) -> Result<Option<(TaskId, TaskOutcome)>, QueueError> {
        for queue in self.queue_order() {
            if let Some(task) = self.queue.dequeue(queue, self.config.lease).await? {
                let id = task.id;
                let outcome = self.execute(task).await?;
                return Ok(Some((id, outcome)));
            }
        }
        Ok(None)
    }

    /// Run the handler for a leased task and settle it in the queue
    pub async fn execute(&self, task: TaskInfo) -> Result<TaskOutcome, QueueError> {
        debug!(
            task_id = task.id,
            task_type = %task.task_type,
            retried = task.retried,
            "Processing task"
        );

        let result = match self.handlers.get(&task.task_type) {
            Some(handler) => {
                match tokio::time::timeout(self.config.task_timeout, handler.handle(&task)).await {
                    Ok(result) => result,
                    Err(_) => Err(HandlerError::Failed(anyhow::anyhow!(
                        "task timed out after {:?}",
                        self.config.task_timeout
                    ))),
                }
            }
            None => Err(HandlerError::Failed(anyhow::anyhow!(
                "no handler registered for task type {}",
                task.task_type
            ))),
        };

        let settled = match result {
            Ok(()) => self.queue.complete(&task).await.map(|()| {
                debug!(task_id = task.id, task_type = %task.task_type, "Task completed");
                TaskOutcome::Completed
            }),
            Err(HandlerError::SkipRetry(reason)) => {
                error!(
                    task_id = task.id,
                    task_type = %task.task_type,
                    payload = %String::from_utf8_lossy(&task.payload),
                    error = %reason,
                    "Process task failed, skipping retry"
                );
                self.queue
                    .archive(&task, &reason)
                    .await
                    .map(|()| TaskOutcome::Archived { reason })
            }
            Err(HandlerError::Failed(err)) => {
                let reason = format!("{:#}", err);
                error!(
                    task_id = task.id,
                    task_type = %task.task_type,
                    payload = %String::from_utf8_lossy(&task.payload),
                    retried = task.retried,
                    max_retry = task.max_retry,
                    error = %reason,
                    "Process task failed"
                );
                if task.retries_exhausted() {
                    warn!(task_id = task.id, "Retries exhausted, archiving task");
                    self.queue
                        .archive(&task, &reason)
                        .await
                        .map(|()| TaskOutcome::Archived { reason })
                } else {
                    let delay = self.config.backoff.delay(task.retried);
                    self.queue
                        .retry(&task, delay, &reason)
                        .await
                        .map(|()| TaskOutcome::Retried { delay })
                }
            }
        };

        match settled {
            Err(QueueError::LeaseLost(id)) => {
                warn!(task_id = id, task_type = %task.task_type, "Lease lost before settling task");
                Ok(TaskOutcome::LeaseLost)
            }
            other => other,
        }
    }

    /// Run the worker pool until `shutdown` flips to `true` (or its sender
    /// is dropped). In-flight tasks finish before this returns.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            concurrency = self.config.concurrency,
            strict_priority = self.config.strict_priority,
            queues = ?self.config.queues,
            "Starting task processor"
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.concurrency {
            let processor = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { processor.worker_loop(worker_id, shutdown).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker loop panicked");
            }
        }
        info!("Task processor stopped");
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker_id, "Worker loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker_id, error = %e, "Task queue error"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!(worker_id, "Worker loop stopped");
    }
}
