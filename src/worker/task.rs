//! Task Types

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retry budget when the caller does not set one
pub const DEFAULT_MAX_RETRY: u32 = 25;

pub type TaskId = i64;

/// Priority class of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    Critical,
    Default,
    Low,
}

impl QueueClass {
    /// Highest priority first
    pub const ALL: [QueueClass; 3] = [QueueClass::Critical, QueueClass::Default, QueueClass::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::Critical => "critical",
            QueueClass::Default => "default",
            QueueClass::Low => "low",
        }
    }

    pub fn default_weight(&self) -> u32 {
        match self {
            QueueClass::Critical => 6,
            QueueClass::Default => 3,
            QueueClass::Low => 1,
        }
    }
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(QueueClass::Critical),
            "default" => Ok(QueueClass::Default),
            "low" => Ok(QueueClass::Low),
            other => Err(format!("unknown queue: {}", other)),
        }
    }
}

/// Per-task delivery options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub max_retry: u32,
    /// Delay before the first delivery
    pub process_in: Duration,
    pub queue: QueueClass,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_retry: DEFAULT_MAX_RETRY,
            process_in: Duration::ZERO,
            queue: QueueClass::Default,
        }
    }
}

impl TaskOptions {
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = delay;
        self
    }

    pub fn queue(mut self, queue: QueueClass) -> Self {
        self.queue = queue;
        self
    }
}

/// A unit of work to enqueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub task_type: String,
    pub payload: Vec<u8>,
    pub opts: TaskOptions,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: Vec<u8>, opts: TaskOptions) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            opts,
        }
    }
}

/// A task as stored by the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: QueueClass,
    pub max_retry: u32,
    /// Failed attempts so far
    pub retried: u32,
    pub next_process_at: DateTime<Utc>,
    /// Lease held by this delivery; `None` until dequeued
    pub lease_until: Option<DateTime<Utc>>,
}

impl TaskInfo {
    pub fn retries_exhausted(&self) -> bool {
        self.retried >= self.max_retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_class_round_trip_names() {
        for class in QueueClass::ALL {
            assert_eq!(class.as_str().parse::<QueueClass>(), Ok(class));
        }
        assert!("urgent".parse::<QueueClass>().is_err());
    }

    #[test]
    fn test_queue_class_order() {
        assert!(QueueClass::Critical < QueueClass::Default);
        assert!(QueueClass::Default < QueueClass::Low);
        assert!(QueueClass::Critical.default_weight() > QueueClass::Low.default_weight());
    }

    #[test]
    fn test_task_options_builder() {
        let opts = TaskOptions::default()
            .max_retry(10)
            .process_in(Duration::from_secs(10))
            .queue(QueueClass::Critical);
        assert_eq!(opts.max_retry, 10);
        assert_eq!(opts.process_in, Duration::from_secs(10));
        assert_eq!(opts.queue, QueueClass::Critical);
        assert_eq!(TaskOptions::default().max_retry, DEFAULT_MAX_RETRY);
    }
}
