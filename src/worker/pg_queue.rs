//! PostgreSQL-backed [`TaskQueue`]
//!
//! Tasks live in the `tasks` table. Workers claim rows with
//! `FOR UPDATE SKIP LOCKED`, so concurrent workers never lease the same task.
//! Completed tasks are deleted; archived ones stay for inspection.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{FromRow, PgExecutor};

use super::error::QueueError;
use super::queue::TaskQueue;
use super::task::{QueueClass, Task, TaskId, TaskInfo};

#[derive(Debug, FromRow)]
struct TaskRow {
    id: i64,
    task_type: String,
    payload: Vec<u8>,
    queue: String,
    max_retry: i32,
    retried: i32,
    run_at: DateTime<Utc>,
    lease_until: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for TaskInfo {
    type Error = QueueError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let queue = row.queue.parse::<QueueClass>().map_err(QueueError::Corrupted)?;
        Ok(TaskInfo {
            id: row.id,
            task_type: row.task_type,
            payload: row.payload,
            queue,
            max_retry: u32::try_from(row.max_retry).unwrap_or(0),
            retried: u32::try_from(row.retried).unwrap_or(0),
            next_process_at: row.run_at,
            lease_until: row.lease_until,
        })
    }
}

fn secs(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

fn clamp_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Queue stored in PostgreSQL
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Archive leased tasks whose lease ran out with no retries left
    async fn archive_expired<'e, E: PgExecutor<'e>>(
        exec: E,
        queue: QueueClass,
    ) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"UPDATE tasks
               SET state = 'archived', lease_until = NULL, last_error = 'lease expired'
               WHERE queue = $1 AND state = 'active' AND lease_until <= NOW()
                 AND retried >= max_retry"#,
        )
        .bind(queue.as_str())
        .execute(exec)
        .await?;
        Ok(result.rows_affected())
    }

    /// Zero settled rows means the task is gone or its lease moved on
    async fn expect_settled(&self, id: TaskId, rows_affected: u64) -> Result<(), QueueError> {
        if rows_affected > 0 {
            return Ok(());
        }
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM tasks WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            Err(QueueError::LeaseLost(id))
        } else {
            Err(QueueError::TaskNotFound(id))
        }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<TaskInfo, QueueError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"INSERT INTO tasks (task_type, payload, queue, max_retry, run_at)
               VALUES ($1, $2, $3, $4, NOW() + make_interval(secs => $5))
               RETURNING id, task_type, payload, queue, max_retry, retried, run_at, lease_until"#,
        )
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(task.opts.queue.as_str())
        .bind(clamp_i32(task.opts.max_retry))
        .bind(secs(task.opts.process_in))
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn dequeue(
        &self,
        queue: QueueClass,
        lease: Duration,
    ) -> Result<Option<TaskInfo>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let archived = Self::archive_expired(&mut *tx, queue).await?;
        if archived > 0 {
            tracing::warn!(queue = %queue, archived, "Archived tasks with expired leases");
        }

        let row = sqlx::query_as::<_, TaskRow>(
            r#"WITH next AS (
                   SELECT id FROM tasks
                   WHERE queue = $1
                     AND ((state = 'pending' AND run_at <= NOW())
                       OR (state = 'active' AND lease_until <= NOW()))
                   ORDER BY run_at, id
                   LIMIT 1
                   FOR UPDATE SKIP LOCKED
               )
               UPDATE tasks t
               SET retried = CASE WHEN t.state = 'active' THEN t.retried + 1 ELSE t.retried END,
                   last_error = CASE WHEN t.state = 'active' THEN 'lease expired' ELSE t.last_error END,
                   state = 'active',
                   lease_until = NOW() + make_interval(secs => $2)
               FROM next
               WHERE t.id = next.id
               RETURNING t.id, t.task_type, t.payload, t.queue, t.max_retry, t.retried, t.run_at,
                         t.lease_until"#,
        )
        .bind(queue.as_str())
        .bind(secs(lease))
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        row.map(TaskInfo::try_from).transpose()
    }

    async fn complete(&self, task: &TaskInfo) -> Result<(), QueueError> {
        let result = sqlx::query(
            "DELETE FROM tasks WHERE id = $1 AND state = 'active' AND lease_until = $2",
        )
        .bind(task.id)
        .bind(task.lease_until)
        .execute(&self.pool)
        .await?;
        self.expect_settled(task.id, result.rows_affected()).await
    }

    async fn retry(&self, task: &TaskInfo, delay: Duration, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"UPDATE tasks
               SET state = 'pending', retried = retried + 1, lease_until = NULL,
                   run_at = NOW() + make_interval(secs => $3), last_error = $4
               WHERE id = $1 AND state = 'active' AND lease_until = $2"#,
        )
        .bind(task.id)
        .bind(task.lease_until)
        .bind(secs(delay))
        .bind(error)
        .execute(&self.pool)
        .await?;
        self.expect_settled(task.id, result.rows_affected()).await
    }

    async fn archive(&self, task: &TaskInfo, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"UPDATE tasks
               SET state = 'archived', lease_until = NULL, last_error = $3
               WHERE id = $1 AND state = 'active' AND lease_until = $2"#,
        )
        .bind(task.id)
        .bind(task.lease_until)
        .bind(error)
        .execute(&self.pool)
        .await?;
        self.expect_settled(task.id, result.rows_affected()).await
    }
}
