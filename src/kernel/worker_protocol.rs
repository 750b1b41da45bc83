//! External worker protocol (spec.md §6 "External worker protocol"): workers
//! long-poll a per-worker queue and receive `WorkerTaskInfo` for tasks that
//! carry a `worker_id` instead of running on the local executor pool.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::common::error::Result;
use crate::common::ids::{CronTaskId, DelayedTaskId, WorkerId, WorkspaceId};
use crate::domains::cron_tasks::model::HttpMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTaskType {
    Cron,
    Delayed,
}

/// Exactly the shape spec.md §6 names; this is what gets pushed onto a
/// worker's queue and handed back on long-poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTaskInfo {
    pub task_id: uuid::Uuid,
    pub task_type: WorkerTaskType,
    pub url: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout_seconds: i32,
    pub retry_count: i32,
    pub retry_delay_seconds: i32,
    pub workspace_id: WorkspaceId,
    pub task_name: String,
}

/// Durable per-worker queue backing the long-poll endpoint. A plain table
/// (rather than an in-memory channel) so a worker that disconnects mid-poll
/// doesn't lose work — the scheduler already committed the push before the
/// worker ever connected.
pub struct WorkerQueue;

impl WorkerQueue {
    pub async fn push(pool: &PgPool, worker_id: WorkerId, task: &WorkerTaskInfo) -> Result<()> {
        let payload = serde_json::to_value(task).expect("WorkerTaskInfo always serializes");
        sqlx::query(
            "INSERT INTO worker_queue_entries (id, worker_id, task_info, enqueued_at) VALUES ($1, $2, $3, now())",
        )
        .bind(uuid::Uuid::new_v4())
        .bind(worker_id)
        .bind(payload)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Same as [`push`](Self::push) but inside the caller's transaction, so
    /// the push commits atomically with the due-selection advance
    /// (spec.md §4.4 step 4, "all of this happens before commit").
    pub async fn push_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        worker_id: WorkerId,
        task: &WorkerTaskInfo,
    ) -> Result<()> {
        let payload = serde_json::to_value(task).expect("WorkerTaskInfo always serializes");
        sqlx::query(
            "INSERT INTO worker_queue_entries (id, worker_id, task_info, enqueued_at) VALUES ($1, $2, $3, now())",
        )
        .bind(uuid::Uuid::new_v4())
        .bind(worker_id)
        .bind(payload)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Pops the oldest task for this worker, if any, atomically (SKIP LOCKED
    /// so two long-poll connections for the same worker never race).
    pub async fn pop(pool: &PgPool, worker_id: WorkerId) -> Result<Option<WorkerTaskInfo>> {
        let mut tx = pool.begin().await?;
        let row: Option<(uuid::Uuid, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT id, task_info FROM worker_queue_entries
            WHERE worker_id = $1
            ORDER BY enqueued_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, payload)) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        sqlx::query("DELETE FROM worker_queue_entries WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let task: WorkerTaskInfo = serde_json::from_value(payload)
            .map_err(|e| crate::common::error::AppError::Rejected(format!("corrupt queue entry: {e}")))?;
        Ok(Some(task))
    }
}

pub fn worker_task_info_for_cron(
    task_id: CronTaskId,
    workspace_id: WorkspaceId,
    task_name: &str,
    url: String,
    method: HttpMethod,
    headers: HashMap<String, String>,
    body: Option<String>,
    timeout_seconds: i32,
    retry_count: i32,
    retry_delay_seconds: i32,
) -> WorkerTaskInfo {
    WorkerTaskInfo {
        task_id: task_id.into(),
        task_type: WorkerTaskType::Cron,
        url,
        method,
        headers,
        body,
        timeout_seconds,
        retry_count,
        retry_delay_seconds,
        workspace_id,
        task_name: task_name.to_string(),
    }
}

pub fn worker_task_info_for_delayed(
    task_id: DelayedTaskId,
    workspace_id: WorkspaceId,
    task_name: &str,
    url: String,
    method: HttpMethod,
    headers: HashMap<String, String>,
    body: Option<String>,
    timeout_seconds: i32,
    retry_count: i32,
    retry_delay_seconds: i32,
) -> WorkerTaskInfo {
    WorkerTaskInfo {
        task_id: task_id.into(),
        task_type: WorkerTaskType::Delayed,
        url,
        method,
        headers,
        body,
        timeout_seconds,
        retry_count,
        retry_delay_seconds,
        workspace_id,
        task_name: task_name.to_string(),
    }
}
