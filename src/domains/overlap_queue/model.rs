//! Overlap queue: FIFO backlog for tasks/chains under `OverlapPolicy::Queue`
//! (spec.md §4.3 "Overlap and concurrency control").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::common::error::Result;
use crate::common::ids::WorkspaceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_kind", rename_all = "lowercase")]
pub enum TaskKind {
    CronTask,
    DelayedTask,
    TaskChain,
}

/// One queued-but-not-yet-dispatched run, waiting for a concurrency slot to
/// free up. Ordered FIFO per `(task_kind, task_id)` by `enqueued_at`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OverlapQueueEntry {
    pub id: Uuid,
    pub workspace_id: WorkspaceId,
    pub task_kind: TaskKind,
    pub task_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    pub retry_attempt: i32,
    /// Chain-trigger variable bindings to seed the run with, if any.
    pub initial_variables: Option<serde_json::Value>,
}

impl OverlapQueueEntry {
    pub async fn push(
        tx: &mut Transaction<'_, Postgres>,
        workspace_id: WorkspaceId,
        task_kind: TaskKind,
        task_id: Uuid,
        now: DateTime<Utc>,
        initial_variables: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO overlap_queue_entries
                (id, workspace_id, task_kind, task_id, enqueued_at, retry_attempt, initial_variables)
            VALUES ($1, $2, $3, $4, $5, 0, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(workspace_id)
        .bind(task_kind)
        .bind(task_id)
        .bind(now)
        .bind(initial_variables)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Count of entries currently queued for this task, used against
    /// `max_queue_size` (spec.md §4.3).
    pub async fn count_for_task(pool: &PgPool, task_kind: TaskKind, task_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM overlap_queue_entries WHERE task_kind = $1 AND task_id = $2",
        )
        .bind(task_kind)
        .bind(task_id)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    /// Pop the oldest queued entry for a task, locked so two release paths
    /// racing on the same freed slot can't both dequeue it (same SKIP LOCKED
    /// idiom as the due-selection loops).
    pub async fn pop_oldest(
        tx: &mut Transaction<'_, Postgres>,
        task_kind: TaskKind,
        task_id: Uuid,
    ) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM overlap_queue_entries
            WHERE task_kind = $1 AND task_id = $2
            ORDER BY enqueued_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(task_kind)
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await?;
        if let Some(ref entry) = row {
            sqlx::query("DELETE FROM overlap_queue_entries WHERE id = $1")
                .bind(entry.id)
                .execute(&mut **tx)
                .await?;
        }
        Ok(row)
    }
}
