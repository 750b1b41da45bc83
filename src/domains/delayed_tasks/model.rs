//! DelayedTask model and queries (spec.md §3 "DelayedTask").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};

use crate::common::error::Result;
use crate::common::ids::{DelayedTaskId, WorkerId, WorkspaceId};
use crate::domains::cron_tasks::model::OverlapPolicy;
use crate::domains::cron_tasks::model::Protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "delayed_task_status", rename_all = "lowercase")]
pub enum DelayedTaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DelayedTask {
    pub id: DelayedTaskId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub protocol: Protocol,
    pub protocol_params: serde_json::Value,
    pub execute_at: DateTime<Utc>,
    pub status: DelayedTaskStatus,
    pub timeout_seconds: i32,
    pub retry_count: i32,
    pub retry_delay_seconds: i32,
    pub retry_attempt: i32,
    pub overlap_policy: OverlapPolicy,
    pub max_instances: i32,
    pub max_queue_size: i32,
    pub execution_timeout_seconds: Option<i32>,
    pub running_instances: i32,
    pub worker_id: Option<WorkerId>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DelayedTask {
    pub fn protocol_params(&self) -> serde_json::Result<super::super::cron_tasks::model::ProtocolParams> {
        serde_json::from_value(self.protocol_params.clone())
    }

    /// Due-selection for the DelayedPoll loop: `status = pending AND execute_at
    /// <= now`, SKIP LOCKED (spec.md §4.4).
    pub async fn lock_one_due(tx: &mut Transaction<'_, Postgres>, now: DateTime<Utc>) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT *
            FROM delayed_tasks
            WHERE status = 'pending' AND execute_at <= $1
            ORDER BY execute_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row)
    }

    pub async fn mark_running(tx: &mut Transaction<'_, Postgres>, id: DelayedTaskId) -> Result<()> {
        sqlx::query("UPDATE delayed_tasks SET status = 'running', updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn mark_terminal(
        pool: &PgPool,
        id: DelayedTaskId,
        status: DelayedTaskStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE delayed_tasks SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Records the retry attempt number for observability while a retry is
    /// in flight. Unlike an earlier revision, this does *not* reset `status`
    /// to `pending` or push `execute_at` forward: a `DelayedTask` retry is a
    /// same-tick re-drive handed directly back to the executor (mirroring
    /// `Executor::enqueue_retry_cron`), not a re-entry into `lock_one_due`'s
    /// due-selection — see `Executor::enqueue_retry_delayed`. The row stays
    /// `running` and its overlap slot stays held across every retry attempt
    /// of the same invocation, exactly like a `CronTask` retry.
    pub async fn bump_retry_attempt(pool: &PgPool, id: DelayedTaskId, retry_attempt: i32) -> Result<()> {
        sqlx::query("UPDATE delayed_tasks SET retry_attempt = $1, updated_at = now() WHERE id = $2")
            .bind(retry_attempt)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn find_by_id(pool: &PgPool, id: DelayedTaskId) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM delayed_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    pub async fn cleanup_stale_instances(pool: &PgPool, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE delayed_tasks
            SET running_instances = 0, updated_at = now()
            WHERE running_instances > 0
              AND execution_timeout_seconds IS NOT NULL
              AND updated_at + (execution_timeout_seconds || ' seconds')::interval < $1
            "#,
        )
        .bind(now)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
