//! Execution / ChainExecution / StepExecution audit records (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::common::error::Result;
use crate::common::ids::{
    ChainExecutionId, ChainStepId, CronTaskId, DelayedTaskId, ExecutionId, StepExecutionId,
    TaskChainId, WorkspaceId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "execution_status", rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Timeout,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "execution_source", rename_all = "lowercase")]
pub enum ExecutionSource {
    CronTask,
    DelayedTask,
}

/// A single probe-execution record (one CronTask/DelayedTask run).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Execution {
    pub id: ExecutionId,
    pub workspace_id: WorkspaceId,
    pub source: ExecutionSource,
    pub cron_task_id: Option<CronTaskId>,
    pub delayed_task_id: Option<DelayedTaskId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub attempt: i32,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
}

impl Execution {
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        pool: &PgPool,
        workspace_id: WorkspaceId,
        source: ExecutionSource,
        cron_task_id: Option<CronTaskId>,
        delayed_task_id: Option<DelayedTaskId>,
        started_at: DateTime<Utc>,
        attempt: i32,
    ) -> Result<ExecutionId> {
        let id = ExecutionId::new();
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, workspace_id, source, cron_task_id, delayed_task_id, started_at, status, attempt)
            VALUES ($1, $2, $3, $4, $5, $6, 'failed', $7)
            "#,
        )
        .bind(id)
        .bind(workspace_id)
        .bind(source)
        .bind(cron_task_id)
        .bind(delayed_task_id)
        .bind(started_at)
        .bind(attempt)
        .execute(pool)
        .await?;
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn complete(
        pool: &PgPool,
        id: ExecutionId,
        finished_at: DateTime<Utc>,
        status: ExecutionStatus,
        response_code: Option<i32>,
        response_body: Option<String>,
        error_message: Option<String>,
        duration_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE executions
            SET finished_at = $1, status = $2, response_code = $3, response_body = $4,
                error_message = $5, duration_ms = $6
            WHERE id = $7
            "#,
        )
        .bind(finished_at)
        .bind(status)
        .bind(response_code)
        .bind(response_body)
        .bind(error_message)
        .bind(duration_ms)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// ExecutionGC sweep (spec.md §4.4): delete executions past each
    /// workspace's retention window.
    pub async fn delete_older_than(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM executions WHERE started_at < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChainExecution {
    pub id: ChainExecutionId,
    pub workspace_id: WorkspaceId,
    pub chain_id: TaskChainId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: Option<crate::domains::chains::ChainStatus>,
    /// Accumulated `{{var}}` bindings extracted across steps, as jsonb.
    pub variables: serde_json::Value,
}

impl ChainExecution {
    pub async fn create(
        pool: &PgPool,
        workspace_id: WorkspaceId,
        chain_id: TaskChainId,
        started_at: DateTime<Utc>,
    ) -> Result<ChainExecutionId> {
        let id = ChainExecutionId::new();
        sqlx::query(
            r#"
            INSERT INTO chain_executions (id, workspace_id, chain_id, started_at, variables)
            VALUES ($1, $2, $3, $4, '{}'::jsonb)
            "#,
        )
        .bind(id)
        .bind(workspace_id)
        .bind(chain_id)
        .bind(started_at)
        .execute(pool)
        .await?;
        Ok(id)
    }

    pub async fn complete(
        pool: &PgPool,
        id: ChainExecutionId,
        finished_at: DateTime<Utc>,
        status: crate::domains::chains::ChainStatus,
        variables: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE chain_executions SET finished_at = $1, status = $2, variables = $3 WHERE id = $4",
        )
        .bind(finished_at)
        .bind(status)
        .bind(variables)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepExecution {
    pub id: StepExecutionId,
    pub chain_execution_id: ChainExecutionId,
    pub step_id: ChainStepId,
    pub step_order: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub attempt: i32,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub condition_matched: Option<bool>,
}

impl StepExecution {
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        pool: &PgPool,
        chain_execution_id: ChainExecutionId,
        step_id: ChainStepId,
        step_order: i32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        status: ExecutionStatus,
        attempt: i32,
        response_code: Option<i32>,
        response_body: Option<String>,
        error_message: Option<String>,
        condition_matched: Option<bool>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO step_executions
                (id, chain_execution_id, step_id, step_order, started_at, finished_at, status,
                 attempt, response_code, response_body, error_message, condition_matched)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(StepExecutionId::new())
        .bind(chain_execution_id)
        .bind(step_id)
        .bind(step_order)
        .bind(started_at)
        .bind(finished_at)
        .bind(status)
        .bind(attempt)
        .bind(response_code)
        .bind(response_body)
        .bind(error_message)
        .bind(condition_matched)
        .execute(pool)
        .await?;
        Ok(())
    }
}
