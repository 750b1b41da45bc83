//! TaskChain / ChainStep models (spec.md §3 "TaskChain").

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};

use crate::common::error::Result;
use crate::common::ids::{ChainStepId, TaskChainId, WorkspaceId};
use crate::domains::cron_tasks::model::{HttpMethod, OverlapPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "trigger_type", rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Cron,
    Delayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "chain_status", rename_all = "lowercase")]
pub enum ChainStatus {
    Success,
    Failed,
    Partial,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskChain {
    pub id: TaskChainId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub trigger_type: TriggerType,
    pub schedule: Option<String>,
    pub execute_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub stop_on_failure: bool,
    pub overlap_policy: OverlapPolicy,
    pub max_instances: i32,
    pub max_queue_size: i32,
    pub notify_on_failure: bool,
    pub notify_on_success: bool,
    pub notify_on_partial: bool,
    pub running_instances: i32,
    pub is_active: bool,
    pub is_paused: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A step's condition gate (spec.md §4.6 "Condition grammar").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCondition {
    pub operator: String,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChainStep {
    pub id: ChainStepId,
    pub chain_id: TaskChainId,
    pub step_order: i32,
    pub name: String,
    pub method: HttpMethod,
    pub url: String,
    /// Stored as jsonb map<string,string>.
    pub headers: serde_json::Value,
    pub body: Option<String>,
    pub timeout_seconds: i32,
    pub retry_count: i32,
    pub retry_delay_seconds: i32,
    /// jsonb map<var_name, jsonpath>.
    pub extract_variables: serde_json::Value,
    /// jsonb `StepCondition`, or null.
    pub condition: Option<serde_json::Value>,
    pub continue_on_failure: bool,
    pub is_enabled: bool,
}

impl ChainStep {
    pub fn headers_map(&self) -> HashMap<String, String> {
        serde_json::from_value(self.headers.clone()).unwrap_or_default()
    }

    pub fn extract_variables_map(&self) -> HashMap<String, String> {
        serde_json::from_value(self.extract_variables.clone()).unwrap_or_default()
    }

    pub fn condition(&self) -> Option<StepCondition> {
        self.condition
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl TaskChain {
    pub async fn lock_one_due(tx: &mut Transaction<'_, Postgres>, now: DateTime<Utc>) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT *
            FROM task_chains
            WHERE is_active AND NOT is_paused AND next_run_at <= $1
            ORDER BY next_run_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(now)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row)
    }

    pub async fn set_next_run_at(
        tx: &mut Transaction<'_, Postgres>,
        id: TaskChainId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE task_chains SET next_run_at = $1, updated_at = now() WHERE id = $2")
            .bind(next_run_at)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn steps(pool: &PgPool, chain_id: TaskChainId) -> Result<Vec<ChainStep>> {
        let rows = sqlx::query_as::<_, ChainStep>(
            "SELECT * FROM chain_steps WHERE chain_id = $1 ORDER BY step_order",
        )
        .bind(chain_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn find_by_id(pool: &PgPool, id: TaskChainId) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM task_chains WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    pub async fn update_last_run(
        pool: &PgPool,
        id: TaskChainId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE task_chains SET next_run_at = $1, updated_at = now() WHERE id = $2",
        )
        .bind(next_run_at)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}
