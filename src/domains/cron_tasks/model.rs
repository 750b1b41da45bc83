//! CronTask model and queries (spec.md §3 "CronTask").
//!
//! SQL queries live alongside the model they operate on, following the
//! teacher's convention ("ALL queries must be in models/").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};

use crate::common::error::Result;
use crate::common::ids::{CronTaskId, WorkerId, WorkspaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "protocol_kind", rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Icmp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "http_method", rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "overlap_policy", rename_all = "lowercase")]
pub enum OverlapPolicy {
    Allow,
    Skip,
    Queue,
}

/// Protocol-specific parameters, stored as a `jsonb` column (`protocol_params`)
/// alongside the `protocol` discriminant column — mirrors the teacher's
/// `Job.args: serde_json::Value` pattern in `kernel/job_queue.rs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtocolParams {
    Http {
        url: String,
        method: HttpMethod,
        #[serde(default)]
        headers: std::collections::HashMap<String, String>,
        body: Option<String>,
    },
    Icmp {
        host: String,
        count: u32,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CronTask {
    pub id: CronTaskId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub protocol: Protocol,
    pub protocol_params: serde_json::Value,
    pub schedule: String,
    pub timezone: String,
    pub timeout_seconds: i32,
    pub retry_count: i32,
    pub retry_delay_seconds: i32,
    pub overlap_policy: OverlapPolicy,
    pub max_instances: i32,
    pub max_queue_size: i32,
    pub execution_timeout_seconds: Option<i32>,
    pub running_instances: i32,
    pub worker_id: Option<WorkerId>,
    pub is_active: bool,
    pub is_paused: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub consecutive_failures: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CronTask {
    pub fn protocol_params(&self) -> serde_json::Result<ProtocolParams> {
        serde_json::from_value(self.protocol_params.clone())
    }

    /// Due-selection: one row at a time, row-locked with SKIP LOCKED so
    /// concurrent scheduler processes never double-dispatch the same tick
    /// (spec.md §4.4 "Due-selection protocol"). The caller is expected to be
    /// inside a transaction and to update `next_run_at` + commit before
    /// selecting the next row.
    pub async fn lock_one_due(tx: &mut Transaction<'_, Postgres>, now: DateTime<Utc>) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT *
            FROM cron_tasks
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
        id: CronTaskId,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE cron_tasks SET next_run_at = $1, updated_at = now() WHERE id = $2")
            .bind(next_run_at)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// NextRunRecompute loop (spec.md §4.4): back-fill `next_run_at` for
    /// active, unpaused tasks where it's null.
    pub async fn find_missing_next_run_at(pool: &PgPool, limit: i64) -> Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM cron_tasks
            WHERE is_active AND NOT is_paused AND next_run_at IS NULL
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn record_run_result(
        pool: &PgPool,
        id: CronTaskId,
        last_run_at: DateTime<Utc>,
        last_status: &str,
        consecutive_failures: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cron_tasks
            SET last_run_at = $1, last_status = $2, consecutive_failures = $3, updated_at = now()
            WHERE id = $4
            "#,
        )
        .bind(last_run_at)
        .bind(last_status)
        .bind(consecutive_failures)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(pool: &PgPool, id: CronTaskId) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM cron_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    /// Stale-instance cleanup (spec.md §4.3): zero `running_instances` for any
    /// task whose `last_run_at + execution_timeout` is in the past. Null
    /// `execution_timeout` means "no reset" (spec.md §9 open question).
    pub async fn cleanup_stale_instances(pool: &PgPool, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE cron_tasks
            SET running_instances = 0, updated_at = now()
            WHERE running_instances > 0
              AND execution_timeout_seconds IS NOT NULL
              AND last_run_at IS NOT NULL
              AND last_run_at + (execution_timeout_seconds || ' seconds')::interval < $1
            "#,
        )
        .bind(now)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
