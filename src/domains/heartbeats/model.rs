//! Heartbeat model and queries (spec.md §3 "Heartbeat", §4.7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::common::error::Result;
use crate::common::ids::{HeartbeatId, WorkspaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "heartbeat_status", rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Waiting,
    Healthy,
    Late,
    Dead,
    Paused,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Heartbeat {
    pub id: HeartbeatId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub expected_interval_seconds: i32,
    pub grace_period_seconds: i32,
    pub ping_token: String,
    pub status: HeartbeatStatus,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub consecutive_misses: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a ping ingest, for the `/ping/{token}` handler to map onto an
/// HTTP response (spec.md §4.7, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingIngestOutcome {
    Recorded { recovered: bool },
    Paused,
}

impl Heartbeat {
    pub async fn find_by_token(pool: &PgPool, token: &str) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM heartbeats WHERE ping_token = $1")
            .bind(token)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    /// Ingests one ping: rejects paused heartbeats, otherwise records the
    /// ping (resetting status to healthy and clearing misses) and reports
    /// whether this is a post-failure recovery (spec.md §4.7 "fire recovery
    /// notification" on first post-failure ping).
    pub async fn ingest_ping(
        pool: &PgPool,
        heartbeat: &Self,
        now: DateTime<Utc>,
        source_ip: Option<String>,
        payload: Option<serde_json::Value>,
    ) -> Result<PingIngestOutcome> {
        if heartbeat.status == HeartbeatStatus::Paused {
            return Ok(PingIngestOutcome::Paused);
        }
        let recovered = matches!(heartbeat.status, HeartbeatStatus::Late | HeartbeatStatus::Dead);
        Self::record_ping(pool, heartbeat.id, now).await?;
        HeartbeatPing::record(pool, heartbeat.id, now, source_ip, payload).await?;
        Ok(PingIngestOutcome::Recorded { recovered })
    }

    pub async fn record_ping(pool: &PgPool, id: HeartbeatId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE heartbeats
            SET status = 'healthy', last_ping_at = $1, consecutive_misses = 0, updated_at = now()
            WHERE id = $2
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Heartbeats due for a sweep transition: currently waiting/healthy/late,
    /// not paused. The sweep itself (kernel::sweeps) decides late vs dead.
    pub async fn find_active(pool: &PgPool) -> Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            "SELECT * FROM heartbeats WHERE status != 'paused'",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn set_status(
        pool: &PgPool,
        id: HeartbeatId,
        status: HeartbeatStatus,
        consecutive_misses: i32,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE heartbeats SET status = $1, consecutive_misses = $2, updated_at = now() WHERE id = $3",
        )
        .bind(status)
        .bind(consecutive_misses)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// Capped append-only ping history (spec.md §4.7 "Each ping is appended to a
/// capped history").
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HeartbeatPing {
    pub id: uuid::Uuid,
    pub heartbeat_id: HeartbeatId,
    pub pinged_at: DateTime<Utc>,
    pub source_ip: Option<String>,
    pub payload: Option<serde_json::Value>,
}

pub const MAX_HEARTBEAT_HISTORY: i64 = 100;

impl HeartbeatPing {
    pub async fn record(
        pool: &PgPool,
        heartbeat_id: HeartbeatId,
        now: DateTime<Utc>,
        source_ip: Option<String>,
        payload: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO heartbeat_pings (id, heartbeat_id, pinged_at, source_ip, payload) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(uuid::Uuid::new_v4())
        .bind(heartbeat_id)
        .bind(now)
        .bind(source_ip)
        .bind(payload)
        .execute(pool)
        .await?;

        // Trim to the most recent MAX_HEARTBEAT_HISTORY entries.
        sqlx::query(
            r#"
            DELETE FROM heartbeat_pings
            WHERE heartbeat_id = $1
              AND id NOT IN (
                  SELECT id FROM heartbeat_pings
                  WHERE heartbeat_id = $1
                  ORDER BY pinged_at DESC
                  LIMIT $2
              )
            "#,
        )
        .bind(heartbeat_id)
        .bind(MAX_HEARTBEAT_HISTORY)
        .execute(pool)
        .await?;
        Ok(())
    }
}
