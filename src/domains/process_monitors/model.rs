//! ProcessMonitor / ProcessMonitorEvent models (spec.md §3, §4.8).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::error::Result;
use crate::common::ids::{ProcessMonitorId, WorkspaceId};
use crate::common::time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "monitor_schedule_type", rename_all = "lowercase")]
pub enum ScheduleType {
    Cron,
    Interval,
    ExactTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "concurrency_policy", rename_all = "lowercase")]
pub enum ConcurrencyPolicy {
    Skip,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "process_monitor_status", rename_all = "lowercase")]
pub enum ProcessMonitorStatus {
    WaitingStart,
    Running,
    MissedStart,
    MissedEnd,
    Paused,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessMonitor {
    pub id: ProcessMonitorId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub schedule_type: ScheduleType,
    pub schedule_cron: Option<String>,
    pub schedule_interval_seconds: Option<i32>,
    pub schedule_exact_time: Option<String>,
    pub timezone: String,
    pub start_grace_period_seconds: i32,
    pub end_timeout_seconds: i32,
    pub start_token: String,
    pub end_token: String,
    pub concurrency_policy: ConcurrencyPolicy,
    pub notify_on_missed_start: bool,
    pub notify_on_missed_end: bool,
    pub notify_on_recovery: bool,
    pub notify_on_success: bool,
    pub status: ProcessMonitorStatus,
    pub current_run_id: Option<Uuid>,
    pub last_start_at: Option<DateTime<Utc>>,
    pub next_expected_start: Option<DateTime<Utc>>,
    pub start_deadline: Option<DateTime<Utc>>,
    pub end_deadline: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a start-ping or end-ping, for `/ping/start/{token}` and
/// `/ping/end/{token}` to map onto HTTP responses (spec.md §4.8, §6).
#[derive(Debug, Clone)]
pub enum StartPingOutcome {
    Started { run_id: Uuid, recovered: bool },
    RejectedRunning,
    RejectedPaused,
}

#[derive(Debug, Clone)]
pub enum EndPingOutcome {
    Ended { run_id: Uuid, duration_ms: i64 },
    RejectedNotRunning,
}

impl ProcessMonitor {
    /// Computes this monitor's next expected start time from `now`
    /// (spec.md §4.5 "Next-fire computation"): cron in its IANA zone,
    /// `now + interval` for interval monitors, or the next HH:MM occurrence
    /// for exact_time monitors.
    pub fn next_expected_start(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let tz = time::parse_timezone(&self.timezone)?;
        match self.schedule_type {
            ScheduleType::Cron => {
                let expr = self.schedule_cron.as_deref().unwrap_or("");
                time::next_cron_fire(expr, tz, now)
            }
            ScheduleType::Interval => {
                let seconds = self.schedule_interval_seconds.unwrap_or(0) as i64;
                Ok(time::next_interval_fire(now, seconds))
            }
            ScheduleType::ExactTime => {
                let hhmm = self.schedule_exact_time.as_deref().unwrap_or("00:00");
                time::next_exact_time_fire(hhmm, tz, now)
            }
        }
    }

    /// `start_deadline - next_expected_start = start_grace_period` is a
    /// testable invariant regardless of timezone (spec.md §8 property 7) —
    /// deadlines are always pure UTC duration arithmetic.
    pub fn start_deadline_from(&self, next_expected_start: DateTime<Utc>) -> DateTime<Utc> {
        time::deadline_after(next_expected_start, self.start_grace_period_seconds as i64)
    }

    pub fn end_deadline_from(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        time::deadline_after(start, self.end_timeout_seconds as i64)
    }

    /// Handles a start-ping against the state machine table in spec.md §4.8.
    #[allow(clippy::too_many_arguments)]
    pub async fn process_start_ping(
        pool: &PgPool,
        monitor: &Self,
        now: DateTime<Utc>,
        source_ip: Option<String>,
        payload: Option<serde_json::Value>,
    ) -> Result<StartPingOutcome> {
        if monitor.status == ProcessMonitorStatus::Paused {
            return Ok(StartPingOutcome::RejectedPaused);
        }

        if monitor.status == ProcessMonitorStatus::Running {
            match monitor.concurrency_policy {
                ConcurrencyPolicy::Skip => return Ok(StartPingOutcome::RejectedRunning),
                ConcurrencyPolicy::Replace => {
                    if let Some(old_run_id) = monitor.current_run_id {
                        ProcessMonitorEvent::record(
                            pool,
                            monitor.id,
                            old_run_id,
                            MonitorEventKind::Timeout,
                            now,
                            None,
                            None,
                            None,
                        )
                        .await?;
                    }
                }
            }
        }

        let recovered = matches!(
            monitor.status,
            ProcessMonitorStatus::MissedStart | ProcessMonitorStatus::MissedEnd
        );

        let run_id = Uuid::new_v4();
        let end_deadline = monitor.end_deadline_from(now);
        Self::mark_running(pool, monitor.id, now, run_id, end_deadline).await?;
        ProcessMonitorEvent::record(pool, monitor.id, run_id, MonitorEventKind::Start, now, None, payload, source_ip).await?;

        Ok(StartPingOutcome::Started { run_id, recovered })
    }

    /// Handles an end-ping: `running -> waiting_start`, computing the next
    /// expected start and its deadline from `now` (spec.md §4.8).
    pub async fn process_end_ping(
        pool: &PgPool,
        monitor: &Self,
        now: DateTime<Utc>,
        duration_override_ms: Option<i64>,
        payload: Option<serde_json::Value>,
    ) -> Result<EndPingOutcome> {
        if monitor.status != ProcessMonitorStatus::Running {
            return Ok(EndPingOutcome::RejectedNotRunning);
        }
        let Some(run_id) = monitor.current_run_id else {
            return Ok(EndPingOutcome::RejectedNotRunning);
        };

        let duration_ms = duration_override_ms.unwrap_or_else(|| {
            monitor
                .last_start_at
                .map(|start| (now - start).num_milliseconds())
                .unwrap_or(0)
        });

        ProcessMonitorEvent::record(
            pool,
            monitor.id,
            run_id,
            MonitorEventKind::End,
            now,
            Some(duration_ms),
            payload,
            None,
        )
        .await?;

        let next_expected_start = monitor.next_expected_start(now).ok();
        let start_deadline = next_expected_start.map(|next| monitor.start_deadline_from(next));
        Self::mark_completed(pool, monitor.id, next_expected_start, start_deadline).await?;

        Ok(EndPingOutcome::Ended { run_id, duration_ms })
    }

    pub async fn find_by_start_token(pool: &PgPool, token: &str) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM process_monitors WHERE start_token = $1")
            .bind(token)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    pub async fn find_by_end_token(pool: &PgPool, token: &str) -> Result<Option<Self>> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM process_monitors WHERE end_token = $1")
            .bind(token)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mark_running(
        pool: &PgPool,
        id: ProcessMonitorId,
        now: DateTime<Utc>,
        run_id: Uuid,
        end_deadline: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE process_monitors
            SET status = 'running', current_run_id = $1, last_start_at = $2, end_deadline = $3, updated_at = now()
            WHERE id = $4
            "#,
        )
        .bind(run_id)
        .bind(now)
        .bind(end_deadline)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_completed(
        pool: &PgPool,
        id: ProcessMonitorId,
        next_expected_start: Option<DateTime<Utc>>,
        start_deadline: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE process_monitors
            SET status = 'waiting_start', current_run_id = NULL, next_expected_start = $1,
                start_deadline = $2, consecutive_failures = 0, updated_at = now()
            WHERE id = $3
            "#,
        )
        .bind(next_expected_start)
        .bind(start_deadline)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_missed_start(
        pool: &PgPool,
        id: ProcessMonitorId,
        next_expected_start: Option<DateTime<Utc>>,
        start_deadline: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE process_monitors
            SET status = 'missed_start', next_expected_start = $1, start_deadline = $2,
                consecutive_failures = consecutive_failures + 1, updated_at = now()
            WHERE id = $3
            "#,
        )
        .bind(next_expected_start)
        .bind(start_deadline)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_missed_end(
        pool: &PgPool,
        id: ProcessMonitorId,
        next_expected_start: Option<DateTime<Utc>>,
        start_deadline: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE process_monitors
            SET status = 'missed_end', current_run_id = NULL, next_expected_start = $1, start_deadline = $2,
                consecutive_failures = consecutive_failures + 1, updated_at = now()
            WHERE id = $3
            "#,
        )
        .bind(next_expected_start)
        .bind(start_deadline)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_waiting_for_start(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM process_monitors
            WHERE status = 'waiting_start' AND start_deadline IS NOT NULL AND start_deadline < $1
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn find_waiting_for_end(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM process_monitors
            WHERE status = 'running' AND end_deadline IS NOT NULL AND end_deadline < $1
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "monitor_event_kind", rename_all = "lowercase")]
pub enum MonitorEventKind {
    Start,
    End,
    Missed,
    Timeout,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessMonitorEvent {
    pub id: Uuid,
    pub monitor_id: ProcessMonitorId,
    pub run_id: Uuid,
    pub kind: MonitorEventKind,
    pub occurred_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub payload: Option<serde_json::Value>,
    pub source_ip: Option<String>,
}

pub const MAX_MONITOR_EVENTS: i64 = 100;

impl ProcessMonitorEvent {
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        pool: &PgPool,
        monitor_id: ProcessMonitorId,
        run_id: Uuid,
        kind: MonitorEventKind,
        now: DateTime<Utc>,
        duration_ms: Option<i64>,
        payload: Option<serde_json::Value>,
        source_ip: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO process_monitor_events
                (id, monitor_id, run_id, kind, occurred_at, duration_ms, payload, source_ip)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(monitor_id)
        .bind(run_id)
        .bind(kind)
        .bind(now)
        .bind(duration_ms)
        .bind(payload)
        .bind(source_ip)
        .execute(pool)
        .await?;

        // Events older than the most recent MAX_MONITOR_EVENTS are discarded
        // (spec.md §4.8).
        sqlx::query(
            r#"
            DELETE FROM process_monitor_events
            WHERE monitor_id = $1
              AND id NOT IN (
                  SELECT id FROM process_monitor_events
                  WHERE monitor_id = $1
                  ORDER BY occurred_at DESC
                  LIMIT $2
              )
            "#,
        )
        .bind(monitor_id)
        .bind(MAX_MONITOR_EVENTS)
        .execute(pool)
        .await?;
        Ok(())
    }
}
