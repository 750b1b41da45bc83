//! Periodic sweep loops (spec.md §4.4 table): late/dead heartbeat and
//! missed-start/end process-monitor detection, `next_run_at` back-fill,
//! overlap queue drain, stale-instance cleanup, and execution retention GC.
//! `SubscriptionSweep` is an external collaborator (spec.md §1) and isn't
//! implemented here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{error, warn};

use crate::common::error::Result;
use crate::common::time;
use crate::config::Config;
use crate::domains::cron_tasks::model::CronTask;
use crate::domains::executions::model::Execution;
use crate::domains::heartbeats::model::{Heartbeat, HeartbeatStatus};
use crate::domains::overlap_queue::model::TaskKind;
use crate::domains::process_monitors::model::{MonitorEventKind, ProcessMonitor, ProcessMonitorEvent};
use crate::kernel::executor::{Executor, Job};
use crate::kernel::notifications::NotificationEvent;
use crate::kernel::overlap;

const SWEEP_BATCH_LIMIT: i64 = 500;

pub struct Sweeps {
    pool: PgPool,
    executor: Arc<Executor>,
    config: Config,
}

impl Sweeps {
    pub fn new(pool: PgPool, executor: Arc<Executor>, config: Config) -> Arc<Self> {
        Arc::new(Self { pool, executor, config })
    }

    pub fn spawn_loops(self: &Arc<Self>) {
        self.spawn_loop("heartbeat_sweep", Duration::from_secs(30), Self::heartbeat_sweep);
        self.spawn_loop("process_monitor_sweep", Duration::from_secs(30), Self::process_monitor_sweep);
        self.spawn_loop("next_run_recompute", Duration::from_secs(60), Self::next_run_recompute);
        self.spawn_loop("queue_drain", Duration::from_secs(10), Self::queue_drain);
        self.spawn_loop("stale_instance_cleanup", Duration::from_secs(300), Self::stale_instance_cleanup);
        self.spawn_loop(
            "execution_gc",
            Duration::from_secs(3600),
            Self::execution_gc,
        );
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, f: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let sweeps = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = f(Arc::clone(&sweeps)).await {
                    error!(sweep = name, error = %e, "sweep cycle failed, continuing");
                }
            }
        });
    }

    /// HeartbeatSweep (spec.md §4.7): waiting/healthy -> late after
    /// `expected_interval + grace_period` of silence; late -> dead after
    /// `3 * expected_interval`.
    async fn heartbeat_sweep(self: Arc<Self>) -> Result<()> {
        let now = Utc::now();
        for heartbeat in Heartbeat::find_active(&self.pool).await? {
            let Some(last_ping) = heartbeat.last_ping_at else {
                continue;
            };
            let silence = now - last_ping;

            match heartbeat.status {
                HeartbeatStatus::Waiting | HeartbeatStatus::Healthy => {
                    let threshold = chrono::Duration::seconds(
                        (heartbeat.expected_interval_seconds + heartbeat.grace_period_seconds) as i64,
                    );
                    if silence > threshold {
                        Heartbeat::set_status(
                            &self.pool,
                            heartbeat.id,
                            HeartbeatStatus::Late,
                            heartbeat.consecutive_misses + 1,
                        )
                        .await?;
                        self.executor
                            .fan_out(heartbeat.workspace_id, &heartbeat.name, NotificationEvent::Failure)
                            .await;
                    }
                }
                HeartbeatStatus::Late => {
                    let dead_threshold = chrono::Duration::seconds(3 * heartbeat.expected_interval_seconds as i64);
                    if silence > dead_threshold {
                        Heartbeat::set_status(
                            &self.pool,
                            heartbeat.id,
                            HeartbeatStatus::Dead,
                            heartbeat.consecutive_misses + 1,
                        )
                        .await?;
                    }
                }
                HeartbeatStatus::Dead | HeartbeatStatus::Paused => {}
            }
        }
        Ok(())
    }

    /// ProcessMonitorSweep (spec.md §4.8): detect missed starts/ends and
    /// recompute deadlines for the next cycle.
    async fn process_monitor_sweep(self: Arc<Self>) -> Result<()> {
        let now = Utc::now();

        for monitor in ProcessMonitor::find_waiting_for_start(&self.pool, now, SWEEP_BATCH_LIMIT).await? {
            let run_id = monitor.current_run_id.unwrap_or_else(uuid::Uuid::new_v4);
            ProcessMonitorEvent::record(&self.pool, monitor.id, run_id, MonitorEventKind::Missed, now, None, None, None)
                .await?;

            let next_expected_start = monitor.next_expected_start(now).ok();
            let start_deadline = next_expected_start.map(|next| monitor.start_deadline_from(next));
            ProcessMonitor::mark_missed_start(&self.pool, monitor.id, next_expected_start, start_deadline).await?;

            if monitor.notify_on_missed_start {
                self.executor
                    .fan_out(monitor.workspace_id, &monitor.name, NotificationEvent::MissedStart)
                    .await;
            }
        }

        for monitor in ProcessMonitor::find_waiting_for_end(&self.pool, now, SWEEP_BATCH_LIMIT).await? {
            let run_id = monitor.current_run_id.unwrap_or_else(uuid::Uuid::new_v4);
            ProcessMonitorEvent::record(&self.pool, monitor.id, run_id, MonitorEventKind::Timeout, now, None, None, None)
                .await?;

            let next_expected_start = monitor.next_expected_start(now).ok();
            let start_deadline = next_expected_start.map(|next| monitor.start_deadline_from(next));
            ProcessMonitor::mark_missed_end(&self.pool, monitor.id, next_expected_start, start_deadline).await?;

            if monitor.notify_on_missed_end {
                self.executor
                    .fan_out(monitor.workspace_id, &monitor.name, NotificationEvent::MissedEnd)
                    .await;
            }
        }

        Ok(())
    }

    /// NextRunRecompute (spec.md §4.4): back-fill `next_run_at` for active,
    /// unpaused cron tasks where it's null (e.g. freshly created via API).
    async fn next_run_recompute(self: Arc<Self>) -> Result<()> {
        let now = Utc::now();
        for task in CronTask::find_missing_next_run_at(&self.pool, SWEEP_BATCH_LIMIT).await? {
            let next = match time::parse_timezone(&task.timezone).and_then(|tz| time::next_cron_fire(&task.schedule, tz, now)) {
                Ok(next) => next,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "cannot compute next_run_at, leaving null");
                    continue;
                }
            };
            let mut tx = self.pool.begin().await?;
            CronTask::set_next_run_at(&mut tx, task.id, next).await?;
            tx.commit().await?;
        }
        Ok(())
    }

    /// QueueDrain (spec.md §4.4): re-dispatch entries whose entity now has a
    /// free concurrency slot. Complements the pop-on-release in
    /// `kernel::overlap`, covering slots freed by the stale-instance sweep
    /// (which resets `running_instances` directly, bypassing
    /// `release_and_repop`'s decrement). Uses `pop_and_increment_if_capacity`,
    /// not `release_and_repop` — these candidates were never vacated by a
    /// completing job, so there is no prior occupant's slot to decrement.
    async fn queue_drain(self: Arc<Self>) -> Result<()> {
        for kind in [TaskKind::CronTask, TaskKind::DelayedTask, TaskKind::TaskChain] {
            let candidates = capacity_candidates(&self.pool, kind).await?;
            for (task_id, _overlap_policy) in candidates {
                if let Some(entry) = overlap::pop_and_increment_if_capacity(&self.pool, kind, task_id).await? {
                    match kind {
                        TaskKind::CronTask => self.executor.enqueue(Job::Cron {
                            task_id: task_id.into(),
                            retry_attempt: 0,
                        }),
                        TaskKind::DelayedTask => self.executor.enqueue(Job::Delayed {
                            task_id: task_id.into(),
                            retry_attempt: entry.retry_attempt,
                        }),
                        TaskKind::TaskChain => self.executor.enqueue(Job::Chain {
                            chain_id: task_id.into(),
                            initial_variables: entry.initial_variables,
                        }),
                    }
                }
            }
        }
        Ok(())
    }

    /// StaleInstanceCleanup (spec.md §4.3): compensates for executor crashes
    /// that never released their concurrency slot.
    async fn stale_instance_cleanup(self: Arc<Self>) -> Result<()> {
        let now = Utc::now();
        let cleaned = overlap::cleanup_stale_instances(&self.pool, now).await?;
        if cleaned > 0 {
            tracing::info!(cleaned, "reset stale running_instances counters");
        }
        Ok(())
    }

    /// ExecutionGC (spec.md §4.2): deletes Execution rows past each
    /// workspace's retention window. Per-workspace retention overrides are
    /// an external collaborator concern (plan/billing); this sweep applies
    /// the configured default uniformly.
    async fn execution_gc(self: Arc<Self>) -> Result<()> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.execution_retention_default_days);
        let deleted = Execution::delete_older_than(&self.pool, cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, "execution retention GC");
        }
        Ok(())
    }
}

/// Entities that currently have at least one queued entry and spare
/// concurrency capacity to pop it into — without this, `queue_drain` would
/// redundantly re-check every active entity every 10 seconds.
async fn capacity_candidates(
    pool: &PgPool,
    kind: TaskKind,
) -> Result<Vec<(uuid::Uuid, crate::domains::cron_tasks::model::OverlapPolicy)>> {
    let table = match kind {
        TaskKind::CronTask => "cron_tasks",
        TaskKind::DelayedTask => "delayed_tasks",
        TaskKind::TaskChain => "task_chains",
    };
    let sql = format!(
        r#"
        SELECT t.id, t.overlap_policy
        FROM {table} t
        WHERE t.overlap_policy = 'queue'
          AND t.running_instances < t.max_instances
          AND EXISTS (
              SELECT 1 FROM overlap_queue_entries q
              WHERE q.task_kind = $1 AND q.task_id = t.id
          )
        "#
    );
    let rows: Vec<(uuid::Uuid, crate::domains::cron_tasks::model::OverlapPolicy)> =
        sqlx::query_as(&sql).bind(kind).fetch_all(pool).await?;
    Ok(rows)
}
