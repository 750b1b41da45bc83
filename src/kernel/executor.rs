//! Executor worker (C5, spec.md §4.5): consumes jobs handed off by the
//! scheduler, drives the matching probe, records the execution, retries with
//! linear backoff, and triggers notifications. Retries and notifications are
//! separately-enqueued jobs rather than inline awaits, so a worker slot never
//! blocks on them (spec.md §9 design note).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, instrument};

use crate::common::error::Result;
use crate::common::ids::{CronTaskId, DelayedTaskId, TaskChainId, WorkspaceId};
use crate::common::time;
use crate::config::Config;
use crate::domains::chains::model::{ChainStatus, TaskChain};
use crate::domains::cron_tasks::model::{CronTask, Protocol, ProtocolParams};
use crate::domains::delayed_tasks::model::{DelayedTask, DelayedTaskStatus};
use crate::domains::executions::model::{ChainExecution, Execution, ExecutionSource, ExecutionStatus, StepExecution};
use crate::domains::overlap_queue::model::TaskKind;
use crate::kernel::chain_interpreter::{self, ChainFinalStatus, StepOutcome};
use crate::kernel::notifications::{ChannelConfig, NotificationContext, NotificationEvent, Recipient};
use crate::kernel::overlap;
use crate::kernel::probes::{icmp, tcp};
use crate::kernel::probes::http as http_probe;

#[derive(Debug, Clone)]
pub enum Job {
    Cron { task_id: CronTaskId, retry_attempt: i32 },
    Delayed { task_id: DelayedTaskId, retry_attempt: i32 },
    Chain { chain_id: TaskChainId, initial_variables: Option<serde_json::Value> },
}

/// Callers obtain notification recipients from workspace settings; the
/// concrete lookup is an external collaborator (spec.md §1), so the executor
/// depends on this trait instead of a concrete settings table.
#[async_trait::async_trait]
pub trait NotificationDirectory: Send + Sync {
    async fn recipients_for(&self, workspace_id: WorkspaceId, event: NotificationEvent) -> Vec<Recipient>;
    fn webhook_secrets(&self) -> HashMap<String, String>;
}

pub struct Executor {
    pool: PgPool,
    http: reqwest::Client,
    config: Config,
    sender: mpsc::UnboundedSender<Job>,
    directory: Arc<dyn NotificationDirectory>,
    channels: ChannelConfigOwned,
}

struct ChannelConfigOwned {
    telegram_bot_token: Option<String>,
    email_api_url: Option<String>,
    webhook_timeout: Duration,
}

impl Executor {
    pub fn new(
        pool: PgPool,
        http: reqwest::Client,
        config: Config,
        directory: Arc<dyn NotificationDirectory>,
        telegram_bot_token: Option<String>,
        email_api_url: Option<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Job>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let webhook_timeout = config.notification_webhook_timeout;
        let executor = Arc::new(Self {
            pool,
            http,
            config,
            sender,
            directory,
            channels: ChannelConfigOwned {
                telegram_bot_token,
                email_api_url,
                webhook_timeout,
            },
        });
        (executor, receiver)
    }

    pub fn enqueue(&self, job: Job) {
        let _ = self.sender.send(job);
    }

    /// Defers a retry by `delay` without blocking a worker slot on the sleep
    /// (spec.md §4.5 step 10, §9 design note).
    pub fn enqueue_after(self: &Arc<Self>, job: Job, delay: Duration) {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            executor.enqueue(job);
        });
    }

    /// Spawns `pool_size` workers pulling from the shared queue
    /// (spec.md §6 "executor.pool_size").
    pub fn spawn_worker_pool(self: Arc<Self>, receiver: mpsc::UnboundedReceiver<Job>, pool_size: usize) {
        let receiver = Arc::new(Mutex::new(receiver));
        for worker_index in 0..pool_size {
            let executor = Arc::clone(&self);
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = receiver.lock().await;
                        guard.recv().await
                    };
                    match job {
                        Some(job) => executor.process_job(job).await,
                        None => {
                            info!(worker_index, "executor channel closed, worker exiting");
                            break;
                        }
                    }
                }
            });
        }
    }

    #[instrument(skip(self))]
    async fn process_job(&self, job: Job) {
        let result = match job {
            Job::Cron { task_id, retry_attempt } => self.run_cron(task_id, retry_attempt).await,
            Job::Delayed { task_id, retry_attempt } => self.run_delayed(task_id, retry_attempt).await,
            Job::Chain { chain_id, initial_variables } => self.run_chain(chain_id, initial_variables).await,
        };
        if let Err(e) = result {
            error!(error = %e, "job processing failed");
        }
    }

    async fn run_cron(&self, task_id: CronTaskId, retry_attempt: i32) -> Result<()> {
        let Some(task) = CronTask::find_by_id(&self.pool, task_id).await? else {
            return Ok(());
        };
        if !task.is_active || task.is_paused {
            overlap::release_and_repop(&self.pool, TaskKind::CronTask, task_id.into(), task.overlap_policy).await?;
            return Ok(());
        }

        let started_at = Utc::now();
        let execution_id = Execution::create(
            &self.pool,
            task.workspace_id,
            ExecutionSource::CronTask,
            Some(task_id),
            None,
            started_at,
            retry_attempt,
        )
        .await?;

        let params = task.protocol_params().unwrap_or(ProtocolParams::Tcp {
            host: String::new(),
            port: 0,
        });
        let (success, duration_ms, response_code, response_body, error_message) =
            self.drive_probe(task.protocol, &params, task.timeout_seconds).await;

        let finished_at = Utc::now();
        Execution::complete(
            &self.pool,
            execution_id,
            finished_at,
            if success { ExecutionStatus::Success } else { ExecutionStatus::Failed },
            response_code,
            response_body,
            error_message,
            duration_ms,
        )
        .await?;

        let previous_status = task.last_status.clone();
        let consecutive_failures = if success { 0 } else { task.consecutive_failures + 1 };
        let next_run_at = time::next_cron_fire(&task.schedule, time::parse_timezone(&task.timezone)?, finished_at)?;
        let mut tx = self.pool.begin().await?;
        CronTask::set_next_run_at(&mut tx, task_id, next_run_at).await?;
        tx.commit().await?;
        CronTask::record_run_result(
            &self.pool,
            task_id,
            finished_at,
            if success { "success" } else { "failed" },
            consecutive_failures,
        )
        .await?;

        overlap::release_and_repop(&self.pool, TaskKind::CronTask, task_id.into(), task.overlap_policy).await?;

        self.notify_outcome(task.workspace_id, &task.name, success, retry_attempt, task.retry_count, previous_status.as_deref())
            .await;

        if !success && retry_attempt < task.retry_count {
            self.enqueue_retry_cron(task_id, retry_attempt + 1, task.retry_delay_seconds);
        }

        Ok(())
    }

    async fn run_delayed(&self, task_id: DelayedTaskId, retry_attempt: i32) -> Result<()> {
        let Some(task) = DelayedTask::find_by_id(&self.pool, task_id).await? else {
            return Ok(());
        };

        if retry_attempt == 0 {
            if task.status != DelayedTaskStatus::Pending {
                return Ok(());
            }
            let mut tx = self.pool.begin().await?;
            DelayedTask::mark_running(&mut tx, task_id).await?;
            tx.commit().await?;
        } else {
            DelayedTask::bump_retry_attempt(&self.pool, task_id, retry_attempt).await?;
        }

        let started_at = Utc::now();
        let execution_id = Execution::create(
            &self.pool,
            task.workspace_id,
            ExecutionSource::DelayedTask,
            None,
            Some(task_id),
            started_at,
            retry_attempt,
        )
        .await?;

        let params = task.protocol_params().unwrap_or(ProtocolParams::Tcp {
            host: String::new(),
            port: 0,
        });
        let (success, duration_ms, response_code, response_body, error_message) =
            self.drive_probe(task.protocol, &params, task.timeout_seconds).await;

        let finished_at = Utc::now();
        Execution::complete(
            &self.pool,
            execution_id,
            finished_at,
            if success { ExecutionStatus::Success } else { ExecutionStatus::Failed },
            response_code,
            response_body,
            error_message,
            duration_ms,
        )
        .await?;

        let is_final_attempt = success || retry_attempt >= task.retry_count;

        if success {
            DelayedTask::mark_terminal(&self.pool, task_id, DelayedTaskStatus::Success).await?;
        } else if is_final_attempt {
            DelayedTask::mark_terminal(&self.pool, task_id, DelayedTaskStatus::Failed).await?;
        }

        // The overlap slot stays held across retries of the same invocation,
        // exactly like a CronTask retry (see `bump_retry_attempt`) — only
        // released once this invocation has truly finished.
        if is_final_attempt {
            overlap::release_and_repop(&self.pool, TaskKind::DelayedTask, task_id.into(), task.overlap_policy).await?;
        }

        self.notify_outcome(task.workspace_id, &task.name, success, retry_attempt, task.retry_count, None)
            .await;

        if !success && !is_final_attempt {
            self.enqueue_retry_delayed(task_id, retry_attempt + 1, task.retry_delay_seconds);
        }

        Ok(())
    }

    async fn run_chain(&self, chain_id: TaskChainId, initial_variables: Option<serde_json::Value>) -> Result<()> {
        let Some(chain) = TaskChain::find_by_id(&self.pool, chain_id).await? else {
            return Ok(());
        };
        if !chain.is_active || chain.is_paused {
            overlap::release_and_repop(&self.pool, TaskKind::TaskChain, chain_id.into(), chain.overlap_policy).await?;
            return Ok(());
        }

        let steps = TaskChain::steps(&self.pool, chain_id).await?;
        let started_at = Utc::now();
        let chain_execution_id = ChainExecution::create(&self.pool, chain.workspace_id, chain_id, started_at).await?;

        let mut outcome = chain_interpreter::run_chain(
            &self.http,
            &steps,
            chain.stop_on_failure,
            self.config.probe_http_max_response_bytes,
        )
        .await;

        if let Some(initial) = initial_variables {
            if let Some(map) = initial.as_object() {
                for (k, v) in map {
                    outcome
                        .context
                        .variables
                        .entry(k.clone())
                        .or_insert_with(|| match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        });
                }
            }
        }

        let mut step_order = 0i32;
        for (step, result) in &outcome.step_results {
            let started = started_at;
            let finished = Utc::now();
            let status = match result.outcome {
                StepOutcome::Success => ExecutionStatus::Success,
                StepOutcome::Failed => ExecutionStatus::Failed,
                StepOutcome::Skipped => ExecutionStatus::Skipped,
            };
            StepExecution::record(
                &self.pool,
                chain_execution_id,
                step.id,
                step_order,
                started,
                finished,
                status,
                result.attempt,
                result.response_code,
                result.response_body.clone(),
                result.error.clone(),
                result.condition_matched,
            )
            .await?;
            step_order += 1;
        }

        let final_status = match outcome.final_status {
            ChainFinalStatus::Success => ChainStatus::Success,
            ChainFinalStatus::Failed => ChainStatus::Failed,
            ChainFinalStatus::Partial => ChainStatus::Partial,
        };
        let variables_json = serde_json::to_value(&outcome.context.variables).unwrap_or_default();
        ChainExecution::complete(&self.pool, chain_execution_id, Utc::now(), final_status, &variables_json).await?;

        let next_run_at = match chain.schedule.as_deref() {
            Some(schedule) => Some(time::next_cron_fire(schedule, time::parse_timezone(&chain.timezone)?, Utc::now())?),
            None => None,
        };
        TaskChain::update_last_run(&self.pool, chain_id, next_run_at).await?;

        overlap::release_and_repop(&self.pool, TaskKind::TaskChain, chain_id.into(), chain.overlap_policy).await?;

        let notify = match final_status {
            ChainStatus::Success => chain.notify_on_success,
            ChainStatus::Failed => chain.notify_on_failure,
            ChainStatus::Partial => chain.notify_on_partial,
        };
        if notify {
            let event = match final_status {
                ChainStatus::Success => NotificationEvent::Success,
                _ => NotificationEvent::Failure,
            };
            self.fan_out(chain.workspace_id, &chain.name, event).await;
        }

        Ok(())
    }

    async fn drive_probe(
        &self,
        protocol: Protocol,
        params: &ProtocolParams,
        timeout_seconds: i32,
    ) -> (bool, i64, Option<i32>, Option<String>, Option<String>) {
        let timeout = Duration::from_secs(timeout_seconds as u64);
        match (protocol, params) {
            (Protocol::Http, ProtocolParams::Http { url, method, headers, body }) => {
                let result = http_probe::run(
                    &self.http,
                    url,
                    *method,
                    headers,
                    body.as_deref(),
                    timeout,
                    self.config.probe_http_max_response_bytes,
                    self.config.ssrf_blocked_cidrs_override.as_deref(),
                )
                .await;
                (
                    result.success,
                    result.duration_ms,
                    result.status_code.map(|c| c as i32),
                    result.response_body,
                    result.error,
                )
            }
            (Protocol::Icmp, ProtocolParams::Icmp { host, count }) => {
                let result = icmp::run(host, (*count).min(self.config.probe_icmp_max_count), timeout).await;
                (
                    result.success,
                    result.duration_ms,
                    None,
                    Some(format!("{:?}", result.stats)),
                    result.error,
                )
            }
            (Protocol::Tcp, ProtocolParams::Tcp { host, port }) => {
                let result = tcp::run(host, *port, timeout).await;
                (result.success, result.duration_ms, None, None, result.error)
            }
            _ => (false, 0, None, None, Some("protocol/parameter mismatch".to_string())),
        }
    }

    /// A failed cron attempt's retry is a same-tick re-drive, not a
    /// reschedule — `next_run_at` already advanced in `run_cron` regardless
    /// of outcome (spec.md §9 design note on separately-enqueued retries).
    fn enqueue_retry_cron(&self, task_id: CronTaskId, retry_attempt: i32, delay_seconds: i32) {
        let sender = self.sender.clone();
        let delay = Duration::from_secs(delay_seconds.max(0) as u64);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(Job::Cron { task_id, retry_attempt });
        });
    }

    /// Mirrors `enqueue_retry_cron`: a failed delayed-task attempt's retry is
    /// a direct channel resend, not a re-entry into `lock_one_due`'s
    /// due-selection, so the overlap slot this invocation already holds
    /// carries over to the retry instead of being released and re-claimed.
    fn enqueue_retry_delayed(&self, task_id: DelayedTaskId, retry_attempt: i32, delay_seconds: i32) {
        let sender = self.sender.clone();
        let delay = Duration::from_secs(delay_seconds.max(0) as u64);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(Job::Delayed { task_id, retry_attempt });
        });
    }

    async fn notify_outcome(
        &self,
        workspace_id: WorkspaceId,
        entity_name: &str,
        success: bool,
        retry_attempt: i32,
        retry_count: i32,
        previous_status: Option<&str>,
    ) {
        let is_final_attempt = success || retry_attempt >= retry_count;
        if !is_final_attempt {
            return;
        }

        let recovered = success && previous_status == Some("failed");
        let event = if recovered {
            NotificationEvent::Recovery
        } else if success {
            NotificationEvent::Success
        } else {
            NotificationEvent::Failure
        };

        self.fan_out(workspace_id, entity_name, event).await;
    }

    /// Exposed to `kernel::sweeps` as well, since heartbeat/process-monitor
    /// transitions fire the same fan-out as executor-driven outcomes.
    pub(crate) async fn fan_out(&self, workspace_id: WorkspaceId, entity_name: &str, event: NotificationEvent) {
        let recipients = self.directory.recipients_for(workspace_id, event).await;
        if recipients.is_empty() {
            return;
        }
        let ctx = NotificationContext {
            entity_name: entity_name.to_string(),
            details: serde_json::json!({ "workspace_id": workspace_id.to_string() }),
        };
        let channels = ChannelConfig {
            telegram_bot_token: self.channels.telegram_bot_token.as_deref(),
            email_api_url: self.channels.email_api_url.as_deref(),
            webhook_timeout: self.channels.webhook_timeout,
        };
        crate::kernel::notifications::dispatch(
            &self.http,
            &recipients,
            event,
            &ctx,
            &channels,
            &self.directory.webhook_secrets(),
            Utc::now().timestamp(),
        )
        .await;
    }
}
