//! Scheduler / dispatcher (C4, spec.md §4.4): the due-selection loops. Each
//! cycle processes due rows one at a time under `SELECT ... FOR UPDATE SKIP
//! LOCKED`, advancing `next_run_at`/`execute_at` and applying the overlap
//! decision *inside* the same transaction as the row lock — this ordering is
//! the safety property that lets multiple scheduler processes run at once
//! without double-dispatching a tick (spec.md §4.4 "Due-selection protocol").

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{error, warn};

use crate::common::error::Result;
use crate::common::time;
use crate::config::Config;
use crate::domains::chains::model::TaskChain;
use crate::domains::cron_tasks::model::CronTask;
use crate::domains::delayed_tasks::model::DelayedTask;
use crate::domains::overlap_queue::model::TaskKind;
use crate::kernel::executor::{Executor, Job};
use crate::kernel::overlap::{self, OverlapDecision};
use crate::kernel::worker_protocol::{worker_task_info_for_cron, worker_task_info_for_delayed, WorkerQueue};

const CRON_CYCLE_CAP: usize = 100;
const DELAYED_CYCLE_CAP: usize = 100;
const CHAIN_CYCLE_CAP: usize = 50;

pub struct Scheduler {
    pool: PgPool,
    executor: Arc<Executor>,
    config: Config,
}

impl Scheduler {
    pub fn new(pool: PgPool, executor: Arc<Executor>, config: Config) -> Arc<Self> {
        Arc::new(Self { pool, executor, config })
    }

    /// Spawns the CronPoll/DelayedPoll/ChainPoll loops (the remaining loops
    /// in spec.md §4.4's table live in `kernel::sweeps`). Each loop runs
    /// until the process exits; a shutdown signal is layered on by the
    /// binary entrypoint.
    pub fn spawn_loops(self: &Arc<Self>) {
        let cron = Arc::clone(self);
        tokio::spawn(async move { cron.run_loop("cron", cron.config.poll_interval_cron, Self::drain_cron_due).await });

        let delayed = Arc::clone(self);
        tokio::spawn(async move {
            delayed
                .run_loop("delayed", delayed.config.poll_interval_delayed, Self::drain_delayed_due)
                .await
        });

        let chain = Arc::clone(self);
        tokio::spawn(async move { chain.run_loop("chain", chain.config.poll_interval_chain, Self::drain_chain_due).await });
    }

    async fn run_loop<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, f: F)
    where
        F: Fn(Arc<Self>) -> Fut,
        Fut: std::future::Future<Output = Result<usize>>,
    {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match f(Arc::clone(self)).await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(loop_name = name, dispatched = n, "drained due rows"),
                Err(e) => error!(loop_name = name, error = %e, "due-selection cycle failed, continuing"),
            }
        }
    }

    async fn drain_cron_due(self: Arc<Self>) -> Result<usize> {
        let mut dispatched = 0;
        for _ in 0..CRON_CYCLE_CAP {
            let now = Utc::now();
            let mut tx = self.pool.begin().await?;
            let Some(task) = CronTask::lock_one_due(&mut tx, now).await? else {
                tx.commit().await?;
                break;
            };

            let next_run_at = match time::parse_timezone(&task.timezone)
                .and_then(|tz| time::next_cron_fire(&task.schedule, tz, now))
            {
                Ok(next) => next,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "failed to compute next fire time, skipping this tick");
                    tx.commit().await?;
                    continue;
                }
            };
            CronTask::set_next_run_at(&mut tx, task.id, next_run_at).await?;

            let decision = overlap::decide_and_apply(
                &mut tx,
                task.workspace_id,
                TaskKind::CronTask,
                task.id.into(),
                task.overlap_policy,
                task.running_instances,
                task.max_instances,
                task.max_queue_size,
                now,
                None,
            )
            .await?;

            if decision == OverlapDecision::Proceed {
                let pushed_to_worker = match (task.worker_id, extract_http(&task.protocol_params())) {
                    (Some(worker_id), Ok(ProtocolParamsHttp { url, method, headers, body })) => {
                        let info = worker_task_info_for_cron(
                            task.id,
                            task.workspace_id,
                            &task.name,
                            url,
                            method,
                            headers,
                            body,
                            task.timeout_seconds,
                            task.retry_count,
                            task.retry_delay_seconds,
                        );
                        WorkerQueue::push_tx(&mut tx, worker_id, &info).await?;
                        true
                    }
                    (Some(_), Err(())) => {
                        warn!(
                            task_id = %task.id,
                            "cron task has worker_id but a non-http protocol; the external worker protocol only \
                             carries http tasks, falling back to the local executor"
                        );
                        false
                    }
                    (None, _) => false,
                };
                if !pushed_to_worker {
                    self.executor.enqueue(Job::Cron { task_id: task.id, retry_attempt: 0 });
                }
            }

            tx.commit().await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn drain_delayed_due(self: Arc<Self>) -> Result<usize> {
        let mut dispatched = 0;
        for _ in 0..DELAYED_CYCLE_CAP {
            let now = Utc::now();
            let mut tx = self.pool.begin().await?;
            let Some(task) = DelayedTask::lock_one_due(&mut tx, now).await? else {
                tx.commit().await?;
                break;
            };

            let decision = overlap::decide_and_apply(
                &mut tx,
                task.workspace_id,
                TaskKind::DelayedTask,
                task.id.into(),
                task.overlap_policy,
                task.running_instances,
                task.max_instances,
                task.max_queue_size,
                now,
                None,
            )
            .await?;

            if decision == OverlapDecision::Proceed {
                let pushed_to_worker = match (task.worker_id, extract_http(&task.protocol_params())) {
                    (Some(worker_id), Ok(ProtocolParamsHttp { url, method, headers, body })) => {
                        let info = worker_task_info_for_delayed(
                            task.id,
                            task.workspace_id,
                            &task.name,
                            url,
                            method,
                            headers,
                            body,
                            task.timeout_seconds,
                            task.retry_count,
                            task.retry_delay_seconds,
                        );
                        WorkerQueue::push_tx(&mut tx, worker_id, &info).await?;
                        true
                    }
                    (Some(_), Err(())) => {
                        warn!(
                            task_id = %task.id,
                            "delayed task has worker_id but a non-http protocol; the external worker protocol only \
                             carries http tasks, falling back to the local executor"
                        );
                        false
                    }
                    (None, _) => false,
                };
                if !pushed_to_worker {
                    self.executor.enqueue(Job::Delayed {
                        task_id: task.id,
                        retry_attempt: task.retry_attempt,
                    });
                }
            }

            tx.commit().await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn drain_chain_due(self: Arc<Self>) -> Result<usize> {
        let mut dispatched = 0;
        for _ in 0..CHAIN_CYCLE_CAP {
            let now = Utc::now();
            let mut tx = self.pool.begin().await?;
            let Some(chain) = TaskChain::lock_one_due(&mut tx, now).await? else {
                tx.commit().await?;
                break;
            };

            let next_run_at = match chain.schedule.as_deref() {
                Some(schedule) => match time::parse_timezone(&chain.timezone).and_then(|tz| time::next_cron_fire(schedule, tz, now)) {
                    Ok(next) => Some(next),
                    Err(e) => {
                        warn!(chain_id = %chain.id, error = %e, "failed to compute next chain fire time, skipping this tick");
                        tx.commit().await?;
                        continue;
                    }
                },
                None => None,
            };
            TaskChain::set_next_run_at(&mut tx, chain.id, next_run_at).await?;

            let decision = overlap::decide_and_apply(
                &mut tx,
                chain.workspace_id,
                TaskKind::TaskChain,
                chain.id.into(),
                chain.overlap_policy,
                chain.running_instances,
                chain.max_instances,
                chain.max_queue_size,
                now,
                None,
            )
            .await?;

            if decision == OverlapDecision::Proceed {
                self.executor.enqueue(Job::Chain {
                    chain_id: chain.id,
                    initial_variables: None,
                });
            }

            tx.commit().await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }
}

struct ProtocolParamsHttp {
    url: String,
    method: crate::domains::cron_tasks::model::HttpMethod,
    headers: std::collections::HashMap<String, String>,
    body: Option<String>,
}

fn extract_http(
    params: &serde_json::Result<crate::domains::cron_tasks::model::ProtocolParams>,
) -> std::result::Result<ProtocolParamsHttp, ()> {
    use crate::domains::cron_tasks::model::ProtocolParams;
    match params {
        Ok(ProtocolParams::Http { url, method, headers, body }) => Ok(ProtocolParamsHttp {
            url: url.clone(),
            method: *method,
            headers: headers.clone(),
            body: body.clone(),
        }),
        _ => Err(()),
    }
}
