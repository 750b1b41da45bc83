//! Overlap controller (C3, spec.md §4.3): allow/skip/queue concurrency
//! policies, atomic increment/decrement of `running_instances`, FIFO queue
//! pop-on-release.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::common::error::Result;
use crate::common::ids::WorkspaceId;
use crate::domains::cron_tasks::model::OverlapPolicy;
use crate::domains::overlap_queue::model::{OverlapQueueEntry, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapDecision {
    Proceed,
    Queued { position: i64 },
    Skipped,
    QueueFull,
}

fn table_for(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::CronTask => "cron_tasks",
        TaskKind::DelayedTask => "delayed_tasks",
        TaskKind::TaskChain => "task_chains",
    }
}

async fn increment(tx: &mut Transaction<'_, Postgres>, kind: TaskKind, task_id: Uuid) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET running_instances = running_instances + 1, updated_at = now() WHERE id = $1",
        table_for(kind)
    );
    sqlx::query(&sql).bind(task_id).execute(&mut **tx).await?;
    Ok(())
}

async fn decrement(tx: &mut Transaction<'_, Postgres>, kind: TaskKind, task_id: Uuid) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET running_instances = GREATEST(running_instances - 1, 0), updated_at = now() WHERE id = $1",
        table_for(kind)
    );
    sqlx::query(&sql).bind(task_id).execute(&mut **tx).await?;
    Ok(())
}

async fn queue_depth(tx: &mut Transaction<'_, Postgres>, kind: TaskKind, task_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM overlap_queue_entries WHERE task_kind = $1 AND task_id = $2",
    )
    .bind(kind)
    .bind(task_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(count)
}

/// Applies the entity's overlap policy against its currently-locked row
/// (the caller holds the row lock from the due-selection `lock_one_due`
/// query, so `running_instances`/`max_instances` passed in are consistent).
/// Mutates `running_instances` / the queue table as a side effect, within the
/// same transaction as the due-selection advance — spec.md §4.4 step 4.
#[allow(clippy::too_many_arguments)]
pub async fn decide_and_apply(
    tx: &mut Transaction<'_, Postgres>,
    workspace_id: WorkspaceId,
    kind: TaskKind,
    task_id: Uuid,
    overlap_policy: OverlapPolicy,
    running_instances: i32,
    max_instances: i32,
    max_queue_size: i32,
    now: DateTime<Utc>,
    initial_variables: Option<serde_json::Value>,
) -> Result<OverlapDecision> {
    match overlap_policy {
        OverlapPolicy::Allow => {
            increment(tx, kind, task_id).await?;
            Ok(OverlapDecision::Proceed)
        }
        OverlapPolicy::Skip => {
            if running_instances >= max_instances {
                Ok(OverlapDecision::Skipped)
            } else {
                increment(tx, kind, task_id).await?;
                Ok(OverlapDecision::Proceed)
            }
        }
        OverlapPolicy::Queue => {
            if running_instances < max_instances {
                increment(tx, kind, task_id).await?;
                Ok(OverlapDecision::Proceed)
            } else {
                let depth = queue_depth(tx, kind, task_id).await?;
                if depth < max_queue_size as i64 {
                    OverlapQueueEntry::push(tx, workspace_id, kind, task_id, now, initial_variables).await?;
                    Ok(OverlapDecision::Queued { position: depth + 1 })
                } else {
                    Ok(OverlapDecision::QueueFull)
                }
            }
        }
    }
}

/// Release a concurrency slot on job completion. If the policy is `queue`
/// and an entry is waiting, it's atomically popped and the slot re-taken on
/// its behalf — the caller must then dispatch the returned entry.
pub async fn release_and_repop(
    pool: &PgPool,
    kind: TaskKind,
    task_id: Uuid,
    overlap_policy: OverlapPolicy,
) -> Result<Option<OverlapQueueEntry>> {
    let mut tx = pool.begin().await?;
    decrement(&mut tx, kind, task_id).await?;

    let popped = if overlap_policy == OverlapPolicy::Queue {
        let entry = OverlapQueueEntry::pop_oldest(&mut tx, kind, task_id).await?;
        if entry.is_some() {
            increment(&mut tx, kind, task_id).await?;
        }
        entry
    } else {
        None
    };

    tx.commit().await?;
    Ok(popped)
}

/// Pops the oldest queued entry for an entity that has a free slot *not*
/// vacated by a completing job (used by `kernel::sweeps::queue_drain` to
/// cover capacity freed by `cleanup_stale_instances`, which resets
/// `running_instances` directly via SQL rather than going through
/// `release_and_repop`). Unlike `release_and_repop`, this never decrements
/// first — it re-checks capacity under a row lock, then pops and increments
/// only if a slot is actually free, so it can't undercount `running_instances`
/// for a candidate whose slot was never occupied by a finishing job.
pub async fn pop_and_increment_if_capacity(
    pool: &PgPool,
    kind: TaskKind,
    task_id: Uuid,
) -> Result<Option<OverlapQueueEntry>> {
    let mut tx = pool.begin().await?;

    let sql = format!("SELECT running_instances, max_instances FROM {} WHERE id = $1 FOR UPDATE", table_for(kind));
    let row: Option<(i32, i32)> = sqlx::query_as(&sql).bind(task_id).fetch_optional(&mut *tx).await?;
    let Some((running_instances, max_instances)) = row else {
        tx.commit().await?;
        return Ok(None);
    };
    if running_instances >= max_instances {
        tx.commit().await?;
        return Ok(None);
    }

    let popped = OverlapQueueEntry::pop_oldest(&mut tx, kind, task_id).await?;
    if popped.is_some() {
        increment(&mut tx, kind, task_id).await?;
    }

    tx.commit().await?;
    Ok(popped)
}

/// Stale-instance cleanup (spec.md §4.3): every 5 minutes, zero
/// `running_instances` on entities whose `last_run_at + execution_timeout`
/// is in the past, compensating for executor crashes that never released.
pub async fn cleanup_stale_instances(pool: &PgPool, now: DateTime<Utc>) -> Result<u64> {
    let cron = crate::domains::cron_tasks::model::CronTask::cleanup_stale_instances(pool, now).await?;
    let delayed = crate::domains::delayed_tasks::model::DelayedTask::cleanup_stale_instances(pool, now).await?;
    Ok(cron + delayed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_match_schema() {
        assert_eq!(table_for(TaskKind::CronTask), "cron_tasks");
        assert_eq!(table_for(TaskKind::DelayedTask), "delayed_tasks");
        assert_eq!(table_for(TaskKind::TaskChain), "task_chains");
    }
}
