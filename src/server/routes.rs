//! The three public, unauthenticated ping endpoints (spec.md §6). Each maps
//! a model-layer ingest outcome onto the exact status codes the spec names;
//! the state machine itself lives on `Heartbeat`/`ProcessMonitor`.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::common::ids::WorkerId;
use crate::domains::heartbeats::{Heartbeat, PingIngestOutcome};
use crate::domains::process_monitors::{EndPingOutcome, ProcessMonitor, StartPingOutcome};
use crate::kernel::notifications::NotificationEvent;
use crate::kernel::worker_protocol::WorkerQueue;
use crate::server::app::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct PingBody {
    pub duration_ms: Option<i64>,
    pub status: Option<String>,
    pub message: Option<String>,
}

/// POST may carry a JSON body; GET/HEAD never do. Axum's `Json` extractor
/// rejects an empty body, so GET/HEAD pings parse as `None` by hand.
async fn optional_json_body(body: axum::body::Bytes) -> Option<PingBody> {
    if body.is_empty() {
        return None;
    }
    serde_json::from_slice(&body).ok()
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn err(status: StatusCode, message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(json!(ErrorBody { error: message.to_string() })))
}

pub async fn heartbeat_ping_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(token): Path<String>,
    body: axum::body::Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let payload = optional_json_body(body).await;

    let Ok(Some(heartbeat)) = Heartbeat::find_by_token(&state.pool, &token).await else {
        return err(StatusCode::NOT_FOUND, "unknown heartbeat token");
    };

    let now = Utc::now();
    let payload_json = payload.as_ref().map(|p| json!(p));
    let outcome = match Heartbeat::ingest_ping(&state.pool, &heartbeat, now, Some(addr.ip().to_string()), payload_json).await {
        Ok(o) => o,
        Err(e) => {
            tracing::error!(error = %e, heartbeat_id = %heartbeat.id, "heartbeat ping ingest failed");
            return err(StatusCode::INTERNAL_SERVER_ERROR, "ingest failed");
        }
    };

    match outcome {
        PingIngestOutcome::Paused => err(StatusCode::BAD_REQUEST, "heartbeat is paused"),
        PingIngestOutcome::Recorded { recovered } => {
            if recovered {
                state.executor.fan_out(heartbeat.workspace_id, &heartbeat.name, NotificationEvent::Recovery).await;
            }
            (StatusCode::OK, Json(json!({ "ok": true, "status": "healthy" })))
        }
    }
}

pub async fn process_monitor_start_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(token): Path<String>,
    body: axum::body::Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let payload = optional_json_body(body).await;

    let Ok(Some(monitor)) = ProcessMonitor::find_by_start_token(&state.pool, &token).await else {
        return err(StatusCode::NOT_FOUND, "unknown start token");
    };

    let now = Utc::now();
    let payload_json = payload.as_ref().map(|p| json!(p));
    let outcome = match ProcessMonitor::process_start_ping(&state.pool, &monitor, now, Some(addr.ip().to_string()), payload_json).await {
        Ok(o) => o,
        Err(e) => {
            tracing::error!(error = %e, monitor_id = %monitor.id, "process monitor start ping failed");
            return err(StatusCode::INTERNAL_SERVER_ERROR, "ingest failed");
        }
    };

    match outcome {
        StartPingOutcome::RejectedPaused => err(StatusCode::BAD_REQUEST, "monitor is paused"),
        StartPingOutcome::RejectedRunning => err(StatusCode::CONFLICT, "already running"),
        StartPingOutcome::Started { run_id, recovered } => {
            if recovered {
                state.executor.fan_out(monitor.workspace_id, &monitor.name, NotificationEvent::Recovery).await;
            }
            (StatusCode::OK, Json(json!({ "ok": true, "status": "running", "run_id": run_id })))
        }
    }
}

pub async fn process_monitor_end_handler(
    State(state): State<AppState>,
    Path(token): Path<String>,
    body: axum::body::Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let payload = optional_json_body(body).await;

    let Ok(Some(monitor)) = ProcessMonitor::find_by_end_token(&state.pool, &token).await else {
        return err(StatusCode::NOT_FOUND, "unknown end token");
    };

    let now = Utc::now();
    let duration_override = payload.as_ref().and_then(|p| p.duration_ms);
    let payload_json = payload.as_ref().map(|p| json!(p));
    let outcome = match ProcessMonitor::process_end_ping(&state.pool, &monitor, now, duration_override, payload_json).await {
        Ok(o) => o,
        Err(e) => {
            tracing::error!(error = %e, monitor_id = %monitor.id, "process monitor end ping failed");
            return err(StatusCode::INTERNAL_SERVER_ERROR, "ingest failed");
        }
    };

    match outcome {
        EndPingOutcome::RejectedNotRunning => err(StatusCode::BAD_REQUEST, "monitor is not running"),
        EndPingOutcome::Ended { run_id, duration_ms } => {
            if monitor.notify_on_success {
                state.executor.fan_out(monitor.workspace_id, &monitor.name, NotificationEvent::Success).await;
            }
            (
                StatusCode::OK,
                Json(json!({ "ok": true, "status": "waiting_start", "run_id": run_id, "duration_ms": duration_ms })),
            )
        }
    }
}

/// External worker long-poll (spec.md §6 "External worker protocol"): a
/// single non-blocking pop rather than a held-open connection, so a worker
/// simply polls this on a short interval. Returns 204 with an empty body
/// when the queue is empty, 200 with a `WorkerTaskInfo` otherwise.
pub async fn worker_poll_handler(State(state): State<AppState>, Path(worker_id): Path<String>) -> (StatusCode, Json<serde_json::Value>) {
    let Ok(worker_uuid) = worker_id.parse::<uuid::Uuid>() else {
        return err(StatusCode::NOT_FOUND, "unknown worker id");
    };
    let worker_id = WorkerId(worker_uuid);

    match WorkerQueue::pop(&state.pool, worker_id).await {
        Ok(Some(task)) => (StatusCode::OK, Json(json!(task))),
        Ok(None) => (StatusCode::NO_CONTENT, Json(json!({}))),
        Err(e) => {
            tracing::error!(error = %e, worker_id = %worker_id, "worker poll failed");
            err(StatusCode::INTERNAL_SERVER_ERROR, "poll failed")
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (StatusCode::OK, Json(HealthResponse { status: "healthy" })),
        Err(e) => {
            tracing::error!(error = %e, "health check database probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(HealthResponse { status: "unhealthy" }))
        }
    }
}
