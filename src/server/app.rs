//! Application state and router assembly.

use std::sync::Arc;

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::kernel::executor::Executor;
use crate::server::routes::{
    health_handler, heartbeat_ping_handler, process_monitor_end_handler, process_monitor_start_handler,
    worker_poll_handler,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub executor: Arc<Executor>,
}

pub fn build_app(pool: PgPool, executor: Arc<Executor>) -> Router {
    let state = AppState { pool, executor };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::POST]);

    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/ping/{heartbeat_token}",
            get(heartbeat_ping_handler).head(heartbeat_ping_handler).post(heartbeat_ping_handler),
        )
        .route(
            "/ping/start/{start_token}",
            get(process_monitor_start_handler)
                .head(process_monitor_start_handler)
                .post(process_monitor_start_handler),
        )
        .route(
            "/ping/end/{end_token}",
            get(process_monitor_end_handler).head(process_monitor_end_handler).post(process_monitor_end_handler),
        )
        .route("/workers/{worker_id}/poll", get(worker_poll_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
