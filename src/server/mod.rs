//! HTTP server: the public ping endpoints and a health check (spec.md §6).
//! Scheduling/execution itself lives entirely in `kernel` and runs as
//! background loops alongside this router, not behind any route.

pub mod app;
pub mod routes;

pub use app::{build_app, AppState};
