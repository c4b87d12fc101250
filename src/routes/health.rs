// src/routes/health.rs
//! Health and job status endpoint.
//!
//! `GET /health` answers 200 whenever the process is serving; the body's
//! `status` field is `degraded` when a job is failing or an audit table is
//! unavailable, with the details alongside.

use axum::{extract::State, routing::get, Json, Router};

use super::AppState;
use crate::persist::Store;
use crate::service::HealthReport;

/// Handle `GET /health`.
async fn health<S: Store + 'static>(State(state): State<AppState<S>>) -> Json<HealthReport> {
    Json(state.monitor.health())
}

/// Create a subrouter containing the `/health` route.
pub fn router<S: Store + 'static>() -> Router<AppState<S>> {
    Router::new().route("/health", get(health::<S>))
}
