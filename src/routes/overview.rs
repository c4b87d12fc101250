//! Read endpoints over the monitor snapshot plus the runtime mode switch.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use super::AppState;
use crate::models::Mode;
use crate::persist::Store;

// ---

pub fn router<S: Store + 'static>() -> Router<AppState<S>> {
    // ---
    Router::new()
        .route("/api/overview", get(overview::<S>))
        .route("/api/sensors/{id}", get(sensor_detail::<S>))
        .route("/api/mode/{mode}", put(switch_mode::<S>))
}

async fn overview<S: Store + 'static>(State(state): State<AppState<S>>) -> impl IntoResponse {
    Json(state.monitor.overview(Utc::now()))
}

async fn sensor_detail<S: Store + 'static>(
    Path(id): Path<String>,
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    // ---
    match state.monitor.sensor_detail(&id, Utc::now()) {
        Some(detail) => (StatusCode::OK, Json(detail)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no cached data for sensor '{id}'") })),
        )
            .into_response(),
    }
}

async fn switch_mode<S: Store + 'static>(
    Path(mode): Path<String>,
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    // ---
    let mode: Mode = match mode.parse() {
        Ok(mode) => mode,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))).into_response(),
    };

    match state.monitor.switch_mode(mode) {
        Ok(changed) => {
            info!(mode = %mode, changed, "PUT /api/mode");
            (StatusCode::OK, Json(json!({ "mode": mode, "changed": changed }))).into_response()
        }
        Err(e) => {
            warn!(mode = %mode, error = %e, "mode switch refused");
            (StatusCode::CONFLICT, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}
