use std::sync::atomic::Ordering;

use axum::{extract::Extension, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    uptime_seconds: u64,
    timestamp: DateTime<Utc>,
}

/// Liveness endpoint.
///
/// Returns 200 once the database has answered one startup probe since the
/// process started, 503 before that point. The server is bound before the
/// probe runs so orchestrators can watch the flip.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let ready = state.db_ready.load(Ordering::Relaxed);

    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if ready { "ok" } else { "starting" }.to_string(),
            uptime_seconds: state.started_at.elapsed().as_secs(),
            timestamp: Utc::now(),
        }),
    )
}
