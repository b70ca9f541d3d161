//! HTTP application: liveness and the cron-driven scheduler endpoint.
//!
//! The router is built and bound before the database is verified; readiness
//! flips once the startup probe sees one successful `SELECT NOW()`.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::Extension,
    routing::get,
    Router,
};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::server::routes::{cron_handler, health_handler};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    /// Set once the database has answered a probe since process start.
    pub db_ready: Arc<AtomicBool>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        Self {
            pool,
            config,
            db_ready: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        }
    }
}

/// Build the worker's HTTP surface. Unknown paths fall through to 404.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .route("/internal/cron/:source", get(cron_handler).post(cron_handler))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}
