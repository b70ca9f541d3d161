// Main entry point for the ingest worker

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker_core::kernel::dispatcher::Dispatcher;
use worker_core::server::{build_app, AppState};
use worker_core::Config;

/// Startup probe: attempts two seconds apart inside a bounded window before
/// the process gives up with exit code 1.
const DB_PROBE_ATTEMPTS: u32 = 30;
const DB_PROBE_PAUSE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,worker_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting commerce analytics ingest worker");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // The pool is lazy: connections are only opened by the first statement,
    // so the health server can bind before the database is reachable.
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_lazy(&config.database_url)
        .context("Invalid DATABASE_URL")?;

    // Bind the health/cron server first; it answers 503 until the probe
    // below succeeds.
    let state = AppState::new(pool.clone(), config.clone());
    let app = build_app(state.clone());
    let addr = format!("0.0.0.0:{}", config.health_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind health port")?;
    tracing::info!("Health endpoint listening on {}", addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server exited");
        }
    });

    // Verify the database before dispatching anything.
    verify_database(&state).await?;

    // Drain the in-flight run on SIGTERM, then exit.
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    Dispatcher::new(pool, config).run(shutdown).await;

    tracing::info!("Ingest worker stopped");
    Ok(())
}

async fn verify_database(state: &AppState) -> Result<()> {
    for attempt in 1..=DB_PROBE_ATTEMPTS {
        match sqlx::query("SELECT NOW()").execute(&state.pool).await {
            Ok(_) => {
                state.db_ready.store(true, Ordering::Relaxed);
                tracing::info!("Database connected");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(
                    attempt,
                    max_attempts = DB_PROBE_ATTEMPTS,
                    error = %e,
                    "database probe failed"
                );
                tokio::time::sleep(DB_PROBE_PAUSE).await;
            }
        }
    }

    bail!("database unreachable after {} probe attempts", DB_PROBE_ATTEMPTS)
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM received, draining"),
            _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received, draining"),
        }
        shutdown.cancel();
    });
}
