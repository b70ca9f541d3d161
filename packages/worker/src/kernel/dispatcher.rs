//! The dispatch loop: claim one queued run, drive its handler to completion,
//! record the terminal state, repeat.
//!
//! ```text
//! Dispatcher
//!     │
//!     ├─► claim_next (FOR UPDATE SKIP LOCKED, fairness by created_at)
//!     ├─► JobType::parse ── unknown ─► error run, continue
//!     ├─► handlers::execute(job_type, run, deps)
//!     └─► mark_success(stats) / mark_error(code, message)
//! ```
//!
//! Retries are not the dispatcher's business: handlers are idempotent and
//! supervisors re-enqueue. A panic inside one iteration is isolated in a
//! task, logged, and the loop restarts after a pause.

use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::common::time::sleep_unless_cancelled;
use crate::common::SyncError;
use crate::config::Config;
use crate::domains::integrations::Integration;
use crate::domains::sync::handlers::{self, SyncDeps};
use crate::domains::sync::models::{JobType, SyncRun};

/// Pause before restarting the loop after a panic.
const PANIC_RESTART_PAUSE: Duration = Duration::from_secs(5);

/// Pause after a failed claim query before polling again.
const CLAIM_ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Dispatcher {
    deps: SyncDeps,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        Self {
            deps: SyncDeps::new(pool, config),
            poll_interval,
        }
    }

    /// Run until `shutdown` fires, isolating panics per restart.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "dispatcher starting"
        );

        while !shutdown.is_cancelled() {
            let dispatcher = self.clone();
            let token = shutdown.clone();
            match tokio::spawn(async move { dispatcher.run_inner(token).await }).await {
                Ok(()) => break,
                Err(join_err) if join_err.is_panic() => {
                    error!("dispatcher loop panicked, restarting in 5s");
                    sleep_unless_cancelled(PANIC_RESTART_PAUSE, &shutdown).await;
                }
                Err(join_err) => {
                    error!(error = %join_err, "dispatcher task aborted");
                    break;
                }
            }
        }

        info!("dispatcher stopped");
    }

    async fn run_inner(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                info!("shutdown requested, dispatcher draining");
                return;
            }

            let run = match SyncRun::claim_next(&self.deps.pool).await {
                Ok(run) => run,
                Err(e) => {
                    error!(error = %e, "failed to claim next sync run");
                    sleep_unless_cancelled(CLAIM_ERROR_PAUSE, &shutdown).await;
                    continue;
                }
            };

            match run {
                None => {
                    sleep_unless_cancelled(self.poll_interval, &shutdown).await;
                }
                Some(run) => {
                    // The claimed run is driven to completion even if
                    // shutdown fires meanwhile; the next iteration exits.
                    self.process_run(run).await;
                }
            }
        }
    }

    async fn process_run(&self, run: SyncRun) {
        info!(
            run_id = %run.id,
            integration_id = %run.integration_id,
            job_type = %run.job_type,
            "claimed sync run"
        );

        let result = match JobType::parse(&run.job_type) {
            Some(job_type) => handlers::execute(job_type, &run, &self.deps).await,
            None => Err(SyncError::UnknownJobType(run.job_type.clone())),
        };

        match result {
            Ok(stats) => {
                if let Err(e) = SyncRun::mark_success(run.id, &stats, &self.deps.pool).await {
                    error!(run_id = %run.id, error = %e, "failed to record run success");
                }
                info!(run_id = %run.id, job_type = %run.job_type, "sync run succeeded");
            }
            Err(err) => {
                let error_code = err.error_code();

                if matches!(err, SyncError::Auth(_)) {
                    if let Err(e) = Integration::mark_error(run.integration_id, &self.deps.pool).await
                    {
                        error!(
                            integration_id = %run.integration_id,
                            error = %e,
                            "failed to mark integration errored"
                        );
                    }
                }

                let rate_limit_hold = matches!(err, SyncError::RateLimited(_));
                if let Err(e) = SyncRun::mark_error(
                    run.id,
                    error_code,
                    &err.to_string(),
                    rate_limit_hold,
                    &self.deps.pool,
                )
                .await
                {
                    error!(run_id = %run.id, error = %e, "failed to record run error");
                }

                warn!(
                    run_id = %run.id,
                    job_type = %run.job_type,
                    error_code,
                    error = %err,
                    "sync run failed"
                );
            }
        }
    }
}
