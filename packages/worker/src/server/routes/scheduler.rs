//! Scheduler endpoint: an external cron hits this to enqueue periodic
//! `fresh` runs, one per healthy integration, deduplicated in SQL.
//!
//! The whole operation is a single insert-select, so calling it arbitrarily
//! often is safe: an integration with a queued or running fresh run inside
//! the dedup horizon, or one still inside a rate-limit hold, is skipped.

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use tracing::info;

use crate::domains::integrations::IntegrationType;
use crate::domains::sync::models::JobType;
use crate::server::app::AppState;

#[derive(Serialize)]
pub struct CronResponse {
    pub inserted: u64,
    #[serde(rename = "jobType", skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    #[serde(rename = "intervalMinutes", skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Shared-secret check: `X-Cron-Secret` or a bearer token. No configured
/// secret means the endpoint is open (trusted-network deployments).
pub fn authorized(secret: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(secret) = secret else {
        return true;
    };

    if let Some(value) = headers.get("x-cron-secret").and_then(|v| v.to_str().ok()) {
        if value == secret {
            return true;
        }
    }
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if value == format!("Bearer {}", secret) {
            return true;
        }
    }
    false
}

pub async fn cron_handler(
    Extension(state): Extension<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<CronResponse>) {
    if !authorized(state.config.cron_secret.as_deref(), &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(CronResponse {
                inserted: 0,
                job_type: None,
                interval_minutes: None,
                message: Some("unauthorized".to_string()),
            }),
        );
    }

    let source_type = match source.as_str() {
        "commerce" => IntegrationType::Commerce,
        "ads" => IntegrationType::Ads,
        _ => {
            return (
                StatusCode::NOT_FOUND,
                Json(CronResponse {
                    inserted: 0,
                    job_type: None,
                    interval_minutes: None,
                    message: Some(format!("unknown source: {}", source)),
                }),
            );
        }
    };

    if source_type == IntegrationType::Ads && !state.config.ads_jobs_enabled {
        return (
            StatusCode::ACCEPTED,
            Json(CronResponse {
                inserted: 0,
                job_type: None,
                interval_minutes: None,
                message: Some("disabled".to_string()),
            }),
        );
    }

    let job_type = JobType::fresh_for(source_type);
    let interval_minutes = match source_type {
        IntegrationType::Commerce => state.config.commerce_fresh_sched_minutes,
        IntegrationType::Ads => state.config.ads_fresh_sched_minutes,
    };

    let inserted = match enqueue_fresh_runs(&state, source_type, job_type, interval_minutes).await {
        Ok(count) => count,
        Err(e) => {
            tracing::error!(error = %e, source = source_type.as_str(), "cron enqueue failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CronResponse {
                    inserted: 0,
                    job_type: None,
                    interval_minutes: None,
                    message: Some("enqueue failed".to_string()),
                }),
            );
        }
    };

    if inserted > 0 {
        info!(
            inserted,
            job_type = job_type.as_str(),
            "cron tick enqueued fresh runs"
        );
    }

    (
        StatusCode::ACCEPTED,
        Json(CronResponse {
            inserted,
            job_type: Some(job_type.as_str().to_string()),
            interval_minutes: Some(interval_minutes),
            message: None,
        }),
    )
}

/// One statement enqueues a fresh run for every healthy integration of the
/// source type that has no recent queued/running fresh run and no active
/// rate-limit hold.
async fn enqueue_fresh_runs(
    state: &AppState,
    source_type: IntegrationType,
    job_type: JobType,
    interval_minutes: i64,
) -> anyhow::Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO sync_runs (id, integration_id, job_type, status, "trigger", created_at)
        SELECT gen_random_uuid(), i.id, $1, 'queued', 'auto', NOW()
        FROM integrations i
        WHERE i.integration_type = $2
          AND i.status IN ('connected', 'active')
          AND NOT EXISTS (
              SELECT 1 FROM sync_runs r
              WHERE r.integration_id = i.id
                AND r.job_type = $1
                AND r.status IN ('queued', 'running')
                AND r.created_at > NOW() - ($3 || ' minutes')::INTERVAL
          )
          AND NOT EXISTS (
              SELECT 1 FROM sync_runs h
              WHERE h.integration_id = i.id
                AND h.job_type = $1
                AND h.rate_limited = true
                AND h.rate_limit_reset_at > NOW()
          )
        "#,
    )
    .bind(job_type.as_str())
    .bind(source_type)
    .bind(interval_minutes.to_string())
    .execute(&state.pool)
    .await?;

    Ok(result.rows_affected())
}
