//! Sync run model: one attempt to execute one job for one integration.
//!
//! Lifecycle is `queued -> running -> {success, error}`, owned entirely by
//! the worker once a row leaves `queued`. Runs are never reused; supervisors
//! re-enqueue a fresh row instead of retrying.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::error::truncate_message;
use crate::domains::integrations::IntegrationType;

/// Minutes a rate-limit hold keeps the scheduler from enqueueing again.
const RATE_LIMIT_HOLD_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Queued,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "sync_trigger", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Auto,
    User,
    System,
}

/// Closed set of job types this deployment executes.
///
/// Rows are authored as strings by the UI and the scheduler, and the column
/// stays `text` so rows written by older or newer deployments remain
/// representable; parsing happens once at claim time, and the unknown branch
/// exists only for those foreign rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    CommerceFresh,
    CommerceWindowFill,
    AdsFresh,
    AdsWindowFill,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::CommerceFresh => "commerce_fresh",
            JobType::CommerceWindowFill => "commerce_window_fill",
            JobType::AdsFresh => "ads_fresh",
            JobType::AdsWindowFill => "ads_window_fill",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "commerce_fresh" => Some(JobType::CommerceFresh),
            "commerce_window_fill" => Some(JobType::CommerceWindowFill),
            "ads_fresh" => Some(JobType::AdsFresh),
            "ads_window_fill" => Some(JobType::AdsWindowFill),
            _ => None,
        }
    }

    /// The periodic job the scheduler enqueues for a source type.
    pub fn fresh_for(source: IntegrationType) -> Self {
        match source {
            IntegrationType::Commerce => JobType::CommerceFresh,
            IntegrationType::Ads => JobType::AdsFresh,
        }
    }
}

#[derive(FromRow, Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct SyncRun {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub integration_id: Uuid,
    pub job_type: String,
    #[builder(default)]
    pub trigger: Trigger,
    #[builder(default)]
    pub status: RunStatus,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
    #[builder(default = false)]
    pub rate_limited: bool,
    #[builder(default, setter(strip_option))]
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default, setter(strip_option))]
    pub error_code: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub stats: Option<serde_json::Value>,
}

impl SyncRun {
    /// Claim the next queued run, if any.
    ///
    /// One statement does the select-and-transition: the CTE takes a row lock
    /// with SKIP LOCKED so concurrent workers never claim the same run, and
    /// the UPDATE moves it to `running` in the same snapshot. Runs under an
    /// active rate-limit hold are left for the hold to expire. Ordering is
    /// `created_at` for fairness; nothing here may assume FIFO.
    pub async fn claim_next(pool: &PgPool) -> Result<Option<Self>> {
        let run = sqlx::query_as::<_, Self>(
            r#"
            WITH next_run AS (
                SELECT id
                FROM sync_runs
                WHERE status = 'queued'
                  AND (rate_limited = false OR rate_limit_reset_at <= NOW())
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE sync_runs
            SET status = 'running',
                started_at = NOW(),
                error_code = NULL,
                error_message = NULL
            WHERE id IN (SELECT id FROM next_run)
            RETURNING id, integration_id, job_type, "trigger", status, created_at,
                      started_at, finished_at, rate_limited, rate_limit_reset_at,
                      retry_count, error_code, error_message, stats
            "#,
        )
        .fetch_optional(pool)
        .await?;

        Ok(run)
    }

    /// Terminate the run as successful with the handler's stats.
    pub async fn mark_success(id: Uuid, stats: &serde_json::Value, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = 'success', finished_at = NOW(), stats = $1
            WHERE id = $2
            "#,
        )
        .bind(stats)
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Terminate the run as errored.
    ///
    /// `rate_limit_hold` additionally records `rate_limited = true` and a
    /// reset timestamp five minutes out, which the scheduler honours before
    /// enqueueing the next run for the integration.
    pub async fn mark_error(
        id: Uuid,
        error_code: &str,
        error_message: &str,
        rate_limit_hold: bool,
        pool: &PgPool,
    ) -> Result<()> {
        let reset_at =
            rate_limit_hold.then(|| Utc::now() + Duration::minutes(RATE_LIMIT_HOLD_MINUTES));

        sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = 'error',
                finished_at = NOW(),
                error_code = $1,
                error_message = $2,
                rate_limited = $3,
                rate_limit_reset_at = COALESCE($4, rate_limit_reset_at)
            WHERE id = $5
            "#,
        )
        .bind(error_code)
        .bind(truncate_message(error_message))
        .bind(rate_limit_hold)
        .bind(reset_at)
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }
}
