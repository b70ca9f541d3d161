//! Per-(integration, job type, key) sync watermarks.
//!
//! Cursor values are ISO-8601 UTC timestamps stored as text, so lexicographic
//! comparison is chronological and the monotonic guard can live in SQL: a
//! writer can initialise an absent cursor or advance an existing one, never
//! regress it.

use anyhow::Result;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::run::JobType;

/// Watermark for commerce incremental syncs: the greatest order `updated_at`
/// a successful run has observed.
pub const LAST_SYNCED_ORDER_UPDATED_AT: &str = "last_synced_order_updated_at";

/// A cursor write to apply inside the warehouse transaction.
#[derive(Debug, Clone)]
pub struct CursorUpdate {
    pub job_type: JobType,
    pub key: &'static str,
    pub value: String,
    /// Initialise only: leave an existing cursor untouched (window_fill
    /// semantics). When false the write advances monotonically.
    pub only_if_absent: bool,
}

/// Read a cursor value.
pub async fn fetch(
    integration_id: Uuid,
    job_type: JobType,
    key: &str,
    pool: &PgPool,
) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT cursor_value
        FROM sync_cursors
        WHERE integration_id = $1 AND job_type = $2 AND cursor_key = $3
        "#,
    )
    .bind(integration_id)
    .bind(job_type.as_str())
    .bind(key)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(v,)| v))
}

/// Apply a cursor write inside an open transaction.
///
/// Returns whether a row was written. For monotonic updates the conflict
/// guard refuses regressions and equal values, so `false` means the stored
/// cursor already covers `update.value`.
pub async fn apply(
    integration_id: Uuid,
    update: &CursorUpdate,
    conn: &mut PgConnection,
) -> Result<bool> {
    let result = if update.only_if_absent {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (integration_id, job_type, cursor_key, cursor_value, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (integration_id, job_type, cursor_key) DO NOTHING
            "#,
        )
        .bind(integration_id)
        .bind(update.job_type.as_str())
        .bind(update.key)
        .bind(&update.value)
        .execute(conn)
        .await?
    } else {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (integration_id, job_type, cursor_key, cursor_value, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (integration_id, job_type, cursor_key) DO UPDATE
            SET cursor_value = EXCLUDED.cursor_value, updated_at = NOW()
            WHERE sync_cursors.cursor_value < EXCLUDED.cursor_value
            "#,
        )
        .bind(integration_id)
        .bind(update.job_type.as_str())
        .bind(update.key)
        .bind(&update.value)
        .execute(conn)
        .await?
    };

    Ok(result.rows_affected() > 0)
}

/// Decide the next cursor after a fresh run: the maximum of the previous
/// value and everything fetched. `None` when there is nothing to write, i.e.
/// the run observed nothing beyond the existing watermark.
pub fn next_cursor(previous: Option<&str>, max_observed: Option<&str>) -> Option<String> {
    let observed = max_observed?;
    match previous {
        Some(prev) if observed <= prev => None,
        _ => Some(observed.to_string()),
    }
}
