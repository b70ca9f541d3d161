//! Typed error taxonomy for sync runs.
//!
//! Every failure that terminates a run maps onto a closed set of error codes
//! stored on the `sync_runs` row. The HTTP clients classify failures at the
//! point they are observed and the dispatcher only reads `error_code()` —
//! nothing downstream inspects message text.

use thiserror::Error;

/// Maximum length of an `error_message` persisted on a sync run.
pub const MAX_ERROR_MESSAGE_LEN: usize = 1000;

const TRUNCATION_INDICATOR: &str = "… [truncated]";

/// Failure of a sync run, classified at the source.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Credentials rejected by the source. The dispatcher additionally marks
    /// the integration `status = 'error'`.
    #[error("source rejected credentials: {0}")]
    Auth(String),

    /// Rate-limit retries exhausted. The dispatcher records a rate-limit hold
    /// on the run so the scheduler backs off until the reset.
    #[error("source rate limit exhausted: {0}")]
    RateLimited(String),

    /// 5xx from the source after bounded retries.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A bulk-style paginated query ran past its 300-second ceiling.
    #[error("bulk query not ready after {elapsed_secs}s")]
    BulkNotReady { elapsed_secs: u64 },

    /// Response shape did not match the expected schema. Carries a fragment
    /// of the offending payload for the logs.
    #[error("unexpected response shape: {0}")]
    SchemaMismatch(String),

    /// Warehouse transaction rolled back.
    #[error("warehouse write failed: {0}")]
    DbWrite(#[from] sqlx::Error),

    /// Row carries a job type this deployment does not know.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// Anything unclassified.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// The `error_code` recorded on the sync run.
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::Auth(_) => "auth_error",
            SyncError::RateLimited(_) => "rate_limited",
            SyncError::SourceUnavailable(_) => "source_unavailable",
            SyncError::BulkNotReady { .. } => "bulk_not_ready",
            SyncError::SchemaMismatch(_) => "schema_mismatch",
            SyncError::DbWrite(_) => "db_write_error",
            SyncError::UnknownJobType(_) => "unknown_job_type",
            SyncError::Other(_) => "worker_error",
        }
    }
}

/// Bound an error message to [`MAX_ERROR_MESSAGE_LEN`] characters, appending
/// a truncation indicator when the input exceeded it.
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_LEN {
        return message.to_string();
    }
    let keep = MAX_ERROR_MESSAGE_LEN - TRUNCATION_INDICATOR.chars().count();
    let mut out: String = message.chars().take(keep).collect();
    out.push_str(TRUNCATION_INDICATOR);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_the_closed_set() {
        assert_eq!(SyncError::Auth("no".into()).error_code(), "auth_error");
        assert_eq!(
            SyncError::RateLimited("429".into()).error_code(),
            "rate_limited"
        );
        assert_eq!(
            SyncError::SourceUnavailable("503".into()).error_code(),
            "source_unavailable"
        );
        assert_eq!(
            SyncError::BulkNotReady { elapsed_secs: 301 }.error_code(),
            "bulk_not_ready"
        );
        assert_eq!(
            SyncError::SchemaMismatch("{}".into()).error_code(),
            "schema_mismatch"
        );
        assert_eq!(
            SyncError::UnknownJobType("x".into()).error_code(),
            "unknown_job_type"
        );
        assert_eq!(
            SyncError::Other(anyhow::anyhow!("boom")).error_code(),
            "worker_error"
        );
    }

    #[test]
    fn short_messages_pass_through() {
        assert_eq!(truncate_message("all good"), "all good");
    }

    #[test]
    fn long_messages_are_bounded_with_indicator() {
        let long = "x".repeat(5000);
        let out = truncate_message(&long);
        assert_eq!(out.chars().count(), MAX_ERROR_MESSAGE_LEN);
        assert!(out.ends_with("[truncated]"));
    }

    #[test]
    fn exactly_at_bound_is_untouched() {
        let exact = "y".repeat(MAX_ERROR_MESSAGE_LEN);
        assert_eq!(truncate_message(&exact), exact);
    }
}
