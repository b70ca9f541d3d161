//! Rate-limit policies for the two sources.
//!
//! The commerce GraphQL API meters by query cost and reports telemetry on
//! every response; [`CostThrottle`] turns that telemetry into a delay before
//! the next page. The ads REST API has no telemetry; [`Backoff`] implements
//! its bounded exponential retry schedule.

use std::time::Duration;

use crate::common::time::jitter;

/// Cost telemetry attached to every commerce GraphQL response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostTelemetry {
    pub currently_available: f64,
    pub maximum_available: f64,
    pub restore_rate: f64,
    pub requested_query_cost: f64,
}

/// Reactive throttle for the cost-metered commerce API.
///
/// No pre-budgeting: the controller only looks at the telemetry of the
/// response that just arrived and decides how long to wait before the next
/// call. Missing telemetry means no delay — the server will surface failures
/// on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostThrottle;

/// Safety margin added on top of the computed restore wait.
const RESTORE_MARGIN: Duration = Duration::from_millis(200);

/// Fraction of the maximum bucket treated as a comfortable buffer.
const BUFFER_FRACTION: f64 = 0.2;

impl CostThrottle {
    /// Delay to apply after a response carrying `telemetry`.
    pub fn delay_after(&self, telemetry: Option<&CostTelemetry>) -> Duration {
        let Some(t) = telemetry else {
            return Duration::ZERO;
        };
        if t.restore_rate <= 0.0 || t.maximum_available <= 0.0 {
            // Degenerate telemetry, treat as unknown.
            return Duration::ZERO;
        }

        let buffer = t.maximum_available * BUFFER_FRACTION;
        if t.currently_available > buffer {
            return Duration::ZERO;
        }
        if t.requested_query_cost <= t.currently_available {
            return Duration::ZERO;
        }

        let deficit = t.requested_query_cost - t.currently_available;
        let wait_secs = (deficit / t.restore_rate).ceil() as u64;
        Duration::from_secs(wait_secs) + RESTORE_MARGIN
    }
}

/// Bounded exponential backoff for 429/5xx responses from the ads API.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
    pub jitter_max: Duration,
}

impl Backoff {
    /// The ads insights schedule: 1s base, doubling, 0-250ms jitter,
    /// capped at 60s, five attempts per call.
    pub fn ads() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(60),
            max_attempts: 5,
            jitter_max: Duration::from_millis(250),
        }
    }

    /// Deterministic delay for a zero-indexed retry attempt, before jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self
            .base
            .checked_mul(self.factor.saturating_pow(attempt))
            .unwrap_or(self.cap);
        scaled.min(self.cap)
    }

    /// Delay actually slept for `attempt`: the server's `Retry-After` when it
    /// sent one, otherwise the exponential delay, plus jitter.
    pub fn next_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = retry_after.unwrap_or_else(|| self.delay(attempt));
        base.min(self.cap) + jitter(self.jitter_max)
    }
}
