//! Sleep and jitter helpers shared by the throttle controller, the ads
//! backoff policy, and the dispatcher idle wait.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Sleep for `duration`, returning early (false) if `cancel` fires first.
/// Returns true when the full duration elapsed.
pub async fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Uniform jitter in `[0, max)`, added to backoff delays so concurrent
/// workers do not retry in lockstep.
pub fn jitter(max: Duration) -> Duration {
    let bound = max.as_millis() as u64;
    if bound == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..bound))
}
