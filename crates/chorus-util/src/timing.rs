//! Randomized-duration helpers for election timeouts and heartbeat periods.
//!
//! Randomization must be per-node, per-cycle to avoid lockstep split votes;
//! each call draws a fresh value rather than memoizing one.

use std::time::Duration;

/// Draws a uniformly random duration in `[low, high]`.
pub fn random_duration_between(low: Duration, high: Duration) -> Duration {
    if high <= low {
        return low;
    }
    let span = high - low;
    let span_nanos = span.as_nanos().max(1);
    let offset_nanos = rand::random::<u128>() % span_nanos;
    low + Duration::from_nanos(offset_nanos as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_bounds() {
        let low = Duration::from_millis(400);
        let high = Duration::from_millis(800);
        for _ in 0..1000 {
            let d = random_duration_between(low, high);
            assert!(d >= low && d <= high);
        }
    }

    #[test]
    fn degenerate_range_returns_low() {
        let low = Duration::from_millis(500);
        assert_eq!(random_duration_between(low, low), low);
    }
}
