//! Shared retry/backoff math (spec §4.6), used by both the RPC
//! multiplexer's retry loop and the subscription supervisor's backoff.

use std::time::Duration;

/// Sum of `min(2^k * min_delay, max_delay)` for `k` in `from..from+count`
/// — the cumulative delay the remaining retry attempts would introduce,
/// per spec §4.6 step 4.
pub fn cumulative_delay(from: u32, count: u32, min_delay: Duration, max_delay: Duration) -> Duration {
    (from..from + count)
        .map(|k| crate::clock::exponential_backoff(k, min_delay, max_delay))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_bounded_backoffs() {
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(4);
        // k=0..3: 1, 2, 4 (capped)
        assert_eq!(cumulative_delay(0, 3, min, max), Duration::from_secs(7));
    }
}
