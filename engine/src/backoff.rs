//! Retry pacing for failed sub-streams: exponential backoff with jitter,
//! capped so a long outage cannot push delays past a usable bound.

use core::cmp::min;
use std::time::Duration;

use rand::Rng;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

pub fn max_sleep_duration(initial_delay: Duration, attempt: u32) -> Duration {
	min(MAX_RETRY_DELAY, initial_delay.saturating_mul(2u32.saturating_pow(attempt)))
}

/// Delay before retry number `attempt` (zero-based). At least half the
/// maximum for the attempt, so consecutive retries cannot cluster.
pub fn retry_delay(initial_delay: Duration, attempt: u32) -> Duration {
	let half_max = max_sleep_duration(initial_delay, attempt) / 2;
	if half_max.is_zero() {
		return Duration::ZERO
	}
	half_max + rand::thread_rng().gen_range(Duration::default()..half_max)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn delay_is_bounded_by_attempt_window() {
		const INITIAL: Duration = Duration::from_millis(500);

		for attempt in 0..8 {
			let delay = retry_delay(INITIAL, attempt);
			let max = max_sleep_duration(INITIAL, attempt);
			assert!(delay >= max / 2);
			assert!(delay <= max);
		}
	}

	#[test]
	fn delay_saturates_at_the_cap() {
		assert_eq!(
			max_sleep_duration(Duration::from_secs(1), u32::MAX),
			Duration::from_secs(60)
		);
	}

	#[test]
	fn zero_initial_delay_does_not_panic() {
		assert_eq!(retry_delay(Duration::ZERO, 3), Duration::ZERO);
	}
}
