#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use core::time::Duration;

/// Makes a tick that outputs every `interval` and if ticks are "missed" (as tick() wasn't
/// called for some time) it will immediately output a single tick on the next call to
/// tick() and resume ticking every `interval`.
///
/// The supplied interval should be >> 5ms due to the underlying implementation.
pub fn make_periodic_tick(interval: Duration, yield_immediately: bool) -> tokio::time::Interval {
	let mut interval = tokio::time::interval_at(
		tokio::time::Instant::now() + if yield_immediately { Duration::ZERO } else { interval },
		interval,
	);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	interval
}
