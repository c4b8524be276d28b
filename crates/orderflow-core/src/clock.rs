//! Time sources for claim deadlines.
//!
//! Claim and timeout timestamps are taken from an injected [`Clock`] so the
//! same deadline arithmetic runs against wall-clock time in production and
//! against tokio's pausable clock in tests.

use chrono::{DateTime, Utc};
use std::fmt;

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
	fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// Wall-clock time anchored when the clock is created and advanced by
/// tokio's monotonic clock.
///
/// Under `tokio::time::pause` the returned time moves only when the runtime
/// clock does, which keeps persisted deadlines and in-process timers in step.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
	wall: DateTime<Utc>,
	start: tokio::time::Instant,
}

impl TokioClock {
	pub fn new() -> Self {
		Self {
			wall: Utc::now(),
			start: tokio::time::Instant::now(),
		}
	}
}

impl Default for TokioClock {
	fn default() -> Self {
		Self::new()
	}
}

impl Clock for TokioClock {
	fn now(&self) -> DateTime<Utc> {
		let elapsed = self.start.elapsed();
		self.wall + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[tokio::test(start_paused = true)]
	async fn test_tokio_clock_follows_paused_time() {
		let clock = TokioClock::new();
		let before = clock.now();

		tokio::time::advance(Duration::from_secs(7200)).await;

		assert_eq!((clock.now() - before).num_seconds(), 7200);
	}
}
