//! Time source and scheduler seam.
//!
//! Admission waits and retry backoff sleep through a [`Clock`] so both can be driven by a
//! synthetic [`ManualClock`] in tests and simulations without touching wall-clock time.

// self
use crate::_prelude::*;

/// Boxed future returned by [`Clock::sleep`].
pub type SleepFuture<'a> = Pin<Box<dyn Future<Output = ()> + 'a + Send>>;

/// Source of "now" plus a way to suspend until later.
pub trait Clock
where
	Self: Send + Sync,
{
	/// Current instant.
	fn now(&self) -> OffsetDateTime;

	/// Suspends the caller for `duration`. Non-positive durations complete immediately.
	fn sleep(&self, duration: Duration) -> SleepFuture<'_>;
}

/// Wall-clock time backed by the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;
impl Clock for SystemClock {
	fn now(&self) -> OffsetDateTime {
		OffsetDateTime::now_utc()
	}

	fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
		let duration = to_std(duration);

		Box::pin(async move {
			if !duration.is_zero() {
				tokio::time::sleep(duration).await;
			}
		})
	}
}

/// Synthetic clock: `sleep` advances time instantly and records the requested duration.
#[derive(Clone, Debug)]
pub struct ManualClock {
	now: Arc<Mutex<OffsetDateTime>>,
	sleeps: Arc<Mutex<Vec<Duration>>>,
}
impl ManualClock {
	/// Creates a clock frozen at `start`.
	pub fn new(start: OffsetDateTime) -> Self {
		Self { now: Arc::new(Mutex::new(start)), sleeps: Default::default() }
	}

	/// Moves the clock forward without recording a sleep.
	pub fn advance(&self, delta: Duration) {
		*self.now.lock() += delta;
	}

	/// Every duration passed to [`Clock::sleep`], in call order.
	pub fn sleeps(&self) -> Vec<Duration> {
		self.sleeps.lock().clone()
	}

	/// Sum of all recorded sleeps.
	pub fn total_slept(&self) -> Duration {
		self.sleeps.lock().iter().fold(Duration::ZERO, |acc, d| acc + *d)
	}
}
impl Clock for ManualClock {
	fn now(&self) -> OffsetDateTime {
		*self.now.lock()
	}

	fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
		if duration.is_positive() {
			self.sleeps.lock().push(duration);
			self.advance(duration);
		}

		Box::pin(async {})
	}
}

/// Converts a signed duration into a std duration, clamping negatives to zero.
pub(crate) fn to_std(duration: Duration) -> std::time::Duration {
	std::time::Duration::try_from(duration).unwrap_or_default()
}

/// Time left until `deadline`, or `None` when it already passed.
pub(crate) fn remaining(clock: &dyn Clock, deadline: OffsetDateTime) -> Option<Duration> {
	let left = deadline - clock.now();

	left.is_positive().then_some(left)
}
