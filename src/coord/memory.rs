//! In-process coordination backend.

// self
use crate::{
	_prelude::*,
	coord::{CoordFuture, CoordState, LockBackend, WindowBackend, WindowState},
};

/// Coordinator sharing leases and windows between clones within one process.
#[derive(Clone, Debug, Default)]
pub struct MemoryCoordinator(Arc<Mutex<CoordState>>);
impl MemoryCoordinator {
	/// Creates an empty coordinator.
	pub fn new() -> Self {
		Self::default()
	}
}
impl LockBackend for MemoryCoordinator {
	fn try_acquire<'a>(
		&'a self,
		key: &'a str,
		holder: &'a str,
		ttl: Duration,
		now: OffsetDateTime,
	) -> CoordFuture<'a, bool> {
		Box::pin(async move { Ok(self.0.lock().try_acquire(key, holder, ttl, now)) })
	}

	fn release<'a>(&'a self, key: &'a str, holder: &'a str) -> CoordFuture<'a, ()> {
		Box::pin(async move {
			self.0.lock().release(key, holder);

			Ok(())
		})
	}
}
impl WindowBackend for MemoryCoordinator {
	fn admit<'a>(
		&'a self,
		key: &'a str,
		now: OffsetDateTime,
		window: Duration,
		ceiling: u32,
	) -> CoordFuture<'a, WindowState> {
		Box::pin(async move { Ok(self.0.lock().window(key).admit(now, window, ceiling)) })
	}

	fn snapshot<'a>(
		&'a self,
		key: &'a str,
		now: OffsetDateTime,
		window: Duration,
	) -> CoordFuture<'a, WindowState> {
		Box::pin(async move { Ok(self.0.lock().window(key).snapshot(now, window)) })
	}

	fn throttle<'a>(
		&'a self,
		key: &'a str,
		until: OffsetDateTime,
	) -> CoordFuture<'a, OffsetDateTime> {
		Box::pin(async move { Ok(self.0.lock().window(key).throttle(until)) })
	}

	fn throttled_until<'a>(&'a self, key: &'a str) -> CoordFuture<'a, Option<OffsetDateTime>> {
		Box::pin(async move { Ok(self.0.lock().throttled_until(key)) })
	}
}
