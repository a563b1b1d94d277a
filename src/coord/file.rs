//! Cross-process coordination backed by a JSON state file.

// std
use std::path::PathBuf;
// self
use crate::{
	_prelude::*,
	coord::{CoordError, CoordFuture, CoordState, LockBackend, WindowBackend, WindowState},
	state_file::StateFile,
};

/// Coordinator whose leases and windows live in a state file guarded by an exclusive OS file
/// lock, so every process pointing at the same path shares them.
#[derive(Clone, Debug)]
pub struct FileCoordinator {
	file: Arc<StateFile>,
}
impl FileCoordinator {
	/// Opens (or lazily creates) the coordinator state at `path`.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, CoordError> {
		Ok(Self { file: Arc::new(StateFile::open(path)?) })
	}

	fn update<R>(&self, f: impl FnOnce(&mut CoordState) -> R) -> Result<R, CoordError> {
		Ok(self.file.update(f)?)
	}
}
impl LockBackend for FileCoordinator {
	fn try_acquire<'a>(
		&'a self,
		key: &'a str,
		holder: &'a str,
		ttl: Duration,
		now: OffsetDateTime,
	) -> CoordFuture<'a, bool> {
		Box::pin(async move { self.update(|state| state.try_acquire(key, holder, ttl, now)) })
	}

	fn release<'a>(&'a self, key: &'a str, holder: &'a str) -> CoordFuture<'a, ()> {
		Box::pin(async move { self.update(|state| state.release(key, holder)) })
	}
}
impl WindowBackend for FileCoordinator {
	fn admit<'a>(
		&'a self,
		key: &'a str,
		now: OffsetDateTime,
		window: Duration,
		ceiling: u32,
	) -> CoordFuture<'a, WindowState> {
		Box::pin(async move { self.update(|state| state.window(key).admit(now, window, ceiling)) })
	}

	fn snapshot<'a>(
		&'a self,
		key: &'a str,
		now: OffsetDateTime,
		window: Duration,
	) -> CoordFuture<'a, WindowState> {
		Box::pin(async move { self.update(|state| state.window(key).snapshot(now, window)) })
	}

	fn throttle<'a>(
		&'a self,
		key: &'a str,
		until: OffsetDateTime,
	) -> CoordFuture<'a, OffsetDateTime> {
		Box::pin(async move { self.update(|state| state.window(key).throttle(until)) })
	}

	fn throttled_until<'a>(&'a self, key: &'a str) -> CoordFuture<'a, Option<OffsetDateTime>> {
		Box::pin(async move {
			let state: CoordState = self.file.read()?;

			Ok(state.throttled_until(key))
		})
	}
}
