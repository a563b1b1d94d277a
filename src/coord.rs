//! Shared-state contracts for cross-caller coordination.
//!
//! Two pieces of state must be consistent across every caller sharing an account, including
//! callers in other processes: the refresh lease (mutual exclusion for token rotation) and
//! the rate window (request timestamps plus any server-imposed throttle). [`LockBackend`]
//! and [`WindowBackend`] describe the atomic operations the core needs;
//! [`MemoryCoordinator`] serves a single process and [`FileCoordinator`] extends the
//! guarantees to every process sharing a state file.

pub mod file;
pub mod memory;

pub use file::FileCoordinator;
pub use memory::MemoryCoordinator;

// std
use std::collections::BTreeMap;
// self
use crate::_prelude::*;

/// Boxed future returned by coordination backends.
pub type CoordFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CoordError>> + 'a + Send>>;

/// Error type produced by coordination backends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum CoordError {
	/// Shared state could not be decoded or encoded.
	#[error("Coordination state serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure (I/O, lock acquisition).
	#[error("Coordination backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
}
impl From<crate::state_file::StateFileError> for CoordError {
	fn from(e: crate::state_file::StateFileError) -> Self {
		match e {
			crate::state_file::StateFileError::Malformed { .. } =>
				Self::Serialization { message: e.to_string() },
			crate::state_file::StateFileError::Io { .. } =>
				Self::Backend { message: e.to_string() },
		}
	}
}

/// Expiring mutual-exclusion leases keyed by string.
pub trait LockBackend
where
	Self: Send + Sync,
{
	/// Takes (or extends) the lease for `key` unless another holder owns an unexpired one.
	fn try_acquire<'a>(
		&'a self,
		key: &'a str,
		holder: &'a str,
		ttl: Duration,
		now: OffsetDateTime,
	) -> CoordFuture<'a, bool>;

	/// Drops the lease for `key` if `holder` still owns it.
	fn release<'a>(&'a self, key: &'a str, holder: &'a str) -> CoordFuture<'a, ()>;
}

/// Sliding request windows keyed by string.
pub trait WindowBackend
where
	Self: Send + Sync,
{
	/// Atomically prunes, counts, and records `now` if the window is under `ceiling` and no
	/// server throttle is active.
	fn admit<'a>(
		&'a self,
		key: &'a str,
		now: OffsetDateTime,
		window: Duration,
		ceiling: u32,
	) -> CoordFuture<'a, WindowState>;

	/// Prunes and reports the window without recording anything.
	fn snapshot<'a>(
		&'a self,
		key: &'a str,
		now: OffsetDateTime,
		window: Duration,
	) -> CoordFuture<'a, WindowState>;

	/// Blocks admissions until at least `until`, returning the effective instant. An
	/// existing later throttle is kept.
	fn throttle<'a>(&'a self, key: &'a str, until: OffsetDateTime)
	-> CoordFuture<'a, OffsetDateTime>;

	/// Server-imposed throttle instant, if one was ever recorded.
	fn throttled_until<'a>(&'a self, key: &'a str) -> CoordFuture<'a, Option<OffsetDateTime>>;
}

/// Backend usable for both leases and windows.
pub trait Coordinator
where
	Self: LockBackend + WindowBackend,
{
}
impl<T> Coordinator for T where T: LockBackend + WindowBackend {}

/// Window view returned by [`WindowBackend`] operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowState {
	/// Whether the call recorded a new request.
	pub admitted: bool,
	/// Requests inside the trailing window (including the admitted one).
	pub count: u32,
	/// Oldest timestamp still inside the window.
	pub oldest: Option<OffsetDateTime>,
	/// Server-imposed throttle instant, if still in the future.
	pub throttled_until: Option<OffsetDateTime>,
}

/// Request timestamps inside the trailing window plus the server throttle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
	stamps: VecDeque<OffsetDateTime>,
	throttled_until: Option<OffsetDateTime>,
}
impl RateWindow {
	/// Drops timestamps that fell out of the window ending at `now`.
	pub fn prune(&mut self, now: OffsetDateTime, window: Duration) {
		while self.stamps.front().is_some_and(|stamp| now - *stamp >= window) {
			self.stamps.pop_front();
		}
	}

	/// Records `now` if under `ceiling` and not throttled.
	pub fn admit(&mut self, now: OffsetDateTime, window: Duration, ceiling: u32) -> WindowState {
		self.prune(now, window);

		let throttled = self.active_throttle(now).is_some();
		let admitted = !throttled && self.count() < ceiling;

		if admitted {
			self.stamps.push_back(now);
		}

		self.state(now, admitted)
	}

	/// Prunes and reports the window.
	pub fn snapshot(&mut self, now: OffsetDateTime, window: Duration) -> WindowState {
		self.prune(now, window);

		self.state(now, false)
	}

	/// Extends the throttle to `until`, never shortening it.
	pub fn throttle(&mut self, until: OffsetDateTime) -> OffsetDateTime {
		let effective = self.throttled_until.map_or(until, |current| current.max(until));

		self.throttled_until = Some(effective);

		effective
	}

	/// Stored throttle instant.
	pub fn throttled_until(&self) -> Option<OffsetDateTime> {
		self.throttled_until
	}

	fn active_throttle(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
		self.throttled_until.filter(|until| *until > now)
	}

	fn count(&self) -> u32 {
		u32::try_from(self.stamps.len()).unwrap_or(u32::MAX)
	}

	fn state(&self, now: OffsetDateTime, admitted: bool) -> WindowState {
		WindowState {
			admitted,
			count: self.count(),
			oldest: self.stamps.front().copied(),
			throttled_until: self.active_throttle(now),
		}
	}
}

/// Refresh lease owned by one holder until `expires_at`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
	/// Opaque holder identity.
	pub holder: String,
	/// Instant after which other holders may take the lease.
	pub expires_at: OffsetDateTime,
}

/// Complete coordination state shared by the built-in backends.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CoordState {
	#[serde(default)]
	leases: BTreeMap<String, Lease>,
	#[serde(default)]
	windows: BTreeMap<String, RateWindow>,
}
impl CoordState {
	pub(crate) fn try_acquire(
		&mut self,
		key: &str,
		holder: &str,
		ttl: Duration,
		now: OffsetDateTime,
	) -> bool {
		let held_by_other = self
			.leases
			.get(key)
			.is_some_and(|lease| lease.holder != holder && lease.expires_at > now);

		if held_by_other {
			return false;
		}

		self.leases
			.insert(key.to_owned(), Lease { holder: holder.to_owned(), expires_at: now + ttl });

		true
	}

	pub(crate) fn release(&mut self, key: &str, holder: &str) {
		if self.leases.get(key).is_some_and(|lease| lease.holder == holder) {
			self.leases.remove(key);
		}
	}

	pub(crate) fn window(&mut self, key: &str) -> &mut RateWindow {
		self.windows.entry(key.to_owned()).or_default()
	}

	pub(crate) fn throttled_until(&self, key: &str) -> Option<OffsetDateTime> {
		self.windows.get(key).and_then(RateWindow::throttled_until)
	}
}
