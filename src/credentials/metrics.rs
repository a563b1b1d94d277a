// std
use std::sync::atomic::{AtomicU64, Ordering};

/// Always-on counters for the slow (refresh) path of credential acquisition.
///
/// `attempts` counts every caller that found its credential unusable; of those, `reuses`
/// adopted a credential another caller (or process) had already rotated, `rotations` called
/// the token endpoint themselves, and `failures` returned an error.
#[derive(Debug, Default)]
pub struct RefreshMetrics {
	attempts: AtomicU64,
	reuses: AtomicU64,
	rotations: AtomicU64,
	failures: AtomicU64,
}
impl RefreshMetrics {
	/// Callers that entered the refresh path.
	pub fn attempts(&self) -> u64 {
		self.attempts.load(Ordering::Relaxed)
	}

	/// Callers served by a credential someone else had already refreshed.
	pub fn reuses(&self) -> u64 {
		self.reuses.load(Ordering::Relaxed)
	}

	/// Successful token endpoint refresh calls.
	pub fn rotations(&self) -> u64 {
		self.rotations.load(Ordering::Relaxed)
	}

	/// Successful refresh-path outcomes (reuses plus rotations).
	pub fn successes(&self) -> u64 {
		self.reuses() + self.rotations()
	}

	/// Refresh-path calls that returned an error.
	pub fn failures(&self) -> u64 {
		self.failures.load(Ordering::Relaxed)
	}

	pub(crate) fn record_attempt(&self) {
		self.attempts.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_reuse(&self) {
		self.reuses.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_rotation(&self) {
		self.rotations.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_failure(&self) {
		self.failures.fetch_add(1, Ordering::Relaxed);
	}
}
