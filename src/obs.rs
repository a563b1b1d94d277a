//! Optional observability helpers for executor operations.
//!
//! # Feature Flags
//!
//! - Enable `tracing` to emit structured spans named `oauth2_executor.op` with the `op` and
//!   `stage` fields, plus debug/warn events for retries, throttling, and refresh outcomes.
//! - Enable `metrics` to increment the `oauth2_executor_op_total` counter (labeled by `op` +
//!   `outcome`) and the `oauth2_executor_throttle_total` counter (labeled by `reason`).

/// Emits a `tracing` event when the `tracing` feature is enabled; expands to nothing otherwise.
macro_rules! trace_event {
	($level:ident, $($arg:tt)+) => {
		#[cfg(feature = "tracing")]
		{
			::tracing::$level!($($arg)+);
		}
	};
}

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Operations observed by the executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
	/// Authorization code exchange.
	AuthorizationCode,
	/// Refresh token rotation.
	Refresh,
	/// Rate-limited API request.
	Request,
}
impl OpKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			OpKind::AuthorizationCode => "authorization_code",
			OpKind::Refresh => "refresh",
			OpKind::Request => "request",
		}
	}
}
impl Display for OpKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpOutcome {
	/// Entry to an operation.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
}
impl OpOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			OpOutcome::Attempt => "attempt",
			OpOutcome::Success => "success",
			OpOutcome::Failure => "failure",
		}
	}
}
impl Display for OpOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Why an admission decision slowed a request down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThrottleReason {
	/// Window filled past the throttle threshold; proportional delay applied.
	Proportional,
	/// Window reached the ceiling; caller waits for the oldest entry to age out.
	Saturated,
	/// Server signalled `429`/`Retry-After`.
	Server,
}
impl ThrottleReason {
	/// Returns a stable label suitable for metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			ThrottleReason::Proportional => "proportional",
			ThrottleReason::Saturated => "saturated",
			ThrottleReason::Server => "server",
		}
	}
}
