//! Per-call retry state machine.
//!
//! `Pending → Dispatched → {Succeeded | Retrying → Dispatched | Failed}`. Only network and
//! server failures consume the attempt budget; `429` waits and the one-shot `401` recovery
//! are free. A transient failure of the credential refresh that precedes a dispatch draws on
//! the same budget.

// self
use crate::{_prelude::*, config::RetryPolicy};

const MIN_BACKOFF_STEP: Duration = Duration::milliseconds(1);

/// Lifecycle state of one logical call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CallState {
	/// Not dispatched yet.
	Pending,
	/// A request is in flight.
	Dispatched,
	/// Waiting before the next dispatch.
	Retrying,
	/// A 2xx response was returned.
	Succeeded,
	/// The call gave up and surfaced an error.
	Failed,
}

/// What the executor does after a classified failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Recovery {
	/// Sleep for the delay, then dispatch again.
	Backoff(Duration),
	/// Record the server throttle, then dispatch again once admitted.
	Throttled,
	/// Refresh the rejected credential, then dispatch again.
	Reauthenticate,
	/// Surface the error.
	GiveUp,
}

/// Retry bookkeeping for one logical call.
#[derive(Clone, Debug)]
pub(crate) struct RequestAttempt {
	dispatches: u32,
	budgeted_failures: u32,
	elapsed_backoff: Duration,
	last_backoff: Option<Duration>,
	last_error_kind: Option<ApiErrorKind>,
	auth_recovery_used: bool,
	state: CallState,
}
impl RequestAttempt {
	pub(crate) fn new() -> Self {
		Self {
			dispatches: 0,
			budgeted_failures: 0,
			elapsed_backoff: Duration::ZERO,
			last_backoff: None,
			last_error_kind: None,
			auth_recovery_used: false,
			state: CallState::Pending,
		}
	}

	pub(crate) fn state(&self) -> CallState {
		self.state
	}

	#[cfg_attr(not(feature = "tracing"), allow(dead_code))]
	pub(crate) fn dispatches(&self) -> u32 {
		self.dispatches
	}

	#[cfg_attr(not(feature = "tracing"), allow(dead_code))]
	pub(crate) fn last_error_kind(&self) -> Option<ApiErrorKind> {
		self.last_error_kind
	}

	pub(crate) fn dispatch(&mut self) {
		self.dispatches += 1;
		self.state = CallState::Dispatched;
	}

	pub(crate) fn succeed(&mut self) {
		self.state = CallState::Succeeded;
	}

	/// Marks the call failed for a reason outside the retry policy (local or deadline).
	pub(crate) fn fail(&mut self) {
		self.state = CallState::Failed;
	}

	/// Decides how to continue after `error`.
	///
	/// `jitter` is a sample from `[0, 1)`; `remaining` is the time left before the call's
	/// deadline.
	pub(crate) fn on_failure(
		&mut self,
		error: &ApiError,
		policy: &RetryPolicy,
		jitter: f64,
		remaining: Duration,
	) -> Recovery {
		self.last_error_kind = Some(error.kind);

		let recovery = match error.kind {
			ApiErrorKind::Authentication
				if error.status == Some(401)
					&& !error.reauthorization_required
					&& !self.auth_recovery_used =>
			{
				self.auth_recovery_used = true;

				Recovery::Reauthenticate
			},
			ApiErrorKind::RateLimited => Recovery::Throttled,
			ApiErrorKind::Network | ApiErrorKind::Server => {
				self.budgeted_failures += 1;

				self.backoff(error, policy, jitter, remaining)
			},
			_ => Recovery::GiveUp,
		};

		self.state =
			if recovery == Recovery::GiveUp { CallState::Failed } else { CallState::Retrying };

		recovery
	}

	/// Decides whether to retry after the credential refresh failed before a dispatch.
	pub(crate) fn on_refresh_failure(
		&mut self,
		error: &ApiError,
		policy: &RetryPolicy,
		jitter: f64,
		remaining: Duration,
	) -> Recovery {
		self.last_error_kind = Some(error.kind);

		let recovery = match error.kind {
			ApiErrorKind::Network | ApiErrorKind::Server => {
				self.budgeted_failures += 1;

				self.backoff(error, policy, jitter, remaining)
			},
			_ => Recovery::GiveUp,
		};

		self.state =
			if recovery == Recovery::GiveUp { CallState::Failed } else { CallState::Retrying };

		recovery
	}

	fn backoff(
		&mut self,
		error: &ApiError,
		policy: &RetryPolicy,
		jitter: f64,
		remaining: Duration,
	) -> Recovery {
		if self.budgeted_failures >= policy.max_attempts {
			return Recovery::GiveUp;
		}

		let exponent = (self.budgeted_failures - 1).min(30);
		let exponential = policy.base_delay.saturating_mul(1_i32 << exponent);
		let jittered = exponential * (1.0 + policy.jitter_factor * jitter.clamp(0.0, 1.0));
		let mut delay = jittered.min(policy.max_delay);

		if let Some(retry_after) = error.retry_after {
			delay = delay.max(retry_after);
		}
		if let Some(last) = self.last_backoff.filter(|last| delay <= *last) {
			delay = last + MIN_BACKOFF_STEP;
		}

		if self.elapsed_backoff + delay > policy.max_elapsed || delay >= remaining {
			return Recovery::GiveUp;
		}

		self.elapsed_backoff += delay;
		self.last_backoff = Some(delay);

		Recovery::Backoff(delay)
	}
}
