//! Sliding-window admission control with proportional throttling.
//!
//! Local accounting keeps requests under the vendor ceiling and spreads them out once the
//! window crosses the throttle threshold. A `429` from the server overrides local accounting
//! entirely until its `Retry-After` instant has passed.

// self
use crate::{
	_prelude::*,
	auth::{self, AccountId},
	clock::{self, Clock},
	config::{ClientConfig, RateLimitConfig},
	coord::{WindowBackend, WindowState},
	obs::{self, ThrottleReason},
};

const WINDOW_PURPOSE: &str = "rate";

/// Decision for the next request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
	/// Send immediately.
	Proceed,
	/// Send after waiting for the given duration.
	Delay(Duration),
	/// Nothing may be sent before `until`.
	Blocked {
		/// Earliest instant a request may be admitted.
		until: OffsetDateTime,
	},
}

/// Computes the admission decision for a window holding `state` at `now`.
pub fn admission_for(
	config: &RateLimitConfig,
	state: &WindowState,
	now: OffsetDateTime,
) -> Admission {
	if let Some(until) = state.throttled_until.filter(|until| *until > now) {
		return Admission::Blocked { until };
	}

	let prospective = state.count.saturating_add(1);

	if prospective > config.ceiling {
		let until = state.oldest.map_or(now, |oldest| oldest + config.window);

		return Admission::Blocked { until };
	}

	let start = config.throttle_start();
	let n = f64::from(prospective);

	if n <= start {
		return Admission::Proceed;
	}

	let fraction = (n - start) / (f64::from(config.ceiling) - start);

	Admission::Delay(config.max_throttle_delay * fraction)
}

/// Rate limiter for one window key, shared through a [`WindowBackend`].
#[derive(Clone)]
pub struct RateLimiter {
	config: RateLimitConfig,
	key: String,
	backend: Arc<dyn WindowBackend>,
	clock: Arc<dyn Clock>,
}
impl RateLimiter {
	/// Creates a limiter over an explicit window `key`.
	pub fn new(
		config: RateLimitConfig,
		key: impl Into<String>,
		backend: Arc<dyn WindowBackend>,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self { config, key: key.into(), backend, clock }
	}

	/// Creates a limiter whose window is scoped to `account` at the configured provider.
	pub fn for_account(
		config: &ClientConfig,
		account: &AccountId,
		backend: Arc<dyn WindowBackend>,
		clock: Arc<dyn Clock>,
	) -> Self {
		let key = auth::coordination_key(&config.provider, account, WINDOW_PURPOSE);

		Self::new(config.rate_limit.clone(), key, backend, clock)
	}

	/// Window key in the coordination backend.
	pub fn key(&self) -> &str {
		&self.key
	}

	/// Reports whether a request sent now would proceed, wait, or be blocked.
	pub async fn check_admission(&self) -> Result<Admission> {
		let now = self.clock.now();
		let state = self.backend.snapshot(&self.key, now, self.config.window).await?;

		Ok(admission_for(&self.config, &state, now))
	}

	/// Counts a request at the current instant unless the window is full or throttled.
	pub async fn record_request(&self) -> Result<WindowState> {
		let now = self.clock.now();

		Ok(self.backend.admit(&self.key, now, self.config.window, self.config.ceiling).await?)
	}

	/// Blocks admissions for `retry_after` (or the configured default) from now.
	///
	/// An existing later throttle is kept. Returns the effective throttle instant.
	pub async fn record_server_throttle(
		&self,
		retry_after: Option<Duration>,
	) -> Result<OffsetDateTime> {
		let wait = retry_after
			.filter(|wait| wait.is_positive())
			.unwrap_or(self.config.default_retry_after);
		let until = self.backend.throttle(&self.key, self.clock.now() + wait).await?;

		trace_event!(warn, key = %self.key, until = %until, "Server throttle recorded.");

		Ok(until)
	}

	/// Waits until a request may be sent and counts it.
	///
	/// Fails with a timed-out network error instead of waiting past `deadline`.
	pub async fn acquire(&self, deadline: OffsetDateTime) -> Result<WindowState> {
		loop {
			let now = self.clock.now();
			let state = self.backend.snapshot(&self.key, now, self.config.window).await?;
			let wait = match admission_for(&self.config, &state, now) {
				Admission::Proceed => Duration::ZERO,
				Admission::Delay(delay) => {
					obs::record_throttle(ThrottleReason::Proportional);

					delay
				},
				Admission::Blocked { until } => {
					let reason = if state.throttled_until.is_some() {
						ThrottleReason::Server
					} else {
						ThrottleReason::Saturated
					};

					obs::record_throttle(reason);

					self.wait_until(until, deadline).await?;

					continue;
				},
			};

			self.wait_until(now + wait, deadline).await?;

			let admitted = self.record_request().await?;

			if admitted.admitted {
				return Ok(admitted);
			}

			trace_event!(debug, key = %self.key, count = admitted.count, "Admission lost a race.");
		}
	}

	async fn wait_until(&self, until: OffsetDateTime, deadline: OffsetDateTime) -> Result<()> {
		if until > deadline {
			return Err(ApiError::deadline_exceeded("rate-limit admission").into());
		}
		if let Some(left) = clock::remaining(self.clock.as_ref(), until) {
			trace_event!(debug, key = %self.key, wait = %left, "Waiting for admission.");

			self.clock.sleep(left).await;
		}

		Ok(())
	}
}
impl Debug for RateLimiter {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RateLimiter").field("config", &self.config).field("key", &self.key).finish()
	}
}
