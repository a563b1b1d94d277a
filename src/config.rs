//! Client configuration consumed (never loaded) by the executor core.
//!
//! [`ClientConfig`] carries the OAuth client registration, endpoints, and the tuning knobs
//! for the rate limiter, retry policy, and timeouts. Values can be assembled with
//! [`ClientConfigBuilder`] or deserialized by the caller from any serde format; durations are
//! expressed in (fractional) seconds. Either way [`ClientConfig::validate`] enforces the
//! invariants the core relies on.

/// Builder and validation logic.
pub mod builder;

pub use builder::*;

// self
use crate::{
	_prelude::*,
	auth::{ProviderId, ScopeSet, Secret},
};

/// How the client authenticates against the token endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
	#[default]
	/// HTTP Basic with `client_id`/`client_secret`.
	ClientSecretBasic,
	/// Form POST body parameters for `client_id`/`client_secret`.
	ClientSecretPost,
}

/// Endpoint set for the upstream provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
	/// Authorization endpoint end-users are redirected to.
	pub authorization: Url,
	/// Token endpoint used for code exchanges and refreshes.
	pub token: Url,
	/// Base URL every API request path is joined onto.
	pub api_base: Url,
}

/// Sliding-window admission settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
	/// Maximum requests admitted within one window.
	pub ceiling: u32,
	/// Fraction of the ceiling after which proportional delays kick in.
	pub throttle_threshold: f64,
	/// Delay applied when the window is one request short of the ceiling.
	#[serde(with = "duration_secs")]
	pub max_throttle_delay: Duration,
	/// Length of the trailing window.
	#[serde(with = "duration_secs")]
	pub window: Duration,
	/// Wait applied after a `429` that carried no `Retry-After`.
	#[serde(with = "duration_secs")]
	pub default_retry_after: Duration,
}
impl RateLimitConfig {
	/// Number of requests that may be admitted before throttling starts.
	pub fn throttle_start(&self) -> f64 {
		f64::from(self.ceiling) * self.throttle_threshold
	}
}
impl Default for RateLimitConfig {
	fn default() -> Self {
		Self {
			ceiling: 200,
			throttle_threshold: 0.7,
			max_throttle_delay: Duration::SECOND,
			window: Duration::MINUTE,
			default_retry_after: Duration::seconds(10),
		}
	}
}

/// Retry and backoff settings for one logical call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
	/// Maximum dispatches for budgeted (network/server) failures, including the first.
	pub max_attempts: u32,
	/// Delay before the first retry.
	#[serde(with = "duration_secs")]
	pub base_delay: Duration,
	/// Cap for a single backoff delay.
	#[serde(with = "duration_secs")]
	pub max_delay: Duration,
	/// Cap for the cumulative backoff of one call.
	#[serde(with = "duration_secs")]
	pub max_elapsed: Duration,
	/// Upper bound of the random extra delay, as a fraction of the computed delay.
	pub jitter_factor: f64,
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_delay: Duration::milliseconds(500),
			max_delay: Duration::seconds(8),
			max_elapsed: Duration::seconds(20),
			jitter_factor: 0.2,
		}
	}
}

/// Transport and per-call deadlines.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
	/// TCP/TLS connect timeout.
	#[serde(with = "duration_secs")]
	pub connect: Duration,
	/// Read timeout for one HTTP exchange.
	#[serde(with = "duration_secs")]
	pub read: Duration,
	/// Deadline for one logical call, including refresh, admission, and retries.
	#[serde(with = "duration_secs")]
	pub overall: Duration,
}
impl Default for Timeouts {
	fn default() -> Self {
		Self {
			connect: Duration::seconds(5),
			read: Duration::seconds(10),
			overall: Duration::seconds(25),
		}
	}
}

/// Complete client configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
	/// Provider identifier; namespaces coordination keys.
	pub provider: ProviderId,
	/// OAuth client identifier.
	pub client_id: String,
	/// OAuth client secret.
	#[serde(default)]
	pub client_secret: Option<Secret>,
	/// Redirect URI registered with the provider.
	pub redirect_uri: Url,
	/// Provider endpoints.
	pub endpoints: Endpoints,
	/// Scopes requested during authorization.
	#[serde(default)]
	pub scope: ScopeSet,
	/// Character used to join scopes in the authorize URL.
	#[serde(default = "default_scope_delimiter")]
	pub scope_delimiter: char,
	/// Token endpoint client authentication.
	#[serde(default)]
	pub client_auth: ClientAuthMethod,
	/// Rate limiter settings.
	#[serde(default)]
	pub rate_limit: RateLimitConfig,
	/// Retry settings.
	#[serde(default)]
	pub retry: RetryPolicy,
	/// Timeouts.
	#[serde(default)]
	pub timeouts: Timeouts,
	/// Minimum remaining lifetime for a credential to be attached to a request.
	#[serde(default = "default_safety_margin", with = "duration_secs")]
	pub safety_margin: Duration,
	/// Lifetime of the shared refresh lease held while a refresh is in flight. Must exceed
	/// the overall call deadline; a token call never outlives the lease.
	#[serde(default = "default_refresh_lease_ttl", with = "duration_secs")]
	pub refresh_lease_ttl: Duration,
}
impl ClientConfig {
	/// Creates a new builder for the provided provider/client pair.
	pub fn builder(provider: ProviderId, client_id: impl Into<String>) -> ClientConfigBuilder {
		ClientConfigBuilder::new(provider, client_id)
	}
}

fn default_scope_delimiter() -> char {
	' '
}

fn default_safety_margin() -> Duration {
	Duration::seconds(30)
}

fn default_refresh_lease_ttl() -> Duration {
	Duration::seconds(30)
}

/// Serde adapter representing [`Duration`] as fractional seconds.
mod duration_secs {
	// crates.io
	use serde::{Deserializer, Serializer, de::Error as DeError};
	// self
	use crate::_prelude::*;

	pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_f64(value.as_seconds_f64())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let secs = f64::deserialize(deserializer)?;

		if secs < 0.0 {
			return Err(DeError::custom("duration must be a non-negative number of seconds"));
		}

		Duration::checked_seconds_f64(secs)
			.ok_or_else(|| DeError::custom("duration is out of range"))
	}
}
