// self
use crate::{
	_prelude::*,
	auth::{ProviderId, ScopeSet, Secret},
	config::{
		ClientAuthMethod, ClientConfig, Endpoints, RateLimitConfig, RetryPolicy, Timeouts,
		default_refresh_lease_ttl, default_safety_margin, default_scope_delimiter,
	},
};

/// Errors raised while constructing or validating a [`ClientConfig`].
#[derive(Clone, Debug, PartialEq, ThisError)]
pub enum ConfigValidationError {
	/// A required endpoint was not supplied.
	#[error("Missing {endpoint} endpoint.")]
	MissingEndpoint {
		/// Which endpoint is missing.
		endpoint: &'static str,
	},
	/// Redirect URI was not supplied.
	#[error("Missing redirect URI.")]
	MissingRedirectUri,
	/// Client identifier is empty.
	#[error("Client identifier must not be empty.")]
	EmptyClientId,
	/// Endpoints must use HTTPS (plain HTTP is only accepted for loopback hosts).
	#[error("The {endpoint} endpoint must use HTTPS: {url}.")]
	InsecureEndpoint {
		/// Which endpoint failed validation.
		endpoint: &'static str,
		/// Endpoint URL that failed validation.
		url: String,
	},
	/// API base must be usable as a join base.
	#[error("The API base URL cannot be used as a base: {url}.")]
	ApiBaseNotABase {
		/// Offending URL.
		url: String,
	},
	/// Reject scope delimiters that are control characters.
	#[error("Scope delimiter must be a printable character.")]
	InvalidScopeDelimiter {
		/// Invalid delimiter that was supplied.
		delimiter: char,
	},
	/// Rate ceiling must admit at least one request.
	#[error("Rate limit ceiling must be greater than zero.")]
	ZeroCeiling,
	/// Throttle threshold must lie in `(0, 1]`.
	#[error("Throttle threshold must be within (0, 1], got {threshold}.")]
	InvalidThreshold {
		/// Supplied threshold.
		threshold: f64,
	},
	/// Retry policy must permit at least one attempt.
	#[error("Retry policy must allow at least one attempt.")]
	ZeroAttempts,
	/// Jitter factor must lie in `[0, 1]`.
	#[error("Jitter factor must be within [0, 1], got {factor}.")]
	InvalidJitter {
		/// Supplied factor.
		factor: f64,
	},
	/// A duration that must be positive was zero.
	#[error("The {field} duration must be positive.")]
	NonPositiveDuration {
		/// Which setting failed validation.
		field: &'static str,
	},
	/// Credentials must stay valid for longer than one call can take.
	#[error(
		"Safety margin ({margin}) must be longer than the overall call deadline ({overall})."
	)]
	SafetyMarginTooShort {
		/// Configured safety margin.
		margin: Duration,
		/// Configured overall deadline.
		overall: Duration,
	},
	/// The refresh lease must outlive the longest wait a caller may spend on a refresh.
	#[error("Refresh lease ({ttl}) must be longer than the overall call deadline ({overall}).")]
	RefreshLeaseTooShort {
		/// Configured lease lifetime.
		ttl: Duration,
		/// Configured overall deadline.
		overall: Duration,
	},
}

/// Builder for [`ClientConfig`] values.
#[derive(Debug)]
pub struct ClientConfigBuilder {
	/// Provider identifier.
	pub provider: ProviderId,
	/// OAuth client identifier.
	pub client_id: String,
	/// Optional client secret.
	pub client_secret: Option<Secret>,
	/// Redirect URI registered with the provider.
	pub redirect_uri: Option<Url>,
	/// Authorization endpoint.
	pub authorization_endpoint: Option<Url>,
	/// Token endpoint.
	pub token_endpoint: Option<Url>,
	/// API base URL.
	pub api_base: Option<Url>,
	/// Requested scopes.
	pub scope: ScopeSet,
	/// Scope delimiter for the authorize URL.
	pub scope_delimiter: char,
	/// Token endpoint client authentication.
	pub client_auth: ClientAuthMethod,
	/// Rate limiter settings.
	pub rate_limit: RateLimitConfig,
	/// Retry settings.
	pub retry: RetryPolicy,
	/// Timeouts.
	pub timeouts: Timeouts,
	/// Credential safety margin.
	pub safety_margin: Duration,
	/// Shared refresh lease lifetime.
	pub refresh_lease_ttl: Duration,
}
impl ClientConfigBuilder {
	/// Creates a new builder seeded with defaults for every tuning knob.
	pub fn new(provider: ProviderId, client_id: impl Into<String>) -> Self {
		Self {
			provider,
			client_id: client_id.into(),
			client_secret: None,
			redirect_uri: None,
			authorization_endpoint: None,
			token_endpoint: None,
			api_base: None,
			scope: ScopeSet::default(),
			scope_delimiter: default_scope_delimiter(),
			client_auth: ClientAuthMethod::default(),
			rate_limit: RateLimitConfig::default(),
			retry: RetryPolicy::default(),
			timeouts: Timeouts::default(),
			safety_margin: default_safety_margin(),
			refresh_lease_ttl: default_refresh_lease_ttl(),
		}
	}

	/// Sets the client secret.
	pub fn client_secret(mut self, secret: impl Into<String>) -> Self {
		self.client_secret = Some(Secret::new(secret));

		self
	}

	/// Sets the redirect URI.
	pub fn redirect_uri(mut self, url: Url) -> Self {
		self.redirect_uri = Some(url);

		self
	}

	/// Sets the authorization endpoint.
	pub fn authorization_endpoint(mut self, url: Url) -> Self {
		self.authorization_endpoint = Some(url);

		self
	}

	/// Sets the token endpoint.
	pub fn token_endpoint(mut self, url: Url) -> Self {
		self.token_endpoint = Some(url);

		self
	}

	/// Sets the API base URL. A trailing slash is appended when missing.
	pub fn api_base(mut self, url: Url) -> Self {
		self.api_base = Some(url);

		self
	}

	/// Sets the requested scopes.
	pub fn scope(mut self, scope: ScopeSet) -> Self {
		self.scope = scope;

		self
	}

	/// Overrides the scope delimiter.
	pub fn scope_delimiter(mut self, delimiter: char) -> Self {
		self.scope_delimiter = delimiter;

		self
	}

	/// Overrides the token endpoint client authentication.
	pub fn client_auth(mut self, method: ClientAuthMethod) -> Self {
		self.client_auth = method;

		self
	}

	/// Overrides the rate limiter settings.
	pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
		self.rate_limit = rate_limit;

		self
	}

	/// Overrides the retry settings.
	pub fn retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;

		self
	}

	/// Overrides the timeouts.
	pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
		self.timeouts = timeouts;

		self
	}

	/// Overrides the credential safety margin.
	pub fn safety_margin(mut self, margin: Duration) -> Self {
		self.safety_margin = margin;

		self
	}

	/// Overrides the shared refresh lease lifetime.
	pub fn refresh_lease_ttl(mut self, ttl: Duration) -> Self {
		self.refresh_lease_ttl = ttl;

		self
	}

	/// Consumes the builder and validates the resulting configuration.
	pub fn build(self) -> Result<ClientConfig, ConfigValidationError> {
		let authorization = self
			.authorization_endpoint
			.ok_or(ConfigValidationError::MissingEndpoint { endpoint: "authorization" })?;
		let token = self
			.token_endpoint
			.ok_or(ConfigValidationError::MissingEndpoint { endpoint: "token" })?;
		let api_base = self
			.api_base
			.map(normalize_base)
			.ok_or(ConfigValidationError::MissingEndpoint { endpoint: "api base" })?;
		let redirect_uri = self.redirect_uri.ok_or(ConfigValidationError::MissingRedirectUri)?;
		let config = ClientConfig {
			provider: self.provider,
			client_id: self.client_id,
			client_secret: self.client_secret,
			redirect_uri,
			endpoints: Endpoints { authorization, token, api_base },
			scope: self.scope,
			scope_delimiter: self.scope_delimiter,
			client_auth: self.client_auth,
			rate_limit: self.rate_limit,
			retry: self.retry,
			timeouts: self.timeouts,
			safety_margin: self.safety_margin,
			refresh_lease_ttl: self.refresh_lease_ttl,
		};

		config.validate()?;

		Ok(config)
	}
}

impl ClientConfig {
	/// Validates invariants for the configuration.
	///
	/// Deserialized configurations should be validated before use; the builder does it
	/// automatically.
	pub fn validate(&self) -> Result<(), ConfigValidationError> {
		if self.client_id.trim().is_empty() {
			return Err(ConfigValidationError::EmptyClientId);
		}

		validate_endpoint("authorization", &self.endpoints.authorization)?;
		validate_endpoint("token", &self.endpoints.token)?;
		validate_endpoint("api base", &self.endpoints.api_base)?;

		if self.endpoints.api_base.cannot_be_a_base() {
			return Err(ConfigValidationError::ApiBaseNotABase {
				url: self.endpoints.api_base.to_string(),
			});
		}
		if self.scope_delimiter.is_control() {
			return Err(ConfigValidationError::InvalidScopeDelimiter {
				delimiter: self.scope_delimiter,
			});
		}

		validate_rate_limit(&self.rate_limit)?;
		validate_retry(&self.retry)?;
		validate_positive("overall timeout", self.timeouts.overall)?;
		validate_positive("connect timeout", self.timeouts.connect)?;
		validate_positive("read timeout", self.timeouts.read)?;
		validate_positive("refresh lease", self.refresh_lease_ttl)?;

		if self.safety_margin <= self.timeouts.overall {
			return Err(ConfigValidationError::SafetyMarginTooShort {
				margin: self.safety_margin,
				overall: self.timeouts.overall,
			});
		}
		if self.refresh_lease_ttl <= self.timeouts.overall {
			return Err(ConfigValidationError::RefreshLeaseTooShort {
				ttl: self.refresh_lease_ttl,
				overall: self.timeouts.overall,
			});
		}

		Ok(())
	}
}

fn normalize_base(mut url: Url) -> Url {
	if !url.path().ends_with('/') {
		let path = format!("{}/", url.path());

		url.set_path(&path);
	}

	url
}

fn validate_endpoint(name: &'static str, url: &Url) -> Result<(), ConfigValidationError> {
	let secure = match url.scheme() {
		"https" => true,
		"http" => is_loopback(url),
		_ => false,
	};

	if secure {
		Ok(())
	} else {
		Err(ConfigValidationError::InsecureEndpoint { endpoint: name, url: url.to_string() })
	}
}

fn is_loopback(url: &Url) -> bool {
	match url.host() {
		Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
		Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
		Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
		None => false,
	}
}

fn validate_rate_limit(config: &RateLimitConfig) -> Result<(), ConfigValidationError> {
	if config.ceiling == 0 {
		return Err(ConfigValidationError::ZeroCeiling);
	}
	if !(config.throttle_threshold > 0.0 && config.throttle_threshold <= 1.0) {
		return Err(ConfigValidationError::InvalidThreshold {
			threshold: config.throttle_threshold,
		});
	}

	validate_positive("rate window", config.window)?;
	validate_positive("default retry-after", config.default_retry_after)?;

	if config.max_throttle_delay.is_negative() {
		return Err(ConfigValidationError::NonPositiveDuration { field: "max throttle delay" });
	}

	Ok(())
}

fn validate_retry(policy: &RetryPolicy) -> Result<(), ConfigValidationError> {
	if policy.max_attempts == 0 {
		return Err(ConfigValidationError::ZeroAttempts);
	}
	if !(0.0..=1.0).contains(&policy.jitter_factor) {
		return Err(ConfigValidationError::InvalidJitter { factor: policy.jitter_factor });
	}

	validate_positive("retry base delay", policy.base_delay)?;
	validate_positive("retry max delay", policy.max_delay)?;
	validate_positive("retry max elapsed", policy.max_elapsed)?;

	Ok(())
}

fn validate_positive(field: &'static str, value: Duration) -> Result<(), ConfigValidationError> {
	if value.is_positive() {
		Ok(())
	} else {
		Err(ConfigValidationError::NonPositiveDuration { field })
	}
}
