//! Executor-level error types: the classified [`ApiError`] taxonomy plus local failures.

// self
use crate::_prelude::*;

/// Crate-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Classified upstream (or transport) failure.
	#[error(transparent)]
	Api(#[from] ApiError),
	/// Local configuration or request construction problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Credential store failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Shared lock or rate window backend failure.
	#[error(transparent)]
	Coordination(#[from] crate::coord::CoordError),
	/// A successful response body could not be decoded into the requested type.
	#[error("Response body could not be decoded at `{path}`.")]
	Decode {
		/// JSON path of the offending value.
		path: String,
		/// Structured decoding failure.
		#[source]
		source: serde_json::Error,
	},
}
impl Error {
	/// Returns the classified API error, if this is one.
	pub fn api(&self) -> Option<&ApiError> {
		match self {
			Self::Api(err) => Some(err),
			_ => None,
		}
	}

	/// Returns the classified error kind, if this is an API error.
	pub fn kind(&self) -> Option<ApiErrorKind> {
		self.api().map(|err| err.kind)
	}
}
impl From<serde_path_to_error::Error<serde_json::Error>> for Error {
	fn from(e: serde_path_to_error::Error<serde_json::Error>) -> Self {
		let path = e.path().to_string();

		Self::Decode { path, source: e.into_inner() }
	}
}

/// Stable error categories surfaced to callers and consumed by the retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
	/// No usable response: connection failure, reset, or timeout.
	Network,
	/// Token invalid, expired, or refresh token revoked/rotated.
	Authentication,
	/// Token lacks the required scope.
	Authorization,
	/// Resource does not exist.
	NotFound,
	/// Request payload rejected, usually with field-level detail.
	Validation,
	/// Upstream quota exhausted; see [`ApiError::retry_after`].
	RateLimited,
	/// Upstream 5xx failure.
	Server,
	/// Unrecognized response shape; status and raw body are preserved.
	Unknown,
}
impl ApiErrorKind {
	/// Returns a stable label suitable for logs or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Network => "network",
			Self::Authentication => "authentication",
			Self::Authorization => "authorization",
			Self::NotFound => "not_found",
			Self::Validation => "validation",
			Self::RateLimited => "rate_limited",
			Self::Server => "server",
			Self::Unknown => "unknown",
		}
	}

	/// Returns `true` for kinds the executor retries internally.
	pub const fn is_transient(self) -> bool {
		matches!(self, Self::Network | Self::Server | Self::RateLimited)
	}
}
impl Display for ApiErrorKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Field-level validation detail returned by the upstream API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
	/// Field or JSON path the error refers to, when the API names one.
	pub field: Option<String>,
	/// Human-readable message.
	pub message: String,
	/// Machine-readable code, when supplied.
	pub code: Option<String>,
}
impl FieldError {
	/// Creates a field error with only a message.
	pub fn new(message: impl Into<String>) -> Self {
		Self { field: None, message: message.into(), code: None }
	}

	/// Attaches the field name.
	pub fn with_field(mut self, field: impl Into<String>) -> Self {
		self.field = Some(field.into());

		self
	}

	/// Attaches the machine-readable code.
	pub fn with_code(mut self, code: impl Into<String>) -> Self {
		self.code = Some(code.into());

		self
	}
}

/// Classified outcome of a failed call. Immutable once handed to callers.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("{kind} error: {message}")]
pub struct ApiError {
	/// Stable error category.
	pub kind: ApiErrorKind,
	/// HTTP status, when a response was received.
	pub status: Option<u16>,
	/// Human-readable message.
	pub message: String,
	/// Structured field-level errors (validation failures).
	pub field_errors: Vec<FieldError>,
	/// Server-provided `Retry-After` hint.
	pub retry_after: Option<Duration>,
	/// Raw response body preserved for unrecognized shapes.
	pub body: Option<String>,
	/// Set when recovery needs a new authorization-code flow rather than a retry.
	pub reauthorization_required: bool,
	/// Set when the failure is a local or transport deadline.
	pub timed_out: bool,
}
impl ApiError {
	/// Creates an error of the given kind.
	pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			status: None,
			message: message.into(),
			field_errors: Vec::new(),
			retry_after: None,
			body: None,
			reauthorization_required: false,
			timed_out: false,
		}
	}

	/// Shorthand for a [`ApiErrorKind::Network`] error.
	pub fn network(message: impl Into<String>) -> Self {
		Self::new(ApiErrorKind::Network, message)
	}

	/// Network error raised when a call's deadline passes while it is waiting.
	pub fn deadline_exceeded(stage: &str) -> Self {
		Self::network(format!("Deadline exceeded while waiting for {stage}.")).into_timed_out()
	}

	/// Authentication error that can only be resolved by re-authorizing.
	pub fn reauthorization_required(message: impl Into<String>) -> Self {
		let mut err = Self::new(ApiErrorKind::Authentication, message);

		err.reauthorization_required = true;

		err
	}

	/// Attaches the HTTP status.
	pub fn with_status(mut self, status: u16) -> Self {
		self.status = Some(status);

		self
	}

	/// Attaches field-level errors.
	pub fn with_field_errors(mut self, errors: Vec<FieldError>) -> Self {
		self.field_errors = errors;

		self
	}

	/// Attaches a retry-after hint.
	pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
		self.retry_after = retry_after;

		self
	}

	/// Attaches the raw body.
	pub fn with_body(mut self, body: impl Into<String>) -> Self {
		self.body = Some(body.into());

		self
	}

	/// Marks the error as a timeout.
	pub fn into_timed_out(mut self) -> Self {
		self.timed_out = true;

		self
	}

	/// Returns `true` if the executor may retry this error.
	pub fn is_transient(&self) -> bool {
		self.kind.is_transient()
	}
}

/// Configuration and request construction failures.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// HTTP request construction failed.
	#[error(transparent)]
	HttpRequest(#[from] oauth2::http::Error),
	/// Configured URL cannot be used by the OAuth client.
	#[error("Configured URL is invalid.")]
	InvalidUrl {
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// Request path cannot be joined onto the API base URL.
	#[error("Request path `{path}` cannot be joined onto the API base URL.")]
	InvalidPath {
		/// Offending path.
		path: String,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// Request path resolves outside the API base URL.
	#[error("Request path `{path}` resolves outside the API base URL.")]
	PathOutsideApiBase {
		/// Offending path.
		path: String,
	},
	/// Request body could not be serialized.
	#[error("Request body could not be serialized.")]
	BodySerialization(#[from] serde_json::Error),
	/// Client configuration failed validation.
	#[error(transparent)]
	Validation(#[from] crate::config::ConfigValidationError),
	/// Credential builder validation failed.
	#[error("Unable to build credential.")]
	CredentialBuild(#[from] crate::auth::CredentialBuilderError),
	/// No HTTP transport was supplied and the default reqwest transport is disabled.
	#[error("An HTTP transport must be supplied when the `reqwest` feature is disabled.")]
	MissingTransport,
	/// Token endpoint response omitted `expires_in`.
	#[error("Token endpoint response is missing expires_in.")]
	MissingExpiresIn,
	/// Token endpoint returned an excessively large `expires_in`.
	#[error("The expires_in value exceeds the supported range.")]
	ExpiresInOutOfRange,
	/// Token endpoint returned a non-positive duration.
	#[error("The expires_in value must be positive.")]
	NonPositiveExpiresIn,
	/// Token endpoint returned scopes that fail validation.
	#[error("Token endpoint returned invalid scopes.")]
	InvalidScope(#[from] crate::auth::ScopeValidationError),
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Transport-level failures (no HTTP response was received).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Connect or read deadline elapsed.
	#[error("Request timed out.")]
	Timeout {
		/// Transport-specific timeout error.
		#[source]
		source: BoxError,
	},
	/// Connection refused, reset, DNS or TLS failure.
	#[error("Network error occurred while calling the upstream API.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while calling the upstream API.")]
	Io(#[from] std::io::Error),
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}

	/// Wraps a transport-specific timeout error.
	pub fn timeout(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Timeout { source: Box::new(src) }
	}

	/// Returns `true` for deadline failures.
	pub fn is_timeout(&self) -> bool {
		matches!(self, Self::Timeout { .. })
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		if e.is_timeout() { Self::timeout(e) } else { Self::network(e) }
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn transient_kinds_match_retry_policy() {
		assert!(ApiErrorKind::Network.is_transient());
		assert!(ApiErrorKind::Server.is_transient());
		assert!(ApiErrorKind::RateLimited.is_transient());
		assert!(!ApiErrorKind::Validation.is_transient());
		assert!(!ApiErrorKind::Authentication.is_transient());
		assert!(!ApiErrorKind::Unknown.is_transient());
	}

	#[test]
	fn reauthorization_errors_are_distinct_from_plain_auth_failures() {
		let plain = ApiError::new(ApiErrorKind::Authentication, "token rejected").with_status(401);
		let reauth = ApiError::reauthorization_required("refresh token revoked");

		assert_eq!(plain.kind, reauth.kind);
		assert!(!plain.reauthorization_required);
		assert!(reauth.reauthorization_required);
		assert_eq!(reauth.to_string(), "authentication error: refresh token revoked");
	}

	#[test]
	fn error_exposes_classified_kind() {
		let err: Error = ApiError::deadline_exceeded("admission").into();

		assert_eq!(err.kind(), Some(ApiErrorKind::Network));
		assert!(err.api().is_some_and(|api| api.timed_out));
	}
}
