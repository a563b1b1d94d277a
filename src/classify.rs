//! Response classification into the fixed [`ApiErrorKind`] taxonomy.
//!
//! The executor never inspects status codes itself; every non-2xx response, transport
//! failure, and token endpoint rejection passes through an [`ErrorClassifier`]. The
//! [`DefaultErrorClassifier`] understands the common vendor body shapes (top-level
//! `message`/`error_description`, nested `error` objects, and field error lists or maps).

// crates.io
use serde_json::{Map, Value};
// self
use crate::{
	_prelude::*,
	error::{FieldError, TransportError},
};

const BODY_PREVIEW_LIMIT: usize = 256;
const MESSAGE_KEYS: [&str; 5] = ["message", "error_description", "detail", "title", "error"];
const FIELD_LIST_KEYS: [&str; 3] = ["errors", "field_errors", "details"];
const FIELD_NAME_KEYS: [&str; 5] = ["field", "property", "path", "param", "pointer"];
const FIELD_MESSAGE_KEYS: [&str; 4] = ["message", "msg", "detail", "description"];

/// Strategy hook mapping raw failures into [`ApiError`] values.
///
/// Implementors are required to be `Send + Sync`. Override only what a vendor needs;
/// [`classify_transport`](ErrorClassifier::classify_transport) has a default implementation.
pub trait ErrorClassifier
where
	Self: Send + Sync,
{
	/// Classifies a non-2xx API response.
	fn classify_response(&self, response: &ResponseContext<'_>) -> ApiError;

	/// Classifies an OAuth error returned by the token endpoint.
	fn classify_token_error(&self, ctx: &TokenErrorContext) -> ApiError;

	/// Classifies a failure where no response was received.
	fn classify_transport(&self, error: &TransportError) -> ApiError {
		let err = ApiError::network(format!("{error}"));

		if error.is_timeout() { err.into_timed_out() } else { err }
	}
}

/// Non-2xx response handed to [`ErrorClassifier::classify_response`].
#[derive(Clone, Copy, Debug)]
pub struct ResponseContext<'a> {
	/// HTTP status code.
	pub status: u16,
	/// Parsed `Retry-After` header.
	pub retry_after: Option<Duration>,
	/// Raw response body.
	pub body: &'a [u8],
}

/// Grant associated with a failing token endpoint request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenGrant {
	/// Authorization code exchange.
	AuthorizationCode,
	/// Refresh token rotation.
	RefreshToken,
}
impl TokenGrant {
	/// Returns the RFC 6749 `grant_type` value.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::AuthorizationCode => "authorization_code",
			Self::RefreshToken => "refresh_token",
		}
	}
}
impl Display for TokenGrant {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Context passed to classifiers for token endpoint failures.
///
/// Keeps only primitive data so classifiers stay decoupled from the HTTP stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenErrorContext {
	/// Grant type associated with the failing request.
	pub grant: TokenGrant,
	/// HTTP status code returned by the provider, when available.
	pub http_status: Option<u16>,
	/// Provider-supplied OAuth `error` field.
	pub oauth_error: Option<String>,
	/// Provider-supplied OAuth `error_description` field.
	pub error_description: Option<String>,
	/// Parsed `Retry-After` header.
	pub retry_after: Option<Duration>,
	/// Preview of the response body for payloads that were not OAuth errors.
	pub body_preview: Option<String>,
}
impl TokenErrorContext {
	/// Creates a new context scoped to the provided grant.
	pub fn new(grant: TokenGrant) -> Self {
		Self {
			grant,
			http_status: None,
			oauth_error: None,
			error_description: None,
			retry_after: None,
			body_preview: None,
		}
	}

	/// Adds an HTTP status code.
	pub fn with_http_status(mut self, status: u16) -> Self {
		self.http_status = Some(status);

		self
	}

	/// Adds the OAuth error code string returned by the provider.
	pub fn with_oauth_error(mut self, error: impl Into<String>) -> Self {
		self.oauth_error = Some(error.into());

		self
	}

	/// Adds the OAuth `error_description` field.
	pub fn with_error_description(mut self, description: impl Into<String>) -> Self {
		self.error_description = Some(description.into());

		self
	}

	/// Adds a retry hint.
	pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
		self.retry_after = retry_after;

		self
	}

	/// Adds a truncated body preview.
	pub fn with_body_preview(mut self, body: impl Into<String>) -> Self {
		self.body_preview = Some(truncate_preview(body.into()));

		self
	}
}

/// Default classifier applying status-code rules plus common vendor body shapes.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultErrorClassifier;
impl ErrorClassifier for DefaultErrorClassifier {
	fn classify_response(&self, response: &ResponseContext<'_>) -> ApiError {
		let parsed = serde_json::from_slice::<Value>(response.body).ok();
		let field_errors = parsed.as_ref().map(extract_field_errors).unwrap_or_default();
		let message = parsed
			.as_ref()
			.and_then(extract_message)
			.unwrap_or_else(|| format!("Upstream API returned HTTP {}.", response.status));
		let kind = match response.status {
			401 => ApiErrorKind::Authentication,
			403 => ApiErrorKind::Authorization,
			404 => ApiErrorKind::NotFound,
			408 => ApiErrorKind::Network,
			422 => ApiErrorKind::Validation,
			400 if !field_errors.is_empty() => ApiErrorKind::Validation,
			429 => ApiErrorKind::RateLimited,
			500..=599 => ApiErrorKind::Server,
			_ => ApiErrorKind::Unknown,
		};
		let mut err = ApiError::new(kind, message)
			.with_status(response.status)
			.with_field_errors(field_errors)
			.with_retry_after(response.retry_after);

		if kind == ApiErrorKind::Network {
			err = err.into_timed_out();
		}
		if kind == ApiErrorKind::Unknown || parsed.is_none() {
			err = err.with_body(String::from_utf8_lossy(response.body));
		}

		err
	}

	fn classify_token_error(&self, ctx: &TokenErrorContext) -> ApiError {
		let detail = ctx
			.error_description
			.as_deref()
			.or(ctx.oauth_error.as_deref())
			.or(ctx.body_preview.as_deref())
			.unwrap_or("no details");
		let message = format!("Token endpoint rejected the {} request: {detail}.", ctx.grant);
		let mut err = match ctx.oauth_error.as_deref().and_then(classify_oauth_error) {
			Some(OAuthErrorClass::Revoked) => ApiError::reauthorization_required(message),
			Some(OAuthErrorClass::Kind(kind)) => ApiError::new(kind, message),
			None => ApiError::new(classify_token_status(ctx.http_status), message),
		};

		if let Some(status) = ctx.http_status {
			err = err.with_status(status);
		}
		if let Some(body) = &ctx.body_preview {
			err = err.with_body(body.clone());
		}

		err.with_retry_after(ctx.retry_after)
	}
}

enum OAuthErrorClass {
	Revoked,
	Kind(ApiErrorKind),
}

fn classify_oauth_error(code: &str) -> Option<OAuthErrorClass> {
	let class = match code.to_ascii_lowercase().as_str() {
		"invalid_grant" | "access_denied" => OAuthErrorClass::Revoked,
		"invalid_client" | "unauthorized_client" | "invalid_token" =>
			OAuthErrorClass::Kind(ApiErrorKind::Authentication),
		"invalid_scope" | "insufficient_scope" =>
			OAuthErrorClass::Kind(ApiErrorKind::Authorization),
		"invalid_request" | "unsupported_grant_type" | "unsupported_response_type" =>
			OAuthErrorClass::Kind(ApiErrorKind::Validation),
		"slow_down" => OAuthErrorClass::Kind(ApiErrorKind::RateLimited),
		"temporarily_unavailable" | "server_error" => OAuthErrorClass::Kind(ApiErrorKind::Server),
		_ => return None,
	};

	Some(class)
}

fn classify_token_status(status: Option<u16>) -> ApiErrorKind {
	match status {
		Some(400 | 401) => ApiErrorKind::Authentication,
		Some(403) => ApiErrorKind::Authorization,
		Some(408) => ApiErrorKind::Network,
		Some(429) => ApiErrorKind::RateLimited,
		Some(500..=599) => ApiErrorKind::Server,
		_ => ApiErrorKind::Unknown,
	}
}

fn extract_message(value: &Value) -> Option<String> {
	let object = value.as_object()?;

	for key in MESSAGE_KEYS {
		match object.get(key) {
			Some(Value::String(text)) if !text.trim().is_empty() => return Some(text.clone()),
			Some(nested @ Value::Object(_)) =>
				if let Some(text) = extract_message(nested) {
					return Some(text);
				},
			_ => {},
		}
	}

	None
}

fn extract_field_errors(value: &Value) -> Vec<FieldError> {
	let Some(object) = value.as_object() else {
		return Vec::new();
	};

	for key in FIELD_LIST_KEYS {
		let errors = match object.get(key) {
			Some(Value::Array(items)) => items.iter().filter_map(field_error_from_item).collect(),
			Some(Value::Object(map)) => field_errors_from_map(map),
			_ => Vec::new(),
		};

		if !errors.is_empty() {
			return errors;
		}
	}

	match object.get("error") {
		Some(nested @ Value::Object(_)) => extract_field_errors(nested),
		_ => Vec::new(),
	}
}

fn field_error_from_item(item: &Value) -> Option<FieldError> {
	match item {
		Value::String(message) => Some(FieldError::new(message.clone())),
		Value::Object(object) => {
			let message = first_string(object, &FIELD_MESSAGE_KEYS)?;
			let mut error = FieldError::new(message);

			if let Some(field) = first_string(object, &FIELD_NAME_KEYS) {
				error = error.with_field(field);
			}
			if let Some(code) = object.get("code").and_then(scalar_to_string) {
				error = error.with_code(code);
			}

			Some(error)
		},
		_ => None,
	}
}

fn field_errors_from_map(map: &Map<String, Value>) -> Vec<FieldError> {
	let mut errors = Vec::new();

	for (field, messages) in map {
		match messages {
			Value::String(message) =>
				errors.push(FieldError::new(message.clone()).with_field(field.clone())),
			Value::Array(items) =>
				for message in items.iter().filter_map(Value::as_str) {
					errors.push(FieldError::new(message).with_field(field.clone()));
				},
			_ => {},
		}
	}

	errors
}

fn first_string(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
	keys.iter().find_map(|key| object.get(*key).and_then(Value::as_str)).map(str::to_owned)
}

fn scalar_to_string(value: &Value) -> Option<String> {
	match value {
		Value::String(text) => Some(text.clone()),
		Value::Number(number) => Some(number.to_string()),
		_ => None,
	}
}

fn truncate_preview(body: String) -> String {
	if body.chars().count() <= BODY_PREVIEW_LIMIT {
		return body;
	}

	let mut buf = body.chars().take(BODY_PREVIEW_LIMIT).collect::<String>();

	buf.push('…');

	buf
}
