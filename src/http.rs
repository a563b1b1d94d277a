//! HTTP seam shared by the token endpoint client and the request executor.
//!
//! Everything that touches the network goes through [`HttpTransport`], a single-method trait
//! over `http` request/response values. The default [`ReqwestTransport`] applies the configured
//! connect/read timeouts; [`ScriptedTransport`] replays canned replies for tests and
//! simulations. The token endpoint is driven by the `oauth2` crate through an internal
//! [`AsyncHttpClient`] adapter that records response metadata in a [`ResponseMetadataSlot`]
//! so token errors can be classified with the HTTP status and `Retry-After` hint.

mod scripted;

pub use oauth2::{
	HttpRequest, HttpResponse,
	http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
};
pub use scripted::*;

// crates.io
use oauth2::{
	AsyncHttpClient, HttpClientError,
	http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER},
};
use serde::de::DeserializeOwned;
use time::format_description::well_known::Rfc2822;
// self
use crate::{_prelude::*, auth::Credential, error::ConfigError, error::TransportError};
#[cfg(feature = "reqwest")] use crate::{clock, config::Timeouts};

const JSON_MEDIA_TYPE: &str = "application/json";

/// Boxed future returned by [`HttpTransport::send`].
pub type TransportFuture<'a> =
	Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + 'a + Send>>;

/// Abstraction over HTTP stacks.
///
/// Implementations return `Ok` for every HTTP response regardless of status; only failures
/// where no response was received surface as [`TransportError`]. Redirects must not be
/// followed.
pub trait HttpTransport
where
	Self: 'static + Send + Sync,
{
	/// Sends one request and resolves with the full response body.
	fn send(&self, request: HttpRequest) -> TransportFuture<'_>;
}

/// Captures metadata from the most recent HTTP response for downstream error mapping.
#[derive(Clone, Debug, Default)]
pub struct ResponseMetadata {
	/// HTTP status code returned by the endpoint, if available.
	pub status: Option<u16>,
	/// Retry-After hint expressed as a relative duration.
	pub retry_after: Option<Duration>,
}

/// Thread-safe slot for sharing [`ResponseMetadata`] between transport and error layers.
#[derive(Clone, Debug, Default)]
pub struct ResponseMetadataSlot(Arc<Mutex<Option<ResponseMetadata>>>);
impl ResponseMetadataSlot {
	/// Stores new metadata for the current request.
	pub fn store(&self, meta: ResponseMetadata) {
		*self.0.lock() = Some(meta);
	}

	/// Returns the captured metadata, if any, consuming it from the slot.
	pub fn take(&self) -> Option<ResponseMetadata> {
		self.0.lock().take()
	}
}

/// reqwest-backed transport. Redirects are never followed.
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport(ReqwestClient);
#[cfg(feature = "reqwest")]
impl ReqwestTransport {
	/// Builds a client applying the connect timeout and bounding each exchange by the read
	/// timeout.
	pub fn new(timeouts: &Timeouts) -> Result<Self, ConfigError> {
		let client = ReqwestClient::builder()
			.connect_timeout(clock::to_std(timeouts.connect))
			.timeout(clock::to_std(timeouts.read))
			.redirect(reqwest::redirect::Policy::none())
			.build()?;

		Ok(Self(client))
	}

	/// Wraps an existing client. It should be configured to not follow redirects.
	pub fn with_client(client: ReqwestClient) -> Self {
		Self(client)
	}
}
#[cfg(feature = "reqwest")]
impl HttpTransport for ReqwestTransport {
	fn send(&self, request: HttpRequest) -> TransportFuture<'_> {
		Box::pin(async move {
			let request = reqwest::Request::try_from(request)?;
			let response = self.0.execute(request).await?;
			let status = response.status();
			let headers = response.headers().to_owned();
			let mut response_new = HttpResponse::new(response.bytes().await?.to_vec());

			*response_new.status_mut() = status;
			*response_new.headers_mut() = headers;

			Ok(response_new)
		})
	}
}

/// [`AsyncHttpClient`] handle the `oauth2` crate uses for token endpoint calls.
pub(crate) struct OAuthHttpHandle {
	transport: Arc<dyn HttpTransport>,
	slot: ResponseMetadataSlot,
	now: OffsetDateTime,
}
impl OAuthHttpHandle {
	pub(crate) fn new(
		transport: Arc<dyn HttpTransport>,
		slot: ResponseMetadataSlot,
		now: OffsetDateTime,
	) -> Self {
		Self { transport, slot, now }
	}
}
impl<'c> AsyncHttpClient<'c> for OAuthHttpHandle {
	type Error = HttpClientError<TransportError>;
	type Future = Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + 'c + Send>>;

	fn call(&'c self, request: HttpRequest) -> Self::Future {
		Box::pin(async move {
			self.slot.take();

			let response = self.transport.send(request).await.map_err(Box::new)?;
			let retry_after = parse_retry_after(response.headers(), self.now);

			self.slot
				.store(ResponseMetadata { status: Some(response.status().as_u16()), retry_after });

			Ok(response)
		})
	}
}

/// Parses `Retry-After` as delta-seconds or an HTTP date relative to `now`.
///
/// Dates in the past resolve to `None`.
pub fn parse_retry_after(headers: &HeaderMap, now: OffsetDateTime) -> Option<Duration> {
	let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

	if let Ok(secs) = raw.parse::<u32>() {
		return Some(Duration::seconds(i64::from(secs)));
	}
	if let Ok(moment) = OffsetDateTime::parse(raw, &Rfc2822) {
		let delta = moment - now;

		if delta.is_positive() {
			return Some(delta);
		}
	}

	None
}

/// Outbound API call described relative to the configured API base URL.
#[derive(Clone, Debug)]
pub struct ApiRequest {
	/// HTTP method.
	pub method: Method,
	/// Path relative to the API base; a leading `/` is ignored.
	pub path: String,
	/// Query parameters appended in order.
	pub query: Vec<(String, String)>,
	/// Extra headers. `Authorization` is always overwritten by the executor.
	pub headers: HeaderMap,
	/// Raw request body.
	pub body: Option<Vec<u8>>,
}
impl ApiRequest {
	/// Creates a request with the given method and path.
	pub fn new(method: Method, path: impl Into<String>) -> Self {
		Self {
			method,
			path: path.into(),
			query: Vec::new(),
			headers: HeaderMap::new(),
			body: None,
		}
	}

	/// Shorthand for a `GET` request.
	pub fn get(path: impl Into<String>) -> Self {
		Self::new(Method::GET, path)
	}

	/// Shorthand for a `POST` request.
	pub fn post(path: impl Into<String>) -> Self {
		Self::new(Method::POST, path)
	}

	/// Shorthand for a `PUT` request.
	pub fn put(path: impl Into<String>) -> Self {
		Self::new(Method::PUT, path)
	}

	/// Shorthand for a `PATCH` request.
	pub fn patch(path: impl Into<String>) -> Self {
		Self::new(Method::PATCH, path)
	}

	/// Shorthand for a `DELETE` request.
	pub fn delete(path: impl Into<String>) -> Self {
		Self::new(Method::DELETE, path)
	}

	/// Appends a query parameter.
	pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.query.push((name.into(), value.into()));

		self
	}

	/// Sets a header, replacing any previous value.
	pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
		self.headers.insert(name, value);

		self
	}

	/// Serializes `body` as JSON and sets the content type.
	pub fn json_body<T>(mut self, body: &T) -> Result<Self, ConfigError>
	where
		T: ?Sized + Serialize,
	{
		self.body = Some(serde_json::to_vec(body)?);
		self.headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_MEDIA_TYPE));

		Ok(self)
	}

	/// Resolves the target URL against `base`.
	///
	/// Paths that resolve outside `base` (absolute URLs or `..` segments) are rejected so the
	/// bearer token is never sent elsewhere.
	pub fn url(&self, base: &Url) -> Result<Url, ConfigError> {
		let relative = self.path.trim_start_matches('/');
		let mut url = base.join(relative).map_err(|source| ConfigError::InvalidPath {
			path: self.path.clone(),
			source,
		})?;

		if url.origin() != base.origin() || !url.path().starts_with(base.path()) {
			return Err(ConfigError::PathOutsideApiBase { path: self.path.clone() });
		}

		if !self.query.is_empty() {
			url.query_pairs_mut().extend_pairs(self.query.iter());
		}

		Ok(url)
	}

	/// Builds the wire request with the credential attached.
	pub(crate) fn to_http(
		&self,
		base: &Url,
		credential: &Credential,
	) -> Result<HttpRequest, ConfigError> {
		let url = self.url(base)?;
		let mut authorization = HeaderValue::from_str(&credential.authorization_header())
			.map_err(oauth2::http::Error::from)?;

		authorization.set_sensitive(true);

		let mut request = oauth2::http::Request::builder()
			.method(self.method.clone())
			.uri(url.as_str())
			.body(self.body.clone().unwrap_or_default())?;
		let headers = request.headers_mut();

		headers.extend(self.headers.clone());
		headers.insert(AUTHORIZATION, authorization);

		if !headers.contains_key(ACCEPT) {
			headers.insert(ACCEPT, HeaderValue::from_static(JSON_MEDIA_TYPE));
		}

		Ok(request)
	}
}

/// Successful (2xx) API response.
#[derive(Clone, Debug)]
pub struct ApiResponse {
	/// HTTP status.
	pub status: StatusCode,
	/// Response headers.
	pub headers: HeaderMap,
	/// Raw body bytes.
	pub body: Vec<u8>,
}
impl ApiResponse {
	/// Decodes the body as JSON, naming the offending path on failure.
	pub fn json<T>(&self) -> Result<T>
	where
		T: DeserializeOwned,
	{
		let mut deserializer = serde_json::Deserializer::from_slice(&self.body);

		Ok(serde_path_to_error::deserialize(&mut deserializer)?)
	}

	/// Body as (lossy) UTF-8 text.
	pub fn text(&self) -> String {
		String::from_utf8_lossy(&self.body).into_owned()
	}
}
impl From<HttpResponse> for ApiResponse {
	fn from(response: HttpResponse) -> Self {
		let (parts, body) = response.into_parts();

		Self { status: parts.status, headers: parts.headers, body }
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use time::macros;
	// self
	use super::*;

	fn credential() -> Credential {
		Credential::builder()
			.access_token("access-1")
			.expires_at(macros::datetime!(2030-01-01 00:00 UTC))
			.build()
			.expect("Credential fixture should build.")
	}

	#[test]
	fn retry_after_accepts_seconds_and_http_dates() {
		let now = macros::datetime!(2015-10-21 07:28 UTC);
		let mut headers = HeaderMap::new();

		headers.insert(RETRY_AFTER, HeaderValue::from_static("120"));

		assert_eq!(parse_retry_after(&headers, now), Some(Duration::seconds(120)));

		headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:30 GMT"));

		assert_eq!(parse_retry_after(&headers, now), Some(Duration::seconds(30)));

		headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:27:00 GMT"));

		assert_eq!(parse_retry_after(&headers, now), None);

		headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));

		assert_eq!(parse_retry_after(&headers, now), None);
	}

	#[test]
	fn request_joins_base_and_attaches_bearer_token() {
		let base = Url::parse("https://api.example.com/v2/").expect("Base URL should parse.");
		let request = ApiRequest::get("/contacts")
			.query("page", "2")
			.query("q", "a b")
			.header(AUTHORIZATION, HeaderValue::from_static("Bearer spoofed"))
			.to_http(&base, &credential())
			.expect("Request should build.");

		assert_eq!(request.uri(), "https://api.example.com/v2/contacts?page=2&q=a+b");
		assert_eq!(request.headers()[AUTHORIZATION], "Bearer access-1");
		assert_eq!(request.headers()[ACCEPT], JSON_MEDIA_TYPE);
		assert!(request.body().is_empty());
	}

	#[test]
	fn paths_outside_the_api_base_are_rejected() {
		let base = Url::parse("https://api.example.com/v2/").expect("Base URL should parse.");

		for path in ["https://attacker.example.net/steal", "../admin", "v2/../../v1/contacts"] {
			let err = ApiRequest::get(path)
				.to_http(&base, &credential())
				.expect_err("Token must not leave the API base.");

			assert!(matches!(err, ConfigError::PathOutsideApiBase { .. }), "{path}");
		}

		assert!(ApiRequest::get("deals/42/notes").url(&base).is_ok());
	}

	#[test]
	fn json_body_sets_content_type() {
		let request = ApiRequest::post("contacts")
			.json_body(&serde_json::json!({ "name": "Ada" }))
			.expect("Body should serialize.");

		assert_eq!(request.headers[CONTENT_TYPE], JSON_MEDIA_TYPE);
		assert_eq!(request.body.as_deref(), Some(br#"{"name":"Ada"}"#.as_slice()));
	}

	#[test]
	fn response_json_reports_failing_path() {
		#[derive(Debug, Deserialize)]
		struct Contact {
			#[allow(dead_code)]
			id: u64,
		}

		let response = ApiResponse {
			status: StatusCode::OK,
			headers: HeaderMap::new(),
			body: br#"{"id":"not-a-number"}"#.to_vec(),
		};
		let err = response.json::<Contact>().expect_err("Decoding should fail.");

		assert!(matches!(err, Error::Decode { ref path, .. } if path == "id"));
	}
}
