//! Token endpoint client built on the `oauth2` crate.
//!
//! [`TokenEndpoint`] performs the two grants this crate needs (authorization code exchange
//! and refresh token rotation) through the caller's [`HttpTransport`] and converts both the
//! token responses into [`Credential`] snapshots and the failures into classified errors.

// crates.io
use oauth2::{
	AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, EndpointNotSet, EndpointSet,
	HttpClientError, RedirectUrl, RefreshToken, RequestTokenError, TokenResponse, TokenUrl,
	basic::{BasicClient, BasicErrorResponse, BasicRequestTokenError, BasicTokenResponse},
};
// self
use crate::{
	_prelude::*,
	auth::{Credential, ScopeSet},
	classify::{ErrorClassifier, TokenErrorContext, TokenGrant},
	config::{ClientAuthMethod, ClientConfig},
	error::{ConfigError, TransportError},
	http::{HttpTransport, OAuthHttpHandle, ResponseMetadata, ResponseMetadataSlot},
};

type ConfiguredBasicClient =
	BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Configured token endpoint client.
pub(crate) struct TokenEndpoint {
	oauth_client: ConfiguredBasicClient,
	transport: Arc<dyn HttpTransport>,
	classifier: Arc<dyn ErrorClassifier>,
	scope: ScopeSet,
	scope_delimiter: char,
}
impl TokenEndpoint {
	pub(crate) fn new(
		config: &ClientConfig,
		transport: Arc<dyn HttpTransport>,
		classifier: Arc<dyn ErrorClassifier>,
	) -> Result<Self> {
		let auth_url = AuthUrl::new(config.endpoints.authorization.to_string())
			.map_err(|source| ConfigError::InvalidUrl { source })?;
		let token_url = TokenUrl::new(config.endpoints.token.to_string())
			.map_err(|source| ConfigError::InvalidUrl { source })?;
		let redirect_url = RedirectUrl::new(config.redirect_uri.to_string())
			.map_err(|source| ConfigError::InvalidUrl { source })?;
		let mut oauth_client = BasicClient::new(ClientId::new(config.client_id.clone()))
			.set_auth_uri(auth_url)
			.set_token_uri(token_url)
			.set_redirect_uri(redirect_url);

		if let Some(secret) = &config.client_secret {
			oauth_client =
				oauth_client.set_client_secret(ClientSecret::new(secret.expose().to_owned()));
		}
		if matches!(config.client_auth, ClientAuthMethod::ClientSecretPost) {
			oauth_client = oauth_client.set_auth_type(AuthType::RequestBody);
		}

		Ok(Self {
			oauth_client,
			transport,
			classifier,
			scope: config.scope.clone(),
			scope_delimiter: config.scope_delimiter,
		})
	}

	/// Exchanges a one-time authorization code for a new credential.
	pub(crate) async fn exchange_code(
		&self,
		code: &str,
		now: OffsetDateTime,
	) -> Result<Credential> {
		let slot = ResponseMetadataSlot::default();
		let handle = OAuthHttpHandle::new(self.transport.clone(), slot.clone(), now);
		let response = self
			.oauth_client
			.exchange_code(AuthorizationCode::new(code.to_owned()))
			.request_async(&handle)
			.await
			.map_err(|err| {
				self.map_request_error(TokenGrant::AuthorizationCode, slot.take(), err)
			})?;

		self.credential_from_response(&response, &self.scope, None, now)
	}

	/// Redeems `refresh_token` for a replacement credential.
	///
	/// Providers that do not rotate refresh tokens keep the previous one.
	pub(crate) async fn refresh(
		&self,
		refresh_token: &str,
		current_scope: &ScopeSet,
		now: OffsetDateTime,
	) -> Result<Credential> {
		let slot = ResponseMetadataSlot::default();
		let handle = OAuthHttpHandle::new(self.transport.clone(), slot.clone(), now);
		let refresh_secret = RefreshToken::new(refresh_token.to_owned());
		let response = self
			.oauth_client
			.exchange_refresh_token(&refresh_secret)
			.request_async(&handle)
			.await
			.map_err(|err| self.map_request_error(TokenGrant::RefreshToken, slot.take(), err))?;

		self.credential_from_response(&response, current_scope, Some(refresh_token), now)
	}

	fn credential_from_response(
		&self,
		response: &BasicTokenResponse,
		fallback_scope: &ScopeSet,
		previous_refresh: Option<&str>,
		now: OffsetDateTime,
	) -> Result<Credential> {
		let expires_in = response.expires_in().ok_or(ConfigError::MissingExpiresIn)?.as_secs();
		let expires_in = i64::try_from(expires_in).map_err(|_| ConfigError::ExpiresInOutOfRange)?;

		if expires_in <= 0 {
			return Err(ConfigError::NonPositiveExpiresIn.into());
		}

		let scope = match response.scopes() {
			Some(scopes) => ScopeSet::new(
				scopes
					.iter()
					.flat_map(|scope| scope.split(self.scope_delimiter))
					.filter(|scope| !scope.is_empty()),
			)
			.map_err(ConfigError::from)?,
			None => fallback_scope.clone(),
		};
		let mut builder = Credential::builder()
			.access_token(response.access_token().secret().to_owned())
			.token_type(response.token_type().as_ref())
			.scope(scope)
			.issued_at(now)
			.expires_in(Duration::seconds(expires_in));
		let refresh =
			response.refresh_token().map(|token| token.secret().as_str()).or(previous_refresh);

		if let Some(refresh) = refresh {
			builder = builder.refresh_token(refresh);
		}

		builder.build().map_err(|e| ConfigError::from(e).into())
	}

	fn map_request_error(
		&self,
		grant: TokenGrant,
		meta: Option<ResponseMetadata>,
		err: BasicRequestTokenError<HttpClientError<TransportError>>,
	) -> Error {
		let status = meta.as_ref().and_then(|meta| meta.status);
		let retry_after = meta.as_ref().and_then(|meta| meta.retry_after);

		match err {
			RequestTokenError::ServerResponse(response) =>
				self.map_server_response(grant, response, status, retry_after),
			RequestTokenError::Request(error) => self.map_transport_error(error),
			RequestTokenError::Parse(source, body) => {
				let body = String::from_utf8_lossy(&body).into_owned();

				self.map_unexpected_response(grant, status, retry_after, body, &source)
			},
			RequestTokenError::Other(message) =>
				self.map_unexpected_response(grant, status, retry_after, String::new(), &message),
		}
	}

	fn map_server_response(
		&self,
		grant: TokenGrant,
		response: BasicErrorResponse,
		status: Option<u16>,
		retry_after: Option<Duration>,
	) -> Error {
		let mut ctx = TokenErrorContext::new(grant)
			.with_oauth_error(response.error().as_ref())
			.with_retry_after(retry_after);

		if let Some(description) = response.error_description() {
			ctx = ctx.with_error_description(description.clone());
		}
		if let Some(status) = status {
			ctx = ctx.with_http_status(status);
		}

		self.classifier.classify_token_error(&ctx).into()
	}

	fn map_transport_error(&self, err: HttpClientError<TransportError>) -> Error {
		match err {
			HttpClientError::Reqwest(inner) => self.classifier.classify_transport(&inner).into(),
			HttpClientError::Http(inner) => ConfigError::from(inner).into(),
			HttpClientError::Io(inner) =>
				self.classifier.classify_transport(&TransportError::Io(inner)).into(),
			HttpClientError::Other(message) => ApiError::network(format!(
				"HTTP client error occurred while calling the token endpoint: {message}."
			))
			.into(),
			_ => ApiError::network("HTTP client error occurred while calling the token endpoint.")
				.into(),
		}
	}

	fn map_unexpected_response(
		&self,
		grant: TokenGrant,
		status: Option<u16>,
		retry_after: Option<Duration>,
		body: String,
		detail: &dyn Display,
	) -> Error {
		match status {
			Some(code) if !(200..300).contains(&code) => {
				let mut ctx = TokenErrorContext::new(grant)
					.with_http_status(code)
					.with_retry_after(retry_after);

				if !body.is_empty() {
					ctx = ctx.with_body_preview(body);
				}

				self.classifier.classify_token_error(&ctx).into()
			},
			_ => {
				let mut err = ApiError::new(
					ApiErrorKind::Unknown,
					format!("Token endpoint returned an unexpected response: {detail}."),
				);

				if let Some(code) = status {
					err = err.with_status(code);
				}

				err.with_body(body).into()
			},
		}
	}
}
