//! Credential snapshots, validity checks, and the rotation-friendly builder.

// self
use crate::{
	_prelude::*,
	auth::{ScopeSet, Secret},
};

const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Validity of a credential relative to an instant and a safety margin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialStatus {
	/// Expiry lies beyond the safety margin; safe to attach.
	Valid,
	/// Not yet expired but inside the safety margin; must be refreshed before use.
	Expiring,
	/// Expiry has passed.
	Expired,
}

/// Errors produced by [`CredentialBuilder`].
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum CredentialBuilderError {
	/// Issued when no access token value was provided.
	#[error("Access token is required.")]
	MissingAccessToken,
	/// Issued when no expiry (absolute or relative) was configured.
	#[error("Expiry must be supplied via expires_at or expires_in.")]
	MissingExpiry,
}

/// Authentication material for one account connection.
///
/// Credentials are replaced wholesale on every refresh; callers only ever hold clones.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
	/// Access token attached to outbound requests.
	pub access_token: Secret,
	/// Single-use refresh token, if the provider issued one.
	pub refresh_token: Option<Secret>,
	/// Token type reported by the provider (normally `Bearer`).
	pub token_type: String,
	/// Scopes granted to the credential.
	pub scope: ScopeSet,
	/// Instant the provider issued the credential.
	pub issued_at: OffsetDateTime,
	/// Absolute expiry instant.
	pub expires_at: OffsetDateTime,
}
impl Credential {
	/// Returns a builder for a new credential.
	pub fn builder() -> CredentialBuilder {
		CredentialBuilder::default()
	}

	/// Computes the validity status at `instant` given the safety `margin`.
	pub fn status_at(&self, instant: OffsetDateTime, margin: Duration) -> CredentialStatus {
		if instant >= self.expires_at {
			CredentialStatus::Expired
		} else if self.expires_at - instant <= margin {
			CredentialStatus::Expiring
		} else {
			CredentialStatus::Valid
		}
	}

	/// Returns `true` if the credential may be attached to a request sent at `instant`.
	pub fn is_valid_at(&self, instant: OffsetDateTime, margin: Duration) -> bool {
		matches!(self.status_at(instant, margin), CredentialStatus::Valid)
	}

	/// Value for the `Authorization` header.
	pub fn authorization_header(&self) -> String {
		let scheme = if self.token_type.eq_ignore_ascii_case("bearer") {
			DEFAULT_TOKEN_TYPE
		} else {
			self.token_type.as_str()
		};

		format!("{scheme} {}", self.access_token.expose())
	}

	/// Refresh token value, if any.
	pub fn refresh_secret(&self) -> Option<&str> {
		self.refresh_token.as_ref().map(Secret::expose)
	}
}
impl Debug for Credential {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Credential")
			.field("access_token", &self.access_token)
			.field("refresh_token", &self.refresh_token)
			.field("token_type", &self.token_type)
			.field("scope", &self.scope)
			.field("issued_at", &self.issued_at)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

/// Builder for [`Credential`].
#[derive(Clone, Debug, Default)]
pub struct CredentialBuilder {
	access_token: Option<Secret>,
	refresh_token: Option<Secret>,
	token_type: Option<String>,
	scope: ScopeSet,
	issued_at: Option<OffsetDateTime>,
	expires_at: Option<OffsetDateTime>,
	expires_in: Option<Duration>,
}
impl CredentialBuilder {
	/// Provides the access token value.
	pub fn access_token(mut self, token: impl Into<String>) -> Self {
		self.access_token = Some(Secret::new(token));

		self
	}

	/// Provides the refresh token value.
	pub fn refresh_token(mut self, token: impl Into<String>) -> Self {
		self.refresh_token = Some(Secret::new(token));

		self
	}

	/// Overrides the token type (defaults to `Bearer`).
	pub fn token_type(mut self, token_type: impl Into<String>) -> Self {
		self.token_type = Some(token_type.into());

		self
	}

	/// Sets the granted scopes.
	pub fn scope(mut self, scope: ScopeSet) -> Self {
		self.scope = scope;

		self
	}

	/// Sets the issued-at instant.
	pub fn issued_at(mut self, instant: OffsetDateTime) -> Self {
		self.issued_at = Some(instant);

		self
	}

	/// Sets an absolute expiry instant.
	pub fn expires_at(mut self, instant: OffsetDateTime) -> Self {
		self.expires_at = Some(instant);

		self
	}

	/// Sets a relative expiry duration from the issued instant.
	pub fn expires_in(mut self, duration: Duration) -> Self {
		self.expires_in = Some(duration);

		self
	}

	/// Consumes the builder and produces a [`Credential`].
	pub fn build(self) -> Result<Credential, CredentialBuilderError> {
		let access_token = self.access_token.ok_or(CredentialBuilderError::MissingAccessToken)?;
		let issued_at = self.issued_at.unwrap_or_else(OffsetDateTime::now_utc);
		let expires_at = match (self.expires_at, self.expires_in) {
			(Some(instant), _) => instant,
			(None, Some(delta)) => issued_at + delta,
			(None, None) => return Err(CredentialBuilderError::MissingExpiry),
		};

		Ok(Credential {
			access_token,
			refresh_token: self.refresh_token,
			token_type: self.token_type.unwrap_or_else(|| DEFAULT_TOKEN_TYPE.into()),
			scope: self.scope,
			issued_at,
			expires_at,
		})
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use time::macros;
	// self
	use super::*;

	fn fixture() -> Credential {
		Credential::builder()
			.access_token("access")
			.refresh_token("refresh")
			.token_type("bearer")
			.issued_at(macros::datetime!(2025-01-01 00:00 UTC))
			.expires_in(Duration::hours(1))
			.build()
			.expect("Credential fixture should build.")
	}

	#[test]
	fn status_respects_the_safety_margin() {
		let credential = fixture();
		let margin = Duration::seconds(30);

		assert_eq!(
			credential.status_at(macros::datetime!(2025-01-01 00:30 UTC), margin),
			CredentialStatus::Valid
		);
		assert_eq!(
			credential.status_at(macros::datetime!(2025-01-01 00:59:30 UTC), margin),
			CredentialStatus::Expiring
		);
		assert_eq!(
			credential.status_at(macros::datetime!(2025-01-01 01:00 UTC), margin),
			CredentialStatus::Expired
		);
		assert!(!credential.is_valid_at(macros::datetime!(2025-01-01 00:59:45 UTC), margin));
	}

	#[test]
	fn authorization_header_normalizes_bearer() {
		let credential = fixture();

		assert_eq!(credential.authorization_header(), "Bearer access");
		assert_eq!(credential.refresh_secret(), Some("refresh"));
	}

	#[test]
	fn builder_requires_token_and_expiry() {
		assert_eq!(
			Credential::builder().expires_in(Duration::MINUTE).build(),
			Err(CredentialBuilderError::MissingAccessToken)
		);
		assert_eq!(
			Credential::builder().access_token("a").build(),
			Err(CredentialBuilderError::MissingExpiry)
		);
	}

	#[test]
	fn debug_output_redacts_tokens() {
		let rendered = format!("{:?}", fixture());

		assert!(!rendered.contains("access\""));
		assert!(rendered.contains("<redacted>"));
	}
}
