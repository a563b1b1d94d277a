//! Fixtures shared by the integration tests.

#![allow(dead_code)]

// std
use std::sync::Arc;
// crates.io
use time::{Duration, OffsetDateTime, macros};
use url::Url;
// self
use oauth2_executor::{
	auth::{AccountId, Credential, ProviderId, ScopeSet},
	clock::{Clock, ManualClock},
	config::ClientConfig,
	coord::MemoryCoordinator,
	executor::RequestExecutor,
	http::{ScriptedReply, ScriptedTransport},
	store::MemoryStore,
};

pub const START: OffsetDateTime = macros::datetime!(2025-03-01 12:00 UTC);
pub const TOKEN_PATH: &str = "/oauth/token";

pub fn url(value: &str) -> Url {
	Url::parse(value).expect("Fixture URL should parse.")
}

pub fn account(name: &str) -> AccountId {
	AccountId::new(name).expect("Account identifier fixture should be valid.")
}

/// Configuration pointing at `https://vendor.example.com` (token) and
/// `https://api.vendor.example.com/v1/` (API).
pub fn config() -> ClientConfig {
	config_with_hosts("https://vendor.example.com", "https://api.vendor.example.com/v1/")
}

pub fn config_with_hosts(oauth_base: &str, api_base: &str) -> ClientConfig {
	let provider = ProviderId::new("vendor").expect("Provider identifier should be valid.");

	ClientConfig::builder(provider, "client-1")
		.client_secret("secret-1")
		.redirect_uri(url("https://app.example.com/oauth/callback"))
		.authorization_endpoint(url(&format!("{oauth_base}/oauth/authorize")))
		.token_endpoint(url(&format!("{oauth_base}{TOKEN_PATH}")))
		.api_base(url(api_base))
		.scope(ScopeSet::new(["contacts", "deals"]).expect("Scope fixture should be valid."))
		.build()
		.expect("Client config fixture should build.")
}

pub fn credential(
	access: &str,
	refresh: &str,
	issued_at: OffsetDateTime,
	expires_in: Duration,
) -> Credential {
	Credential::builder()
		.access_token(access)
		.refresh_token(refresh)
		.issued_at(issued_at)
		.expires_in(expires_in)
		.build()
		.expect("Credential fixture should build.")
}

pub fn token_reply(access: &str, refresh: &str) -> ScriptedReply {
	ScriptedReply::json(
		200,
		serde_json::json!({
			"access_token": access,
			"refresh_token": refresh,
			"token_type": "bearer",
			"expires_in": 3600
		}),
	)
}

/// Executor wired to scripted transport, in-memory backends, and a manual clock at
/// [`START`].
pub struct Harness {
	pub executor: RequestExecutor,
	pub transport: Arc<ScriptedTransport>,
	pub store: Arc<MemoryStore>,
	pub clock: ManualClock,
}
impl Harness {
	/// Seeds a credential valid for one hour.
	pub fn new(config: ClientConfig) -> Self {
		let seeded = credential("access-1", "refresh-1", START, Duration::hours(1));

		Self::with_credential(config, seeded)
	}

	pub fn with_credential(config: ClientConfig, seeded: Credential) -> Self {
		let account = account("acct-1");
		let transport = Arc::new(ScriptedTransport::new());
		let store = Arc::new(MemoryStore::with_credential(account.clone(), seeded));
		let clock = ManualClock::new(START);
		let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
		let executor = RequestExecutor::builder(config, account)
			.store(store.clone())
			.coordinator(Arc::new(MemoryCoordinator::new()))
			.transport(transport.clone())
			.clock(shared_clock)
			.build()
			.expect("Executor fixture should build.");

		Self { executor, transport, store, clock }
	}
}
