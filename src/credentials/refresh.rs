//! Single-flight refresh path.
//!
//! Callers for one account queue on a keyed async mutex inside the process and on an expiring
//! lease across processes. Whoever gets through re-reads the store first: if the credential was
//! already rotated by an earlier holder it is reused without a token call. Otherwise the
//! refresh token is redeemed and the result is written back with a compare-and-swap on the old
//! refresh token, so a writer that lost the lease can never overwrite a newer rotation. The
//! token call itself is abandoned once the lease expires, before another holder may take it.

// self
use super::{CredentialManager, missing_credential, record_outcome};
use crate::{
	_prelude::*,
	auth::{self, Credential},
	clock,
	obs::{self, OpKind, OpOutcome, OpSpan},
	store::CompareAndSwapOutcome,
};

const LEASE_PURPOSE: &str = "refresh";
const LEASE_POLL_INTERVAL: Duration = Duration::milliseconds(50);

impl CredentialManager {
	/// Rotates the credential unless a usable one appears while waiting.
	///
	/// With `stale` set, a stored credential whose access token equals it is never reused even
	/// when its expiry still looks fine; the API already rejected it.
	pub(super) async fn refresh(
		&self,
		deadline: OffsetDateTime,
		stale: Option<&str>,
	) -> Result<Credential> {
		const KIND: OpKind = OpKind::Refresh;

		let stage = if stale.is_some() { "force_refresh" } else { "refresh" };
		let span = OpSpan::new(KIND, stage);

		self.metrics.record_attempt();
		obs::record_op_outcome(KIND, OpOutcome::Attempt);

		let result = span.instrument(self.refresh_single_flight(deadline, stale)).await;

		if result.is_err() {
			self.metrics.record_failure();
		}

		record_outcome(KIND, &result);

		result
	}

	async fn refresh_single_flight(
		&self,
		deadline: OffsetDateTime,
		stale: Option<&str>,
	) -> Result<Credential> {
		let _singleflight = self.lock_flow_guard(deadline).await?;

		let current = self.store.load(&self.account).await?;

		if let Some(current) = current.filter(|current| self.is_reusable(current, stale)) {
			self.metrics.record_reuse();

			return Ok(current);
		}

		let key = auth::coordination_key(&self.config.provider, &self.account, LEASE_PURPOSE);
		let lease_expires_at = self.acquire_lease(&key, deadline).await?;
		let result = self.refresh_under_lease(deadline.min(lease_expires_at), stale).await;

		if let Err(_e) = self.locks.release(&key, &self.holder).await {
			trace_event!(warn, error = %_e, key = %key, "Refresh lease release failed.");
		}

		result
	}

	/// Polls the shared lease until it is taken, returning when it expires.
	async fn acquire_lease(&self, key: &str, deadline: OffsetDateTime) -> Result<OffsetDateTime> {
		loop {
			let ttl = self.config.refresh_lease_ttl;
			let now = self.clock.now();

			if self.locks.try_acquire(key, &self.holder, ttl, now).await? {
				return Ok(now + ttl);
			}

			let left = clock::remaining(self.clock.as_ref(), deadline)
				.ok_or_else(|| ApiError::deadline_exceeded("refresh lease"))?;

			self.clock.sleep(left.min(LEASE_POLL_INTERVAL)).await;
		}
	}

	/// `cutoff` is the earlier of the caller's deadline and the lease expiry.
	async fn refresh_under_lease(
		&self,
		cutoff: OffsetDateTime,
		stale: Option<&str>,
	) -> Result<Credential> {
		// Another process may have rotated while this one waited for the lease.
		let current = self.store.load(&self.account).await?.ok_or_else(missing_credential)?;

		if self.is_reusable(&current, stale) {
			self.metrics.record_reuse();

			return Ok(current);
		}

		let refresh_token = current.refresh_secret().ok_or_else(|| {
			ApiError::reauthorization_required("Stored credential has no refresh token.")
		})?;
		let now = self.clock.now();
		let refreshed = self
			.bounded(cutoff, "token refresh", async {
				self.token_endpoint.refresh(refresh_token, &current.scope, now).await
			})
			.await;
		let refreshed = match refreshed {
			Ok(credential) => credential,
			Err(Error::Api(err)) if err.reauthorization_required =>
				return self.discard_revoked(refresh_token, err).await,
			Err(e) => return Err(e),
		};

		match self
			.store
			.compare_and_swap_refresh(&self.account, refresh_token, refreshed.clone())
			.await?
		{
			CompareAndSwapOutcome::Updated => {
				self.metrics.record_rotation();

				trace_event!(debug, account = %self.account, "Rotated credential.");

				Ok(refreshed)
			},
			CompareAndSwapOutcome::RefreshMismatch => {
				let adopted =
					self.store.load(&self.account).await?.ok_or_else(missing_credential)?;

				self.metrics.record_reuse();

				trace_event!(debug, account = %self.account, "Adopted a concurrent rotation.");

				Ok(adopted)
			},
			CompareAndSwapOutcome::Missing => Err(ApiError::reauthorization_required(
				"Credential was cleared while a refresh was in flight.",
			)
			.into()),
		}
	}

	/// Clears the credential whose refresh token was rejected, unless another writer already
	/// replaced it; a newer credential is adopted instead.
	async fn discard_revoked(&self, refresh_token: &str, err: ApiError) -> Result<Credential> {
		match self.store.compare_and_clear_refresh(&self.account, refresh_token).await? {
			CompareAndSwapOutcome::Updated => {
				trace_event!(
					warn,
					account = %self.account,
					"Refresh token rejected; cleared stored credential."
				);

				Err(err.into())
			},
			CompareAndSwapOutcome::RefreshMismatch => {
				let Some(adopted) = self.store.load(&self.account).await? else {
					return Err(err.into());
				};

				self.metrics.record_reuse();

				trace_event!(
					debug,
					account = %self.account,
					"Rejected refresh token was already rotated; adopted the stored credential."
				);

				Ok(adopted)
			},
			CompareAndSwapOutcome::Missing => Err(err.into()),
		}
	}

	fn is_reusable(&self, credential: &Credential, stale: Option<&str>) -> bool {
		let replaced = stale.is_none_or(|stale| credential.access_token.expose() != stale);

		replaced && credential.is_valid_at(self.clock.now(), self.config.safety_margin)
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use time::macros;
	// self
	use super::*;
	use crate::{
		auth::{AccountId, ProviderId},
		clock::ManualClock,
		config::ClientConfig,
		config::Timeouts,
		coord::{LockBackend, MemoryCoordinator},
		http::{ScriptedReply, ScriptedTransport},
		store::{CredentialStore, MemoryStore, StoreFuture},
	};

	const TOKEN_PATH: &str = "/oauth/token";
	const START: OffsetDateTime = macros::datetime!(2025-03-01 12:00 UTC);

	struct Fixture {
		manager: CredentialManager,
		transport: Arc<ScriptedTransport>,
		store: Arc<MemoryStore>,
		locks: Arc<MemoryCoordinator>,
	}

	/// Write applied by [`RacingStore`] right before the manager's next compare operation.
	enum Race {
		Rotate(Credential),
		Clear,
	}

	/// Store that lets another writer slip in between the manager's load and its
	/// compare-and-swap (or compare-and-clear).
	struct RacingStore {
		inner: Arc<MemoryStore>,
		race: Mutex<Option<Race>>,
	}
	impl RacingStore {
		async fn apply_race(&self, account: &AccountId) -> Result<(), crate::store::StoreError> {
			let race = self.race.lock().take();

			match race {
				Some(Race::Rotate(credential)) => self.inner.save(account, credential).await,
				Some(Race::Clear) => self.inner.clear(account).await.map(|_| ()),
				None => Ok(()),
			}
		}
	}
	impl CredentialStore for RacingStore {
		fn load<'a>(&'a self, account: &'a AccountId) -> StoreFuture<'a, Option<Credential>> {
			self.inner.load(account)
		}

		fn save<'a>(
			&'a self,
			account: &'a AccountId,
			credential: Credential,
		) -> StoreFuture<'a, ()> {
			self.inner.save(account, credential)
		}

		fn clear<'a>(&'a self, account: &'a AccountId) -> StoreFuture<'a, Option<Credential>> {
			self.inner.clear(account)
		}

		fn compare_and_swap_refresh<'a>(
			&'a self,
			account: &'a AccountId,
			expected_refresh: &'a str,
			replacement: Credential,
		) -> StoreFuture<'a, CompareAndSwapOutcome> {
			Box::pin(async move {
				self.apply_race(account).await?;

				self.inner.compare_and_swap_refresh(account, expected_refresh, replacement).await
			})
		}

		fn compare_and_clear_refresh<'a>(
			&'a self,
			account: &'a AccountId,
			expected_refresh: &'a str,
		) -> StoreFuture<'a, CompareAndSwapOutcome> {
			Box::pin(async move {
				self.apply_race(account).await?;

				self.inner.compare_and_clear_refresh(account, expected_refresh).await
			})
		}
	}

	fn config(timeouts: Timeouts, refresh_lease_ttl: Duration) -> ClientConfig {
		let parse = |raw: &str| Url::parse(raw).expect("Fixture URL should parse.");
		let provider = ProviderId::new("vendor").expect("Provider id should be valid.");

		ClientConfig::builder(provider, "cid")
			.redirect_uri(parse("https://app.example.com/callback"))
			.authorization_endpoint(parse("https://vendor.example.com/oauth/authorize"))
			.token_endpoint(parse("https://vendor.example.com/oauth/token"))
			.api_base(parse("https://api.vendor.example.com/"))
			.timeouts(timeouts)
			.refresh_lease_ttl(refresh_lease_ttl)
			.build()
			.expect("Config should build.")
	}

	fn fixture(stored: Credential) -> Fixture {
		fixture_with(config(Timeouts::default(), Duration::seconds(30)), stored, None)
	}

	fn racing_fixture(stored: Credential, race: Race) -> Fixture {
		fixture_with(config(Timeouts::default(), Duration::seconds(30)), stored, Some(race))
	}

	fn fixture_with(config: ClientConfig, stored: Credential, race: Option<Race>) -> Fixture {
		let account = AccountId::new("acct").expect("Account id should be valid.");
		let transport = Arc::new(ScriptedTransport::new());
		let store = Arc::new(MemoryStore::with_credential(account.clone(), stored));
		let locks = Arc::new(MemoryCoordinator::new());
		let manager_store: Arc<dyn CredentialStore> = match race {
			Some(race) =>
				Arc::new(RacingStore { inner: store.clone(), race: Mutex::new(Some(race)) }),
			None => store.clone(),
		};
		let manager = CredentialManager::builder(config, account)
			.store(manager_store)
			.locks(locks.clone())
			.transport(transport.clone())
			.clock(Arc::new(ManualClock::new(START)))
			.build()
			.expect("Manager should build.");

		Fixture { manager, transport, store, locks }
	}

	fn credential(access: &str, refresh: Option<&str>, expires_in: Duration) -> Credential {
		let mut builder =
			Credential::builder().access_token(access).issued_at(START).expires_in(expires_in);

		if let Some(refresh) = refresh {
			builder = builder.refresh_token(refresh);
		}

		builder.build().expect("Credential fixture should build.")
	}

	fn token_reply(access: &str, refresh: &str) -> ScriptedReply {
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

	#[tokio::test]
	async fn expiring_credential_is_rotated_and_persisted() {
		let fx = fixture(credential("old", Some("r1"), Duration::seconds(10)));

		fx.transport.enqueue(TOKEN_PATH, token_reply("new", "r2"));

		let fresh = fx.manager.valid_credential().await.expect("Refresh should succeed.");
		let stored = fx
			.store
			.load(fx.manager.account())
			.await
			.expect("Store should load.")
			.expect("Credential should be stored.");

		assert_eq!(fresh.access_token.expose(), "new");
		assert_eq!(stored, fresh);
		assert_eq!(fx.transport.requests()[0].form_param("refresh_token").as_deref(), Some("r1"));
		assert_eq!(fx.manager.refresh_metrics().rotations(), 1);
	}

	#[tokio::test]
	async fn valid_credential_skips_the_token_endpoint() {
		let fx = fixture(credential("current", Some("r1"), Duration::hours(1)));
		let current = fx.manager.valid_credential().await.expect("Fast path should succeed.");

		assert_eq!(current.access_token.expose(), "current");
		assert_eq!(fx.transport.calls(TOKEN_PATH), 0);
		assert_eq!(fx.manager.refresh_metrics().attempts(), 0);
	}

	#[tokio::test]
	async fn forced_refresh_reuses_an_already_replaced_token() {
		let fx = fixture(credential("newer", Some("r2"), Duration::hours(1)));
		let current = fx.manager.force_refresh("older").await.expect("Reuse should succeed.");

		assert_eq!(current.access_token.expose(), "newer");
		assert_eq!(fx.transport.calls(TOKEN_PATH), 0);
		assert_eq!(fx.manager.refresh_metrics().reuses(), 1);
	}

	#[tokio::test]
	async fn forced_refresh_rotates_a_rejected_token_that_looks_valid() {
		let fx = fixture(credential("rejected", Some("r1"), Duration::hours(1)));

		fx.transport.enqueue(TOKEN_PATH, token_reply("replacement", "r2"));

		let current = fx.manager.force_refresh("rejected").await.expect("Refresh should succeed.");

		assert_eq!(current.access_token.expose(), "replacement");
		assert_eq!(fx.transport.calls(TOKEN_PATH), 1);
	}

	#[tokio::test]
	async fn missing_refresh_token_requires_reauthorization() {
		let fx = fixture(credential("old", None, Duration::seconds(5)));
		let err = fx.manager.valid_credential().await.expect_err("Refresh is impossible.");

		assert!(err.api().is_some_and(|api| api.reauthorization_required));
		assert_eq!(fx.transport.calls(TOKEN_PATH), 0);
		assert_eq!(fx.manager.refresh_metrics().failures(), 1);
	}

	#[tokio::test]
	async fn revoked_refresh_token_clears_the_store() {
		let fx = fixture(credential("old", Some("r1"), Duration::ZERO));

		fx.transport.enqueue(
			TOKEN_PATH,
			ScriptedReply::json(400, serde_json::json!({ "error": "invalid_grant" })),
		);

		let err = fx.manager.valid_credential().await.expect_err("Refresh should fail.");

		assert!(err.api().is_some_and(|api| api.reauthorization_required));
		assert_eq!(fx.store.load(fx.manager.account()).await.expect("Store should load."), None);
	}

	#[tokio::test]
	async fn foreign_lease_holder_bounds_the_wait_by_the_deadline() {
		let fx = fixture(credential("old", Some("r1"), Duration::ZERO));
		let key = auth::coordination_key(
			&fx.manager.config().provider,
			fx.manager.account(),
			LEASE_PURPOSE,
		);
		let acquired = fx
			.locks
			.try_acquire(&key, "other-process", Duration::minutes(5), START)
			.await
			.expect("Lease backend should respond.");

		assert!(acquired);

		let err = fx
			.manager
			.force_refresh_until("old", START + Duration::seconds(2))
			.await
			.expect_err("Lease never frees up.");

		assert!(err.api().is_some_and(|api| api.timed_out));
		assert_eq!(fx.transport.calls(TOKEN_PATH), 0);
	}

	#[tokio::test]
	async fn lease_is_released_after_refresh() {
		let fx = fixture(credential("old", Some("r1"), Duration::ZERO));

		fx.transport.enqueue(TOKEN_PATH, token_reply("new", "r2"));
		fx.manager.valid_credential().await.expect("Refresh should succeed.");

		let key = auth::coordination_key(
			&fx.manager.config().provider,
			fx.manager.account(),
			LEASE_PURPOSE,
		);
		let acquired = fx
			.locks
			.try_acquire(&key, "other-process", Duration::minutes(5), START)
			.await
			.expect("Lease backend should respond.");

		assert!(acquired);
	}

	#[tokio::test]
	async fn concurrent_rotation_is_adopted_instead_of_overwritten() {
		let rotated_elsewhere = credential("elsewhere", Some("r9"), Duration::hours(1));
		let fx = racing_fixture(
			credential("old", Some("r1"), Duration::ZERO),
			Race::Rotate(rotated_elsewhere.clone()),
		);

		fx.transport.enqueue(TOKEN_PATH, token_reply("mine", "r2"));

		let current = fx.manager.valid_credential().await.expect("Rotation should be adopted.");
		let stored = fx.store.load(fx.manager.account()).await.expect("Store should load.");

		assert_eq!(current, rotated_elsewhere);
		assert_eq!(stored, Some(rotated_elsewhere));
		assert_eq!(fx.manager.refresh_metrics().rotations(), 0);
		assert_eq!(fx.manager.refresh_metrics().reuses(), 1);
	}

	#[tokio::test]
	async fn credential_cleared_mid_refresh_requires_reauthorization() {
		let fx = racing_fixture(credential("old", Some("r1"), Duration::ZERO), Race::Clear);

		fx.transport.enqueue(TOKEN_PATH, token_reply("mine", "r2"));

		let err = fx.manager.valid_credential().await.expect_err("Logout wins.");

		assert!(err.api().is_some_and(|api| api.reauthorization_required));
		assert_eq!(fx.store.load(fx.manager.account()).await.expect("Store should load."), None);
	}

	#[tokio::test]
	async fn revoked_grant_keeps_a_newer_rotation() {
		let rotated_elsewhere = credential("elsewhere", Some("r9"), Duration::hours(1));
		let fx = racing_fixture(
			credential("old", Some("r1"), Duration::ZERO),
			Race::Rotate(rotated_elsewhere.clone()),
		);

		fx.transport.enqueue(
			TOKEN_PATH,
			ScriptedReply::json(400, serde_json::json!({ "error": "invalid_grant" })),
		);

		let current = fx.manager.valid_credential().await.expect("Newer credential is adopted.");
		let stored = fx.store.load(fx.manager.account()).await.expect("Store should load.");

		assert_eq!(current, rotated_elsewhere);
		assert_eq!(stored, Some(rotated_elsewhere));
	}

	#[tokio::test]
	async fn token_call_is_abandoned_when_the_lease_expires() {
		let timeouts = Timeouts { overall: Duration::milliseconds(100), ..Default::default() };
		let fx = fixture_with(
			config(timeouts, Duration::milliseconds(200)),
			credential("old", Some("r1"), Duration::ZERO),
			None,
		);

		fx.transport.set_latency(std::time::Duration::from_secs(5));
		fx.transport.enqueue(TOKEN_PATH, token_reply("late", "r2"));

		let err = fx
			.manager
			.force_refresh_until("old", START + Duration::hours(1))
			.await
			.expect_err("Lease expires long before the reply.");
		let stored = fx
			.store
			.load(fx.manager.account())
			.await
			.expect("Store should load.")
			.expect("Credential should be kept.");

		assert!(err.api().is_some_and(|api| api.timed_out));
		assert_eq!(fx.transport.calls(TOKEN_PATH), 1);
		assert_eq!(stored.refresh_secret(), Some("r1"));
	}
}
