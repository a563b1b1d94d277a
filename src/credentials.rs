//! Credential lifecycle: authorization URL, code exchange, and valid-credential acquisition.
//!
//! [`CredentialManager`] is the only writer to the [`CredentialStore`]. Fast-path reads hand
//! out the stored snapshot when it is valid beyond the safety margin; otherwise the caller
//! enters the single-flight refresh path (see [`refresh`]), which serializes rotations per
//! account within the process (keyed async mutex) and across processes (shared lease).

mod refresh;

mod metrics;

pub use metrics::RefreshMetrics;

// self
use crate::{
	_prelude::*,
	auth::{AccountId, Credential},
	classify::{DefaultErrorClassifier, ErrorClassifier},
	clock::{self, Clock, SystemClock},
	config::ClientConfig,
	coord::{LockBackend, MemoryCoordinator},
	error::ConfigError,
	http::HttpTransport,
	oauth::TokenEndpoint,
	obs::{self, OpKind, OpOutcome, OpSpan},
	store::{CredentialStore, MemoryStore},
};

type FlowGuards = Arc<Mutex<HashMap<AccountId, Arc<AsyncMutex<()>>>>>;

/// Owns one account's credential lifecycle.
///
/// Clones share the store, coordination backend, metrics, and single-flight guards.
#[derive(Clone)]
pub struct CredentialManager {
	config: Arc<ClientConfig>,
	account: AccountId,
	store: Arc<dyn CredentialStore>,
	locks: Arc<dyn LockBackend>,
	token_endpoint: Arc<TokenEndpoint>,
	clock: Arc<dyn Clock>,
	metrics: Arc<RefreshMetrics>,
	flow_guards: FlowGuards,
	holder: Arc<str>,
}
impl CredentialManager {
	/// Starts a builder for `account` under `config`.
	pub fn builder(config: ClientConfig, account: AccountId) -> CredentialManagerBuilder {
		CredentialManagerBuilder::new(config, account)
	}

	/// Returns a manager for another account sharing every backend and guard registry.
	pub fn for_account(&self, account: AccountId) -> Self {
		Self { account, ..self.clone() }
	}

	/// Account this manager serves.
	pub fn account(&self) -> &AccountId {
		&self.account
	}

	/// Configuration in effect.
	pub fn config(&self) -> &ClientConfig {
		&self.config
	}

	/// Refresh path counters.
	pub fn refresh_metrics(&self) -> &RefreshMetrics {
		&self.metrics
	}

	/// Builds the provider authorize URL. No network call is made and `state` is not stored.
	pub fn authorization_url(&self, state: &str) -> Url {
		let mut url = self.config.endpoints.authorization.clone();

		{
			let mut pairs = url.query_pairs_mut();

			pairs
				.append_pair("response_type", "code")
				.append_pair("client_id", &self.config.client_id)
				.append_pair("redirect_uri", self.config.redirect_uri.as_str());

			if let Some(scope) = self.config.scope.join(self.config.scope_delimiter) {
				pairs.append_pair("scope", &scope);
			}

			pairs.append_pair("state", state);
		}

		url
	}

	/// Exchanges a one-time authorization code and stores the resulting credential.
	pub async fn exchange_authorization_code(&self, code: &str) -> Result<Credential> {
		const KIND: OpKind = OpKind::AuthorizationCode;

		let span = OpSpan::new(KIND, "exchange_authorization_code");

		obs::record_op_outcome(KIND, OpOutcome::Attempt);

		let result = span
			.instrument(async move {
				let deadline = self.default_deadline();
				let _singleflight = self.lock_flow_guard(deadline).await?;
				let now = self.clock.now();
				let credential = self
					.bounded(deadline, "authorization code exchange", async {
						self.token_endpoint.exchange_code(code, now).await
					})
					.await?;

				self.store.save(&self.account, credential.clone()).await?;

				trace_event!(debug, account = %self.account, "Stored exchanged credential.");

				Ok(credential)
			})
			.await;

		record_outcome(KIND, &result);

		result
	}

	/// Returns a credential valid for at least the safety margin, refreshing when needed.
	///
	/// The wait for a concurrent refresh is bounded by the overall call timeout.
	pub async fn valid_credential(&self) -> Result<Credential> {
		self.valid_credential_until(self.default_deadline()).await
	}

	/// Same as [`valid_credential`](Self::valid_credential) with an explicit deadline.
	pub async fn valid_credential_until(&self, deadline: OffsetDateTime) -> Result<Credential> {
		let current = self.store.load(&self.account).await?.ok_or_else(missing_credential)?;

		if current.is_valid_at(self.clock.now(), self.config.safety_margin) {
			return Ok(current);
		}

		self.refresh(deadline, None).await
	}

	/// Refreshes after the API rejected `stale_access_token`, unless another caller already
	/// replaced it; in that case the newer credential is returned without a token call.
	pub async fn force_refresh(&self, stale_access_token: &str) -> Result<Credential> {
		self.force_refresh_until(stale_access_token, self.default_deadline()).await
	}

	/// Same as [`force_refresh`](Self::force_refresh) with an explicit deadline.
	pub async fn force_refresh_until(
		&self,
		stale_access_token: &str,
		deadline: OffsetDateTime,
	) -> Result<Credential> {
		self.refresh(deadline, Some(stale_access_token)).await
	}

	/// Clears the stored credential, e.g. on logout.
	pub async fn invalidate(&self) -> Result<()> {
		let _singleflight = self.flow_guard().lock_arc().await;

		self.store.clear(&self.account).await?;

		trace_event!(debug, account = %self.account, "Cleared stored credential.");

		Ok(())
	}

	pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
		&self.clock
	}

	fn default_deadline(&self) -> OffsetDateTime {
		self.clock.now() + self.config.timeouts.overall
	}

	fn flow_guard(&self) -> Arc<AsyncMutex<()>> {
		let mut guards = self.flow_guards.lock();

		guards.entry(self.account.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
	}

	async fn lock_flow_guard(
		&self,
		deadline: OffsetDateTime,
	) -> Result<async_lock::MutexGuardArc<()>> {
		let guard = self.flow_guard();

		if let Some(locked) = guard.try_lock_arc() {
			return Ok(locked);
		}

		self.bounded(deadline, "credential refresh", async { Ok(guard.lock_arc().await) }).await
	}

	/// Runs `fut` unless `deadline` passes first.
	async fn bounded<T, F>(&self, deadline: OffsetDateTime, stage: &str, fut: F) -> Result<T>
	where
		F: Future<Output = Result<T>>,
	{
		let left = clock::remaining(self.clock.as_ref(), deadline)
			.ok_or_else(|| ApiError::deadline_exceeded(stage))?;

		tokio::time::timeout(clock::to_std(left), fut)
			.await
			.map_err(|_| Error::from(ApiError::deadline_exceeded(stage)))?
	}
}
impl Debug for CredentialManager {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("CredentialManager")
			.field("provider", &self.config.provider)
			.field("account", &self.account)
			.field("client_id", &self.config.client_id)
			.field("metrics", &self.metrics)
			.finish()
	}
}

/// Builder for [`CredentialManager`].
pub struct CredentialManagerBuilder {
	config: ClientConfig,
	account: AccountId,
	store: Option<Arc<dyn CredentialStore>>,
	locks: Option<Arc<dyn LockBackend>>,
	transport: Option<Arc<dyn HttpTransport>>,
	classifier: Arc<dyn ErrorClassifier>,
	clock: Arc<dyn Clock>,
}
impl CredentialManagerBuilder {
	/// Creates a builder with in-memory backends, the system clock, and the default
	/// classifier.
	pub fn new(config: ClientConfig, account: AccountId) -> Self {
		Self {
			config,
			account,
			store: None,
			locks: None,
			transport: None,
			classifier: Arc::new(DefaultErrorClassifier),
			clock: Arc::new(SystemClock),
		}
	}

	/// Sets the credential store.
	pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
		self.store = Some(store);

		self
	}

	/// Sets the shared lease backend.
	pub fn locks(mut self, locks: Arc<dyn LockBackend>) -> Self {
		self.locks = Some(locks);

		self
	}

	/// Sets the HTTP transport used for token endpoint calls.
	pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
		self.transport = Some(transport);

		self
	}

	/// Sets the error classifier.
	pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
		self.classifier = classifier;

		self
	}

	/// Sets the clock.
	pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;

		self
	}

	/// Validates the configuration and builds the manager.
	pub fn build(self) -> Result<CredentialManager> {
		self.config.validate().map_err(ConfigError::from)?;

		let transport = match self.transport {
			Some(transport) => transport,
			None => default_transport(&self.config)?,
		};
		let token_endpoint =
			TokenEndpoint::new(&self.config, transport, self.classifier.clone())?;

		Ok(CredentialManager {
			account: self.account,
			store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
			locks: self.locks.unwrap_or_else(|| Arc::new(MemoryCoordinator::new())),
			token_endpoint: Arc::new(token_endpoint),
			clock: self.clock,
			metrics: Default::default(),
			flow_guards: Default::default(),
			holder: lease_holder_id().into(),
			config: Arc::new(self.config),
		})
	}
}

#[cfg(feature = "reqwest")]
pub(crate) fn default_transport(config: &ClientConfig) -> Result<Arc<dyn HttpTransport>> {
	Ok(Arc::new(crate::http::ReqwestTransport::new(&config.timeouts)?))
}

#[cfg(not(feature = "reqwest"))]
pub(crate) fn default_transport(_: &ClientConfig) -> Result<Arc<dyn HttpTransport>> {
	Err(ConfigError::MissingTransport.into())
}

fn lease_holder_id() -> String {
	format!("{}-{:016x}", std::process::id(), rand::random::<u64>())
}

fn missing_credential() -> Error {
	ApiError::reauthorization_required("No credential is stored for this account.").into()
}

fn record_outcome<T>(kind: OpKind, result: &Result<T>) {
	match result {
		Ok(_) => obs::record_op_outcome(kind, OpOutcome::Success),
		Err(_) => obs::record_op_outcome(kind, OpOutcome::Failure),
	}
}
