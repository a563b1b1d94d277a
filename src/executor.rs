//! Rate-limited, retrying request execution.
//!
//! [`RequestExecutor::execute`] is the single choke point for API calls. Each logical call
//! gets one overall deadline and goes through the same loop: obtain a valid credential,
//! wait for admission, dispatch, classify, then retry or return according to the
//! [`RetryPolicy`](crate::config::RetryPolicy).

mod attempt;

// self
use crate::{
	_prelude::*,
	auth::AccountId,
	classify::{DefaultErrorClassifier, ErrorClassifier, ResponseContext},
	clock::{self, Clock, SystemClock},
	config::ClientConfig,
	coord::{Coordinator, LockBackend, MemoryCoordinator, WindowBackend},
	credentials::{self, CredentialManager},
	http::{ApiRequest, ApiResponse, HttpRequest, HttpTransport, parse_retry_after},
	obs::{self, OpKind, OpOutcome, OpSpan},
	rate_limit::RateLimiter,
	store::CredentialStore,
};
use attempt::{CallState, Recovery, RequestAttempt};

/// Executes API calls for one account with credentials, admission, and retries handled.
///
/// Clones share every backend; use [`for_account`](Self::for_account) to serve other
/// accounts from the same backends.
#[derive(Clone)]
pub struct RequestExecutor {
	credentials: CredentialManager,
	limiter: RateLimiter,
	windows: Arc<dyn WindowBackend>,
	transport: Arc<dyn HttpTransport>,
	classifier: Arc<dyn ErrorClassifier>,
	clock: Arc<dyn Clock>,
}
impl RequestExecutor {
	/// Starts a builder for `account` under `config`.
	pub fn builder(config: ClientConfig, account: AccountId) -> ExecutorBuilder {
		ExecutorBuilder::new(config, account)
	}

	/// Returns an executor for another account sharing every backend.
	pub fn for_account(&self, account: AccountId) -> Self {
		let limiter = RateLimiter::for_account(
			self.credentials.config(),
			&account,
			self.windows.clone(),
			self.clock.clone(),
		);

		Self { credentials: self.credentials.for_account(account), limiter, ..self.clone() }
	}

	/// Credential manager backing this executor (authorization URL, code exchange, logout).
	pub fn credentials(&self) -> &CredentialManager {
		&self.credentials
	}

	/// Rate limiter backing this executor.
	pub fn rate_limiter(&self) -> &RateLimiter {
		&self.limiter
	}

	/// Executes `request`, returning the 2xx response or the last classified error.
	pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse> {
		const KIND: OpKind = OpKind::Request;

		let span = OpSpan::new(KIND, "execute");

		obs::record_op_outcome(KIND, OpOutcome::Attempt);

		let result = span.instrument(self.run(&request)).await;

		match &result {
			Ok(_) => obs::record_op_outcome(KIND, OpOutcome::Success),
			Err(_) => obs::record_op_outcome(KIND, OpOutcome::Failure),
		}

		result
	}

	async fn run(&self, request: &ApiRequest) -> Result<ApiResponse> {
		let config = self.credentials.config();
		let deadline = self.clock.now() + config.timeouts.overall;
		let mut attempt = RequestAttempt::new();
		// Classified failure that scheduled the pending retry.
		let mut last_error = None::<ApiError>;
		let result = loop {
			let credential = match self.credentials.valid_credential_until(deadline).await {
				Ok(credential) => credential,
				Err(Error::Api(error)) => {
					let remaining =
						clock::remaining(self.clock.as_ref(), deadline).unwrap_or_default();
					let recovery = attempt.on_refresh_failure(
						&error,
						&config.retry,
						rand::random(),
						remaining,
					);

					match recovery {
						Recovery::Backoff(delay) => {
							trace_event!(debug, delay = %delay, "Credential refresh failed.");

							self.clock.sleep(delay).await;

							last_error = Some(error);

							continue;
						},
						_ => break Err(surface_last_error(error.into(), last_error)),
					}
				},
				Err(e) => break Err(surface_last_error(e, last_error)),
			};

			if let Err(e) = self.limiter.acquire(deadline).await {
				break Err(surface_last_error(e, last_error));
			}

			let wire = match request.to_http(&config.endpoints.api_base, &credential) {
				Ok(wire) => wire,
				Err(e) => break Err(e.into()),
			};

			attempt.dispatch();

			let error = match self.dispatch(wire, deadline).await {
				Ok(response) => {
					attempt.succeed();

					break Ok(response);
				},
				Err(error) => error,
			};
			let remaining = clock::remaining(self.clock.as_ref(), deadline).unwrap_or_default();
			let recovery = attempt.on_failure(&error, &config.retry, rand::random(), remaining);

			trace_event!(
				debug,
				dispatches = attempt.dispatches(),
				kind = ?attempt.last_error_kind(),
				status = ?error.status,
				recovery = ?recovery,
				"Request failed."
			);

			match recovery {
				Recovery::GiveUp => break Err(error.into()),
				Recovery::Backoff(delay) => self.clock.sleep(delay).await,
				Recovery::Throttled => {
					let throttled = self.limiter.record_server_throttle(error.retry_after).await;
					let until = match throttled {
						Ok(until) => until,
						Err(e) => break Err(e),
					};

					if until > deadline {
						break Err(error.into());
					}
				},
				Recovery::Reauthenticate => {
					let stale = credential.access_token.expose();

					if let Err(e) = self.credentials.force_refresh_until(stale, deadline).await {
						break Err(surface_last_error(e, Some(error)));
					}
				},
			}

			last_error = Some(error);

			debug_assert_eq!(attempt.state(), CallState::Retrying);
		};

		if result.is_err() {
			attempt.fail();
		}

		result
	}

	/// Sends one request, bounded by the call deadline, and classifies any failure.
	async fn dispatch(
		&self,
		wire: HttpRequest,
		deadline: OffsetDateTime,
	) -> Result<ApiResponse, ApiError> {
		let left = clock::remaining(self.clock.as_ref(), deadline)
			.ok_or_else(|| ApiError::deadline_exceeded("upstream response"))?;
		let sent = tokio::time::timeout(clock::to_std(left), self.transport.send(wire))
			.await
			.map_err(|_| ApiError::deadline_exceeded("upstream response"))?;
		let response = match sent {
			Ok(response) => response,
			Err(e) => return Err(self.classifier.classify_transport(&e)),
		};

		if response.status().is_success() {
			return Ok(response.into());
		}

		let retry_after = parse_retry_after(response.headers(), self.clock.now());
		let context = ResponseContext {
			status: response.status().as_u16(),
			retry_after,
			body: response.body(),
		};

		Err(self.classifier.classify_response(&context))
	}
}
impl Debug for RequestExecutor {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RequestExecutor")
			.field("credentials", &self.credentials)
			.field("limiter", &self.limiter)
			.finish()
	}
}

/// Builder for [`RequestExecutor`].
///
/// Every backend defaults to an in-process implementation; the transport defaults to
/// reqwest when that feature is enabled.
pub struct ExecutorBuilder {
	config: ClientConfig,
	account: AccountId,
	store: Option<Arc<dyn CredentialStore>>,
	locks: Option<Arc<dyn LockBackend>>,
	windows: Option<Arc<dyn WindowBackend>>,
	transport: Option<Arc<dyn HttpTransport>>,
	classifier: Arc<dyn ErrorClassifier>,
	clock: Arc<dyn Clock>,
}
impl ExecutorBuilder {
	/// Creates a builder for `account` under `config`.
	pub fn new(config: ClientConfig, account: AccountId) -> Self {
		Self {
			config,
			account,
			store: None,
			locks: None,
			windows: None,
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

	/// Uses `coordinator` for both refresh leases and rate windows.
	pub fn coordinator<C>(mut self, coordinator: Arc<C>) -> Self
	where
		C: 'static + Coordinator,
	{
		let locks: Arc<dyn LockBackend> = coordinator.clone();
		let windows: Arc<dyn WindowBackend> = coordinator;

		self.locks = Some(locks);
		self.windows = Some(windows);

		self
	}

	/// Sets the HTTP transport shared by API calls and token endpoint calls.
	pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
		self.transport = Some(transport);

		self
	}

	/// Sets the error classifier.
	pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
		self.classifier = classifier;

		self
	}

	/// Sets the clock driving deadlines, admission waits, and backoff.
	pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;

		self
	}

	/// Validates the configuration and builds the executor.
	pub fn build(self) -> Result<RequestExecutor> {
		let transport = match self.transport {
			Some(transport) => transport,
			None => credentials::default_transport(&self.config)?,
		};
		let (locks, windows) = match (self.locks, self.windows) {
			(Some(locks), Some(windows)) => (locks, windows),
			_ => {
				let coordinator = Arc::new(MemoryCoordinator::new());
				let locks: Arc<dyn LockBackend> = coordinator.clone();
				let windows: Arc<dyn WindowBackend> = coordinator;

				(locks, windows)
			},
		};
		let limiter = RateLimiter::for_account(
			&self.config,
			&self.account,
			windows.clone(),
			self.clock.clone(),
		);
		let mut credentials = CredentialManager::builder(self.config, self.account)
			.locks(locks)
			.transport(transport.clone())
			.classifier(self.classifier.clone())
			.clock(self.clock.clone());

		if let Some(store) = self.store {
			credentials = credentials.store(store);
		}

		Ok(RequestExecutor {
			credentials: credentials.build()?,
			limiter,
			windows,
			transport,
			classifier: self.classifier,
			clock: self.clock,
		})
	}
}

/// A deadline hit while preparing a retry reports the failure that caused the retry.
fn surface_last_error(err: Error, last: Option<ApiError>) -> Error {
	match (err, last) {
		(Error::Api(err), Some(last)) if err.timed_out => last.into(),
		(err, _) => err,
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use time::macros;
	// self
	use super::*;
	use crate::{
		auth::{Credential, ProviderId},
		clock::ManualClock,
		http::{ScriptedReply, ScriptedTransport, StatusCode},
		store::MemoryStore,
	};

	const START: OffsetDateTime = macros::datetime!(2025-03-01 12:00 UTC);

	fn executor(transport: Arc<ScriptedTransport>) -> RequestExecutor {
		let parse = |raw: &str| Url::parse(raw).expect("Fixture URL should parse.");
		let provider = ProviderId::new("vendor").expect("Provider id should be valid.");
		let account = AccountId::new("acct").expect("Account id should be valid.");
		let config = ClientConfig::builder(provider, "cid")
			.redirect_uri(parse("https://app.example.com/callback"))
			.authorization_endpoint(parse("https://vendor.example.com/oauth/authorize"))
			.token_endpoint(parse("https://vendor.example.com/oauth/token"))
			.api_base(parse("https://api.vendor.example.com/v1/"))
			.build()
			.expect("Config should build.");
		let credential = Credential::builder()
			.access_token("access-1")
			.refresh_token("refresh-1")
			.issued_at(START)
			.expires_in(Duration::hours(1))
			.build()
			.expect("Credential should build.");

		RequestExecutor::builder(config, account.clone())
			.store(Arc::new(MemoryStore::with_credential(account, credential)))
			.transport(transport)
			.clock(Arc::new(ManualClock::new(START)))
			.build()
			.expect("Executor should build.")
	}

	#[tokio::test]
	async fn success_attaches_the_bearer_token_and_counts_the_request() {
		let transport = Arc::new(ScriptedTransport::new());

		transport.enqueue("/v1/deals", ScriptedReply::json(200, serde_json::json!({ "id": 7 })));

		let executor = executor(transport.clone());
		let response = executor
			.execute(ApiRequest::get("deals").query("limit", "1"))
			.await
			.expect("Call should succeed.");
		let request = &transport.requests()[0];
		let body = response.json::<serde_json::Value>().expect("Body should decode.");

		assert_eq!(body["id"], 7);
		assert_eq!(request.header("authorization"), Some("Bearer access-1"));
		assert_eq!(request.uri, "https://api.vendor.example.com/v1/deals?limit=1");

		let state = executor.rate_limiter().record_request().await.expect("Window should admit.");

		assert_eq!(state.count, 2);
	}

	#[tokio::test]
	async fn not_found_is_returned_without_retry() {
		let transport = Arc::new(ScriptedTransport::new());
		let executor = executor(transport.clone());
		let err =
			executor.execute(ApiRequest::get("missing")).await.expect_err("Unscripted path.");

		assert_eq!(err.kind(), Some(ApiErrorKind::NotFound));
		assert_eq!(transport.calls("/v1/missing"), 1);
	}

	#[tokio::test]
	async fn connection_failures_are_retried_as_network_errors() {
		let transport = Arc::new(ScriptedTransport::new());

		transport
			.enqueue("/v1/deals", ScriptedReply::ConnectionFailure)
			.enqueue("/v1/deals", ScriptedReply::status(204));

		let response = executor(transport.clone())
			.execute(ApiRequest::delete("deals"))
			.await
			.expect("Second attempt should succeed.");

		assert_eq!(response.status, StatusCode::NO_CONTENT);
		assert_eq!(transport.calls("/v1/deals"), 2);
	}
}
