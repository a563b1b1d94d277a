//! Storage contracts and built-in credential store implementations.
//!
//! The credential manager is the only writer; every read hands out a cloned snapshot.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

// self
use crate::{
	_prelude::*,
	auth::{AccountId, Credential},
};

/// Boxed future returned by [`CredentialStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Durable holder of one credential per account.
pub trait CredentialStore
where
	Self: Send + Sync,
{
	/// Fetches the credential for `account`, if present.
	fn load<'a>(&'a self, account: &'a AccountId) -> StoreFuture<'a, Option<Credential>>;

	/// Persists or replaces the credential for `account`.
	fn save<'a>(&'a self, account: &'a AccountId, credential: Credential) -> StoreFuture<'a, ()>;

	/// Removes the credential for `account`, returning what was stored.
	fn clear<'a>(&'a self, account: &'a AccountId) -> StoreFuture<'a, Option<Credential>>;

	/// Atomically replaces the credential only if its refresh token still equals
	/// `expected_refresh`.
	fn compare_and_swap_refresh<'a>(
		&'a self,
		account: &'a AccountId,
		expected_refresh: &'a str,
		replacement: Credential,
	) -> StoreFuture<'a, CompareAndSwapOutcome>;

	/// Atomically removes the credential only if its refresh token still equals
	/// `expected_refresh`; a newer credential is left in place.
	fn compare_and_clear_refresh<'a>(
		&'a self,
		account: &'a AccountId,
		expected_refresh: &'a str,
	) -> StoreFuture<'a, CompareAndSwapOutcome>;
}

/// Result of a refresh-token compare-and-swap (or compare-and-clear) attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareAndSwapOutcome {
	/// The refresh secret matched the expected value and the credential was replaced
	/// (or removed).
	Updated,
	/// A credential exists but its refresh secret differs (another writer rotated it).
	RefreshMismatch,
	/// No credential is stored for the account.
	Missing,
}

/// Error type produced by [`CredentialStore`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced by the backend.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
}
impl From<crate::state_file::StateFileError> for StoreError {
	fn from(e: crate::state_file::StateFileError) -> Self {
		match e {
			crate::state_file::StateFileError::Malformed { .. } =>
				Self::Serialization { message: e.to_string() },
			crate::state_file::StateFileError::Io { .. } =>
				Self::Backend { message: e.to_string() },
		}
	}
}

/// Shared compare-and-swap rule for map-backed stores.
pub(crate) fn swap_if_refresh_matches<M>(
	credentials: &mut M,
	account: &AccountId,
	expected_refresh: &str,
	replacement: Credential,
) -> CompareAndSwapOutcome
where
	M: CredentialMap,
{
	let outcome = refresh_outcome(credentials, account, expected_refresh);

	if matches!(outcome, CompareAndSwapOutcome::Updated) {
		credentials.put_credential(account.clone(), replacement);
	}

	outcome
}

/// Shared compare-and-clear rule for map-backed stores.
pub(crate) fn clear_if_refresh_matches<M>(
	credentials: &mut M,
	account: &AccountId,
	expected_refresh: &str,
) -> CompareAndSwapOutcome
where
	M: CredentialMap,
{
	let outcome = refresh_outcome(credentials, account, expected_refresh);

	if matches!(outcome, CompareAndSwapOutcome::Updated) {
		credentials.remove_credential(account);
	}

	outcome
}

fn refresh_outcome<M>(
	credentials: &M,
	account: &AccountId,
	expected_refresh: &str,
) -> CompareAndSwapOutcome
where
	M: CredentialMap,
{
	match credentials.get_credential(account) {
		Some(existing) if existing.refresh_secret() == Some(expected_refresh) =>
			CompareAndSwapOutcome::Updated,
		Some(_) => CompareAndSwapOutcome::RefreshMismatch,
		None => CompareAndSwapOutcome::Missing,
	}
}

/// Minimal map interface so memory and file stores share the swap rule.
pub(crate) trait CredentialMap {
	fn get_credential(&self, account: &AccountId) -> Option<&Credential>;

	fn put_credential(&mut self, account: AccountId, credential: Credential);

	fn remove_credential(&mut self, account: &AccountId);
}
impl CredentialMap for HashMap<AccountId, Credential> {
	fn get_credential(&self, account: &AccountId) -> Option<&Credential> {
		self.get(account)
	}

	fn put_credential(&mut self, account: AccountId, credential: Credential) {
		self.insert(account, credential);
	}

	fn remove_credential(&mut self, account: &AccountId) {
		self.remove(account);
	}
}
impl CredentialMap for std::collections::BTreeMap<AccountId, Credential> {
	fn get_credential(&self, account: &AccountId) -> Option<&Credential> {
		self.get(account)
	}

	fn put_credential(&mut self, account: AccountId, credential: Credential) {
		self.insert(account, credential);
	}

	fn remove_credential(&mut self, account: &AccountId) {
		self.remove(account);
	}
}
