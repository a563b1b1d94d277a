//! Thread-safe in-memory [`CredentialStore`] for single-process deployments and tests.

// self
use crate::{
	_prelude::*,
	auth::{AccountId, Credential},
	store::{
		CompareAndSwapOutcome, CredentialStore, StoreFuture, clear_if_refresh_matches,
		swap_if_refresh_matches,
	},
};

type StoreMap = Arc<RwLock<HashMap<AccountId, Credential>>>;

/// Thread-safe storage backend that keeps credentials in-process.
///
/// Clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore(StoreMap);
impl MemoryStore {
	/// Creates an empty store.
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates a store pre-seeded with one credential.
	pub fn with_credential(account: AccountId, credential: Credential) -> Self {
		let store = Self::default();

		store.0.write().insert(account, credential);

		store
	}
}
impl CredentialStore for MemoryStore {
	fn load<'a>(&'a self, account: &'a AccountId) -> StoreFuture<'a, Option<Credential>> {
		Box::pin(async move { Ok(self.0.read().get(account).cloned()) })
	}

	fn save<'a>(&'a self, account: &'a AccountId, credential: Credential) -> StoreFuture<'a, ()> {
		Box::pin(async move {
			self.0.write().insert(account.clone(), credential);

			Ok(())
		})
	}

	fn clear<'a>(&'a self, account: &'a AccountId) -> StoreFuture<'a, Option<Credential>> {
		Box::pin(async move { Ok(self.0.write().remove(account)) })
	}

	fn compare_and_swap_refresh<'a>(
		&'a self,
		account: &'a AccountId,
		expected_refresh: &'a str,
		replacement: Credential,
	) -> StoreFuture<'a, CompareAndSwapOutcome> {
		Box::pin(async move {
			let mut guard = self.0.write();

			Ok(swap_if_refresh_matches(&mut *guard, account, expected_refresh, replacement))
		})
	}

	fn compare_and_clear_refresh<'a>(
		&'a self,
		account: &'a AccountId,
		expected_refresh: &'a str,
	) -> StoreFuture<'a, CompareAndSwapOutcome> {
		Box::pin(async move {
			let mut guard = self.0.write();

			Ok(clear_if_refresh_matches(&mut *guard, account, expected_refresh))
		})
	}
}
