//! File-backed [`CredentialStore`] shareable between processes.
//!
//! The snapshot is re-read under an exclusive file lock for every operation, so a
//! compare-and-swap performed by one process observes rotations written by another.

// std
use std::{collections::BTreeMap, path::PathBuf};
// self
use crate::{
	_prelude::*,
	auth::{AccountId, Credential},
	state_file::StateFile,
	store::{
		CompareAndSwapOutcome, CredentialStore, StoreError, StoreFuture, clear_if_refresh_matches,
		swap_if_refresh_matches,
	},
};

type Snapshot = BTreeMap<AccountId, Credential>;

/// Persists credentials to a JSON file.
#[derive(Clone, Debug)]
pub struct FileStore {
	file: Arc<StateFile>,
}
impl FileStore {
	/// Opens (or lazily creates) a store at the provided path.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
		Ok(Self { file: Arc::new(StateFile::open(path)?) })
	}
}
impl CredentialStore for FileStore {
	fn load<'a>(&'a self, account: &'a AccountId) -> StoreFuture<'a, Option<Credential>> {
		Box::pin(async move {
			let mut snapshot: Snapshot = self.file.read()?;

			Ok(snapshot.remove(account))
		})
	}

	fn save<'a>(&'a self, account: &'a AccountId, credential: Credential) -> StoreFuture<'a, ()> {
		Box::pin(async move {
			self.file.update(|snapshot: &mut Snapshot| {
				snapshot.insert(account.clone(), credential);
			})?;

			Ok(())
		})
	}

	fn clear<'a>(&'a self, account: &'a AccountId) -> StoreFuture<'a, Option<Credential>> {
		Box::pin(async move {
			Ok(self.file.update(|snapshot: &mut Snapshot| snapshot.remove(account))?)
		})
	}

	fn compare_and_swap_refresh<'a>(
		&'a self,
		account: &'a AccountId,
		expected_refresh: &'a str,
		replacement: Credential,
	) -> StoreFuture<'a, CompareAndSwapOutcome> {
		Box::pin(async move {
			Ok(self.file.update(|snapshot: &mut Snapshot| {
				swap_if_refresh_matches(snapshot, account, expected_refresh, replacement)
			})?)
		})
	}

	fn compare_and_clear_refresh<'a>(
		&'a self,
		account: &'a AccountId,
		expected_refresh: &'a str,
	) -> StoreFuture<'a, CompareAndSwapOutcome> {
		Box::pin(async move {
			Ok(self.file.update(|snapshot: &mut Snapshot| {
				clear_if_refresh_matches(snapshot, account, expected_refresh)
			})?)
		})
	}
}
