//! JSON state files shared between processes under an exclusive `fs2` lock.
//!
//! Every access opens a sidecar `<name>.lock` file, takes an exclusive advisory lock on it,
//! re-reads the JSON state from disk, and (for updates) writes the new state through a
//! temp-file rename. State is never cached in memory, so other processes' writes are always
//! observed.

// std
use std::{
	fs::{self, File, OpenOptions},
	io::{self, Write},
	path::PathBuf,
};
// crates.io
use fs2::FileExt;
use serde::de::DeserializeOwned;
// self
use crate::_prelude::*;

/// Failure reading or writing a state file.
#[derive(Debug, ThisError)]
pub(crate) enum StateFileError {
	#[error("I/O failure on {}: {source}", .path.display())]
	Io { path: PathBuf, source: io::Error },
	#[error("Malformed state in {}: {source}", .path.display())]
	Malformed { path: PathBuf, source: serde_json::Error },
}

#[derive(Debug)]
pub(crate) struct StateFile {
	path: PathBuf,
	lock_path: PathBuf,
	// flock is per open file description; threads of this process queue here first.
	local: Mutex<()>,
}
impl StateFile {
	pub(crate) fn open(path: impl Into<PathBuf>) -> Result<Self, StateFileError> {
		let path = path.into();

		if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
			fs::create_dir_all(parent)
				.map_err(|source| StateFileError::Io { path: parent.to_path_buf(), source })?;
		}

		let mut lock_name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();

		lock_name.push(".lock");

		let lock_path = path.with_file_name(lock_name);

		Ok(Self { path, lock_path, local: Mutex::new(()) })
	}

	/// Reads the current state.
	pub(crate) fn read<T>(&self) -> Result<T, StateFileError>
	where
		T: Default + DeserializeOwned,
	{
		let _local = self.local.lock();
		let lock = self.lock()?;
		let state = self.load();

		self.unlock(lock)?;

		state
	}

	/// Applies `f` to the current state and persists the result atomically.
	pub(crate) fn update<T, R, F>(&self, f: F) -> Result<R, StateFileError>
	where
		T: Default + Serialize + DeserializeOwned,
		F: FnOnce(&mut T) -> R,
	{
		let _local = self.local.lock();
		let lock = self.lock()?;
		let result = self.load::<T>().and_then(|mut state| {
			let out = f(&mut state);

			self.persist(&state)?;

			Ok(out)
		});

		self.unlock(lock)?;

		result
	}

	fn lock(&self) -> Result<File, StateFileError> {
		let io_err = |source| StateFileError::Io { path: self.lock_path.clone(), source };
		let file = OpenOptions::new()
			.create(true)
			.truncate(false)
			.write(true)
			.open(&self.lock_path)
			.map_err(io_err)?;

		file.lock_exclusive().map_err(io_err)?;

		Ok(file)
	}

	fn unlock(&self, file: File) -> Result<(), StateFileError> {
		FileExt::unlock(&file)
			.map_err(|source| StateFileError::Io { path: self.lock_path.clone(), source })
	}

	fn load<T>(&self) -> Result<T, StateFileError>
	where
		T: Default + DeserializeOwned,
	{
		let bytes = match fs::read(&self.path) {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
			Err(source) => return Err(StateFileError::Io { path: self.path.clone(), source }),
		};

		if bytes.iter().all(u8::is_ascii_whitespace) {
			return Ok(T::default());
		}

		serde_json::from_slice(&bytes)
			.map_err(|source| StateFileError::Malformed { path: self.path.clone(), source })
	}

	fn persist<T>(&self, state: &T) -> Result<(), StateFileError>
	where
		T: Serialize,
	{
		let serialized = serde_json::to_vec_pretty(state)
			.map_err(|source| StateFileError::Malformed { path: self.path.clone(), source })?;
		let mut tmp_path = self.path.clone();

		tmp_path.set_extension("tmp");

		let io_err = |source| StateFileError::Io { path: tmp_path.clone(), source };

		{
			let mut file = File::create(&tmp_path).map_err(io_err)?;

			file.write_all(&serialized).map_err(io_err)?;
			file.sync_all().map_err(io_err)?;
		}

		fs::rename(&tmp_path, &self.path)
			.map_err(|source| StateFileError::Io { path: self.path.clone(), source })
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn missing_file_reads_as_default_and_updates_persist() {
		let dir = tempfile::tempdir().expect("Temp dir should be created.");
		let path = dir.path().join("nested/state.json");
		let state = StateFile::open(&path).expect("State file should open.");
		let empty: HashMap<String, u32> = state.read().expect("Missing file should read.");

		assert!(empty.is_empty());

		let previous = state
			.update(|map: &mut HashMap<String, u32>| map.insert("hits".into(), 3))
			.expect("Update should persist.");
		let reopened = StateFile::open(&path).expect("State file should reopen.");
		let loaded: HashMap<String, u32> = reopened.read().expect("State should reload.");

		assert_eq!(previous, None);
		assert_eq!(loaded.get("hits"), Some(&3));
		assert!(dir.path().join("nested/state.json.lock").exists());
	}

	#[test]
	fn malformed_state_is_reported() {
		let dir = tempfile::tempdir().expect("Temp dir should be created.");
		let path = dir.path().join("state.json");

		fs::write(&path, b"{not json").expect("Fixture should be written.");

		let state = StateFile::open(&path).expect("State file should open.");
		let err = state.read::<HashMap<String, u32>>().expect_err("Malformed JSON should fail.");

		assert!(matches!(err, StateFileError::Malformed { .. }));
	}
}
