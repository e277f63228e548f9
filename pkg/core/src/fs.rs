//! Filesystem primitives shared by the log and snapshot stores: an
//! exclusive directory lock (one Agency peer may ever have a data
//! directory open at a time) and durability helpers around `fsync`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("failed to create data directory {0}: {1}")]
	CreateDir(PathBuf, #[source] io::Error),

	#[error("data directory {0} is already locked by another process")]
	AlreadyLocked(PathBuf),

	#[error("io error on {0}: {1}")]
	Io(PathBuf, #[source] io::Error),
}

/// Holds an exclusive advisory lock on a data directory for the
/// lifetime of the process. Dropping it releases the lock.
pub struct DirLock {
	path: PathBuf,
	// Kept alive only to hold the flock(); never read after construction.
	_lockfile: File,
}

impl DirLock {
	/// Opens (creating if needed) `dir` and takes an exclusive lock on
	/// a `LOCK` file inside it. Fails immediately (does not block) if
	/// another process already holds the lock.
	pub fn open(dir: &Path) -> Result<Self, Error> {
		std::fs::create_dir_all(dir).map_err(|e| Error::CreateDir(dir.to_owned(), e))?;

		let lock_path = dir.join("LOCK");
		let lockfile = OpenOptions::new()
			.create(true)
			.write(true)
			.open(&lock_path)
			.map_err(|e| Error::Io(lock_path.clone(), e))?;

		lockfile.try_lock_exclusive().map_err(|_| Error::AlreadyLocked(dir.to_owned()))?;

		Ok(DirLock { path: dir.to_owned(), _lockfile: lockfile })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

/// Fsyncs the file's data (and, if `metadata` is set, its metadata too).
/// Used by the log's `waitForSync` policy and by snapshot installation.
pub fn sync_file(file: &File, metadata: bool) -> io::Result<()> {
	if metadata {
		file.sync_all()
	} else {
		file.sync_data()
	}
}

/// Fsyncs the directory entry itself, required after creating or
/// renaming a file so the directory entry for it is durable too.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
	let f = File::open(dir)?;
	f.sync_all()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn second_lock_on_same_dir_fails() {
		let tmp = std::env::temp_dir().join(format!("agency-core-test-{}", std::process::id()));
		let _first = DirLock::open(&tmp).expect("first lock should succeed");
		let second = DirLock::open(&tmp);
		assert!(matches!(second, Err(Error::AlreadyLocked(_))));
		std::fs::remove_dir_all(&tmp).ok();
	}
}
