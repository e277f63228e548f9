//! Top-level error type for the binary: wraps each layer's own typed
//! error rather than flattening everything to a string, so `main`'s
//! `?`-chain still carries enough detail for the final error log line.

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error(transparent)]
	Config(#[from] crate::config::Error),

	#[error(transparent)]
	DirLock(#[from] agency_core::fs::Error),

	#[error(transparent)]
	Log(#[from] raft::log::FileLogError),

	#[error(transparent)]
	Raft(#[from] raft::errors::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
