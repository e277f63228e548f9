//! Error taxonomy for the consensus engine (spec §7). Each kind maps to
//! one of the abstract kinds in the spec and carries the data a caller
//! needs to apply that kind's policy (retry, step down, surface to
//! client, or treat as fatal).

use crate::protos::{LogIndex, ServerId, Term};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// RPC timeout or connection reset. Policy: retry with backoff.
	#[error("transient network error talking to {peer}: {source}")]
	TransientNetwork {
		peer: ServerId,
		#[source]
		source: reqwest::Error,
	},

	/// A peer could not be reached at all (partitioned, unknown, or
	/// down) without an underlying transport error to wrap, e.g. in
	/// the in-memory test harness. Policy: retry with backoff, same
	/// as `TransientNetwork`.
	#[error("peer {0} unreachable")]
	PeerUnreachable(ServerId),

	/// Observed a higher term than our own. Policy: immediate step-down.
	#[error("observed stale term {ours}, peer is at {theirs}")]
	StaleTerm { ours: Term, theirs: Term },

	/// AppendEntries prev-match failed in a way the caller can't repair
	/// by decrementing next_index (e.g. malformed request).
	#[error("log inconsistency at index {index}: {reason}")]
	LogInconsistency { index: LogIndex, reason: String },

	/// fsync or file write failed. Policy: abort append, resign
	/// leadership, fatal.
	#[error("durability failure writing {what}: {source}")]
	Durability {
		what: String,
		#[source]
		source: std::io::Error,
	},

	/// No majority reachable within the leader's patience window.
	#[error("quorum lost: only {reachable} of {needed} required peers reachable")]
	QuorumLost { reachable: usize, needed: usize },

	/// A structural invariant was violated (commit pointer went
	/// backwards, log has a hole, etc). Always fatal.
	#[error("internal invariant violated: {0}")]
	InvariantViolation(String),

	/// Request rejected because this node is not (or no longer) the
	/// leader; includes a hint at who might be, if known.
	#[error("not the leader (hint: {leader_hint:?})")]
	NotLeader { leader_hint: Option<ServerId> },

	#[error("serialization error: {0}")]
	Serde(#[from] serde_json::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	DirLock(#[from] agency_core::fs::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	/// Whether this error class is one the Raft safety properties say
	/// must crash the process rather than being handled locally
	/// (spec §7: "Fatal: durability errors, invariant violations.").
	pub fn is_fatal(&self) -> bool {
		matches!(self, Error::Durability { .. } | Error::InvariantViolation(_))
	}
}
