//! The Constituent's in-memory role state: follower, candidate, or
//! leader (spec §4.3), plus the leader's per-follower replication
//! bookkeeping (spec §3.4). Grounded in the teacher's `ServerState`
//! enum referenced from `consensus.rs`.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::protos::{LogIndex, ServerId};

#[derive(Debug)]
pub enum ServerState {
	Follower(ServerFollowerState),
	Candidate(ServerCandidateState),
	Leader(ServerLeaderState),
}

#[derive(Debug)]
pub struct ServerFollowerState {
	pub election_timeout: Duration,
	pub last_leader_id: Option<ServerId>,
	pub last_heartbeat: Instant,
}

#[derive(Debug)]
pub struct ServerCandidateState {
	pub election_start: Instant,
	pub election_timeout: Duration,
	pub votes_received: HashSet<ServerId>,
	pub some_rejected: bool,
}

#[derive(Debug)]
pub struct ServerLeaderState {
	pub servers: HashMap<ServerId, ServerProgress>,
}

/// Leader-local, non-replicated state per follower (spec §3.4).
#[derive(Debug)]
pub struct ServerProgress {
	/// Highest index this follower is known to have persisted.
	pub match_index: LogIndex,
	/// Next index the leader will try sending to this follower.
	pub next_index: LogIndex,
	/// Whether an AppendEntries to this follower is currently in flight.
	pub request_pending: bool,
	/// Last time a (possibly empty) AppendEntries was sent.
	pub last_sent: Option<Instant>,
	/// Last time this follower successfully acknowledged a request.
	pub last_acked: Option<Instant>,
	/// Backpressure: the leader will not send another package to this
	/// follower before this time (spec §3.4 `earliest_package`).
	pub earliest_package: Option<Instant>,
}

impl ServerProgress {
	pub fn new(last_log_index: LogIndex) -> Self {
		ServerProgress {
			match_index: 0,
			next_index: last_log_index + 1,
			request_pending: false,
			last_sent: None,
			last_acked: None,
			earliest_package: None,
		}
	}
}
