//! Wire and persistent types shared by every layer: log entries, the
//! cluster configuration record, and the peer RPC request/response
//! shapes from spec §6.1. Kept as plain `serde`-derived structs with
//! public fields, the way the teacher's `protos.rs` does it, rather
//! than hiding them behind accessors — these are data, not objects.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// Stable UUID text identifying a peer (spec §3.3: "id: stable UUID").
pub type ServerId = String;

pub type Term = u64;

pub type LogIndex = u64;

/// A single `(index, term)` pair identifying a uniquely-placed log
/// entry once committed (spec §3.1's "Log Matching Property").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogPosition {
	pub term: Term,
	pub index: LogIndex,
}

/// Persistent per-peer election state (spec §4.3, §6.3): must be
/// fsynced before granting a vote or sending a vote request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
	pub current_term: Term,
	pub voted_for: Option<ServerId>,
	pub commit_index: LogIndex,
}

impl Default for Metadata {
	fn default() -> Self {
		Metadata { current_term: 0, voted_for: None, commit_index: 0 }
	}
}

/// A change to cluster membership (spec §1 Non-goals: membership is
/// fixed per term; this is the narrow "join after state transfer"
/// exception, modeled the same way the teacher models `ConfigChange`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfigChange {
	AddMember(ServerId),
	AddLearner(ServerId),
	RemoveServer(ServerId),
}

/// The active cluster configuration (spec §3.3's `pool`/`active`,
/// narrowed to the voting-members/learners split the consensus layer
/// actually needs to compute quorums).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
	pub members: HashSet<ServerId>,
	pub learners: HashSet<ServerId>,
}

impl Configuration {
	pub fn apply(&mut self, change: &ConfigChange) {
		match change {
			ConfigChange::AddLearner(s) => {
				if !self.members.contains(s) {
					self.learners.insert(s.clone());
				}
			}
			ConfigChange::AddMember(s) => {
				self.learners.remove(s);
				self.members.insert(s.clone());
			}
			ConfigChange::RemoveServer(s) => {
				self.learners.remove(s);
				self.members.remove(s);
			}
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = &ServerId> {
		self.members.iter().chain(self.learners.iter())
	}
}

/// One write operator applied to a single leaf (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operator {
	Set(ScalarOrTree),
	Increment(i64),
	Decrement(i64),
	Push { value: String, limit: Option<usize> },
	Pop,
	Prepend(String),
	Shift,
	Erase(Option<String>),
	Replace { old: ScalarOrTree, new: ScalarOrTree },
	ReadLock(String),
	ReadUnlock(String),
	WriteLock(String),
	WriteUnlock(String),
	PushQueue { value: String, limit: usize },
	/// Removes every registration of `url` from this node's observer
	/// set (spec §4.1's observer "trash bin" garbage collection).
	Unobserve(String),
}

/// Leaf payload used by `set`/`replace`/preconditions: either a scalar
/// or a nested object literal (spec §3.2's tagged leaf value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarOrTree {
	Null,
	Bool(bool),
	Int(i64),
	Double(f64),
	Str(String),
	Array(Vec<String>),
	Object(BTreeMap<String, ScalarOrTree>),
}

/// A single-path precondition (spec §4.1 item 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Precondition {
	EqualToValue(ScalarOrTree),
	OldEmpty,
	IsArray,
	InArray(String),
	NotInArray(String),
	IsObject,
	HasKey(String),
	NotHasKey(String),
	ReadLockableBy(String),
	WriteLockableBy(String),
}

/// One write within a transaction: the operator to apply at `path`,
/// plus an optional TTL update (spec §4.1: "TTL changes are
/// themselves transactional and replicated").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Write {
	pub path: String,
	pub operator: Operator,
	pub ttl_millis: Option<u64>,
}

/// One transaction: a set of per-path operators plus the preconditions
/// that must all hold before any operator runs (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
	pub writes: Vec<Write>,
	pub preconditions: BTreeMap<String, Precondition>,
	pub client_id: String,
}

/// The `transact` primitive's request shape (spec §4.1/§4.4/§6.2): a
/// transaction plus a list of paths to read back against the state it
/// produces, both under one atomic boundary ("a sequence of reads and
/// writes with a single atomic boundary").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixedOperation {
	pub transaction: Transaction,
	pub reads: Vec<String>,
}

/// Response to a `MixedOperation`: the transaction's own outcome plus
/// the values `reads` resolved to against the resulting state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactResponse {
	pub accepted: bool,
	pub redirect: Option<ServerId>,
	pub outcome: Outcome,
	pub index: LogIndex,
	pub results: Vec<ScalarOrTree>,
}

/// Outcome of applying exactly one transaction (spec §4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
	Applied,
	PreconditionFailed { path: String },
	Forbidden { reason: String },
	UnknownError { reason: String },
}

/// Payload carried by a `LogEntryData::Transaction` entry: a batch of
/// transactions processed left-to-right, each independently
/// succeeding or failing (spec §4.1 "tie-breaks and ordering").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionPayload {
	pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogEntryData {
	/// Occupies a log index without touching the state machine; used
	/// to flush out uncommitted entries from a previous term.
	Noop,
	Config(ConfigChange),
	Transaction(TransactionPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
	pub index: LogIndex,
	pub term: Term,
	pub data: LogEntryData,
	pub client_id: String,
	pub timestamp_millis: u64,
}

// --- Peer RPCs (spec §6.1) ---------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
	pub term: Term,
	pub leader_id: ServerId,
	pub prev_log_index: LogIndex,
	pub prev_log_term: Term,
	pub entries: Vec<LogEntry>,
	pub leader_commit_index: LogIndex,
	pub sender_timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
	pub term: Term,
	pub success: bool,
	pub sender_timestamp: u64,
	/// Present only on rejection: a hint at the follower's last index
	/// so the leader can rewind `next_index` in one step instead of
	/// decrementing by one per round trip (spec §4.4 step 4).
	pub last_log_index_hint: Option<LogIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
	pub term: Term,
	pub candidate_id: ServerId,
	pub last_log_index: LogIndex,
	pub last_log_term: Term,
	pub timeout_mult: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
	pub term: Term,
	pub vote_granted: bool,
}

/// Sent instead of AppendEntries when a follower's `next_index` has
/// fallen behind the leader's compacted log prefix (spec §4.5's
/// install-snapshot path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
	pub term: Term,
	pub leader_id: ServerId,
	pub last_included_index: LogIndex,
	pub last_included_term: Term,
	pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
	pub term: Term,
	pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyAllRequest {
	pub term: Term,
	pub agency_id: ServerId,
	pub active: Vec<ServerId>,
	pub pool: BTreeMap<ServerId, String>,
	pub min_ping: f64,
	pub max_ping: f64,
	pub timeout_mult: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipRequest {
	pub id: ServerId,
	pub endpoint: String,
	pub pool: BTreeMap<ServerId, String>,
	pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipResponse {
	Merged { pool: BTreeMap<ServerId, String>, version: u64 },
	Redirect { endpoint: String, id: ServerId },
	Error { code: u16, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveAgentsResponse {
	pub active: Vec<ServerId>,
	pub leader_id: Option<ServerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InformRequest {
	pub term: Term,
	pub leader_id: ServerId,
}

// --- Client RPCs (spec §6.2) -------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
	pub transactions: Vec<Transaction>,
	pub mode: WriteMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
	Normal,
	Unchecked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
	pub accepted: bool,
	pub redirect: Option<ServerId>,
	pub applied: Vec<Outcome>,
	pub indices: Vec<LogIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
	pub paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
	pub accepted: bool,
	pub redirect: Option<ServerId>,
	pub success: Vec<bool>,
	pub result: Vec<ScalarOrTree>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InquireResponse {
	pub outcomes: BTreeMap<String, Option<(Outcome, LogIndex)>>,
}
