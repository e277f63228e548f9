//! Target/Plan/Current data model for one managed object (spec §3.5,
//! §4.7). These are the typed view of the subtree `step` reads; the
//! supervisor is responsible for marshaling them to and from the raw
//! `Store` tree under `/target/<id>`, `/plan/<id>`, `/current/<id>`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub type ParticipantId = String;
pub type RebootId = u64;

/// The user's desired end state for one replicated log (spec §3.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
	pub participants: BTreeSet<ParticipantId>,
	pub write_concern: usize,
	pub wait_for_sync: bool,
	/// Set only when an operator has forced a specific leader
	/// (`DictateLeader`); `None` otherwise.
	pub forced_leader: Option<ParticipantId>,
	pub version: u64,
}

/// Per-participant flags the supervisor maintains in Plan (spec §4.7's
/// `UpdateParticipantFlags`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantFlags {
	pub allowed_in_quorum: bool,
	pub allowed_as_leader: bool,
}

impl Default for ParticipantFlags {
	fn default() -> Self {
		ParticipantFlags { allowed_in_quorum: true, allowed_as_leader: true }
	}
}

/// The supervisor's chosen intermediate contract (spec §3.5's "Plan").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
	pub term: u64,
	pub leader: Option<ParticipantId>,
	pub participants: BTreeMap<ParticipantId, ParticipantFlags>,
	pub write_concern: usize,
	pub wait_for_sync: bool,
}

/// One participant's self-reported local state, read out of the
/// `Current.localStates` subtree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentLocalState {
	pub term: u64,
	pub spearhead_term: u64,
	pub spearhead_index: u64,
}

/// Reported actual state aggregated from participants (spec §3.5's
/// "Current").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Current {
	pub local_states: BTreeMap<ParticipantId, CurrentLocalState>,
	pub leader: Option<ParticipantId>,
	/// Version of Target this Current last acknowledged reaching
	/// (`ConvergedToTarget` writes this field).
	pub target_version_acked: Option<u64>,
}

/// Heartbeat-derived liveness and incarnation info for one participant
/// (spec §4.7's `health` map).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantHealth {
	pub reboot_id: RebootId,
	pub not_failed: bool,
}

pub type HealthMap = BTreeMap<ParticipantId, ParticipantHealth>;

/// Everything one `step()` call needs: the atomic read described by
/// spec §4.7 step 1.
#[derive(Debug, Clone)]
pub struct ManagedObjectSnapshot {
	pub target: Target,
	pub plan: Option<Plan>,
	pub current: Current,
	pub health: HealthMap,
}

/// Written under `Current.supervision` whenever a tick observes an
/// off-nominal condition without writing Plan (spec §4.7 "Status
/// reporting").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
	pub reason: String,
	pub timestamp_millis: u64,
}

/// Rolling action trace capped at `max_len` entries, the same
/// bounded-queue policy the Store's own `push-queue` operator
/// implements (spec §4.7's `maxActionsTraceLength`, enforced here at
/// the supervision layer since trace entries are structured reports,
/// not the opaque strings `push-queue` was designed for).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionTrace {
	pub entries: Vec<StatusReport>,
}

impl ActionTrace {
	pub fn push(&mut self, report: StatusReport, max_len: usize) {
		self.entries.push(report);
		if self.entries.len() > max_len {
			let overflow = self.entries.len() - max_len;
			self.entries.drain(0..overflow);
		}
	}
}
