//! The supervisor's closed decision sum (spec §4.7). `step()` returns
//! exactly one of these per tick; `execute()` is a total match over the
//! same set, mirroring the way `raft::consensus` keeps its own
//! `MessageBody` dispatch a closed enum rather than a trait object.

use crate::model::ParticipantId;

/// Why a `LeaderElection` campaign failed to reach quorum, or why no
/// action was possible at all — carried so `execute()` can write a
/// human-readable `StatusReport` instead of a silent no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
	LeaderElectionImpossible,
	TargetInconsistentWithPool,
	PlanParticipantNotInPool,
}

impl Reason {
	pub fn as_str(&self) -> &'static str {
		match self {
			Reason::LeaderElectionImpossible => "LeaderElectionImpossible",
			Reason::TargetInconsistentWithPool => "TargetInconsistentWithPool",
			Reason::PlanParticipantNotInPool => "PlanParticipantNotInPool",
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Campaign {
	pub winner: ParticipantId,
	pub new_term: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
	/// Nothing to do: Plan already matches what Target and Current
	/// require.
	Empty,
	/// First materialization of a Target into Plan.
	AddLogToPlan,
	/// Pick an initial term and participant set; no leader chosen yet.
	CreateInitialTerm,
	/// A campaign reached quorum; install its winner as Plan's leader.
	LeaderElection(Campaign),
	/// Bump Plan's term without changing the leader set (used when a
	/// participant reports a higher term than Plan currently holds).
	UpdateTerm { new_term: u64 },
	/// Target names a specific leader; force Plan to match it.
	DictateLeader { leader: ParticipantId },
	/// The current Plan leader is unhealthy; drop it from the active
	/// set so the next tick can run a fresh campaign.
	EvictLeader { leader: ParticipantId },
	/// Change a participant's allowed-in-quorum / allowed-as-leader
	/// bits to match Target's intent.
	UpdateParticipantFlags { participant: ParticipantId, flags: crate::model::ParticipantFlags },
	AddParticipantToPlan { participant: ParticipantId },
	RemoveParticipantFromPlan { participant: ParticipantId },
	/// writeConcern / waitForSync changed in Target; propagate to Plan.
	UpdateLogConfig { write_concern: usize, wait_for_sync: bool },
	/// Current now reflects Plan which reflects Target: record the
	/// acknowledged Target version.
	ConvergedToTarget { version: u64 },
	/// A retryable deadlock or transient inconsistency: no write is
	/// made, but a status report records why, and the next period
	/// re-evaluates from scratch.
	NoActionPossible { reason: Reason },
	/// An unrecoverable input inconsistency (e.g. Plan names a
	/// participant absent from the pool): distinct from
	/// `NoActionPossible` because it is not expected to resolve on its
	/// own and is surfaced as a standing alarm rather than silently
	/// retried every period.
	ErrorAction { reason: Reason },
}

impl Action {
	/// Whether this action writes a transaction at all, or only ever
	/// updates the in-memory status report (spec §4.7's "no write" path
	/// for `NoActionPossible`/`ErrorAction`).
	pub fn is_write(&self) -> bool {
		!matches!(self, Action::Empty | Action::NoActionPossible { .. } | Action::ErrorAction { .. })
	}
}
