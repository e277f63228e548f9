//! The pure decision function (spec §4.7 step 2). `step` never touches
//! I/O and never reads wall-clock time — given the same four inputs it
//! always returns the same `Action` (spec §8 invariant 11,
//! "Supervision determinism"), the same way `raft::consensus`'s
//! `cycle()` keeps its transition logic free of hidden state.

use crate::action::{Action, Campaign, Reason};
use crate::model::{Current, HealthMap, ManagedObjectSnapshot, ParticipantFlags, Plan, Target};

/// Strictly ordered: the first predicate that matches wins, so two
/// leaders observing identical Target/Plan/Current/health always pick
/// the same action (spec §4.7 "idempotency under leader change").
pub fn step(snapshot: &ManagedObjectSnapshot) -> Action {
	let ManagedObjectSnapshot { target, plan, current, health } = snapshot;

	let plan = match plan {
		None => return Action::AddLogToPlan,
		Some(p) => p,
	};

	if !plan_participants_subset_of_pool(plan, health) {
		return Action::ErrorAction { reason: Reason::PlanParticipantNotInPool };
	}

	if plan.term == 0 && plan.leader.is_none() {
		return Action::CreateInitialTerm;
	}

	if let Some(forced) = &target.forced_leader {
		if plan.leader.as_ref() != Some(forced) {
			return Action::DictateLeader { leader: forced.clone() };
		}
	}

	if let Some(leader) = &plan.leader {
		if !is_healthy(health, leader) {
			return Action::EvictLeader { leader: leader.clone() };
		}
	}

	if plan.leader.is_none() {
		return match run_campaign(target, plan, current, health) {
			Some(campaign) => Action::LeaderElection(campaign),
			None => Action::NoActionPossible { reason: Reason::LeaderElectionImpossible },
		};
	}

	if let Some(highest_reported) = highest_reported_term(current) {
		if highest_reported > plan.term {
			return Action::UpdateTerm { new_term: highest_reported };
		}
	}

	if plan.write_concern != target.write_concern || plan.wait_for_sync != target.wait_for_sync {
		return Action::UpdateLogConfig { write_concern: target.write_concern, wait_for_sync: target.wait_for_sync };
	}

	for participant in &target.participants {
		if !plan.participants.contains_key(participant) {
			return Action::AddParticipantToPlan { participant: participant.clone() };
		}
	}
	for participant in plan.participants.keys() {
		if !target.participants.contains(participant) {
			return Action::RemoveParticipantFromPlan { participant: participant.clone() };
		}
	}

	for (participant, flags) in &plan.participants {
		let wanted = wanted_flags(target, participant);
		if *flags != wanted {
			return Action::UpdateParticipantFlags { participant: participant.clone(), flags: wanted };
		}
	}

	if current_reflects_plan(plan, current) && current.target_version_acked != Some(target.version) {
		return Action::ConvergedToTarget { version: target.version };
	}

	Action::Empty
}

fn wanted_flags(target: &Target, participant: &str) -> ParticipantFlags {
	ParticipantFlags { allowed_in_quorum: target.participants.contains(participant), allowed_as_leader: target.participants.contains(participant) }
}

fn plan_participants_subset_of_pool(plan: &Plan, health: &HealthMap) -> bool {
	plan.participants.keys().all(|p| health.contains_key(p))
}

fn is_healthy(health: &HealthMap, participant: &str) -> bool {
	health.get(participant).map(|h| h.not_failed).unwrap_or(false)
}

fn highest_reported_term(current: &Current) -> Option<u64> {
	current.local_states.values().map(|s| s.term).max()
}

/// Plan is reflected in Current once every participant's reported
/// local state has caught up to Plan's term.
fn current_reflects_plan(plan: &Plan, current: &Current) -> bool {
	if current.leader.as_ref() != plan.leader.as_ref() {
		return false;
	}
	plan.participants.keys().all(|p| current.local_states.get(p).map(|s| s.term >= plan.term).unwrap_or(false))
}

/// Supervision-level election campaign (spec §4.7 "Election campaign",
/// distinct from C3's per-term vote granting): eligibility requires a
/// live incarnation and a term at least as fresh as Plan's; among the
/// eligible, the highest `(spearhead_term, spearhead_index)` wins, and
/// a winner only exists once `writeConcern` participants are eligible.
fn run_campaign(target: &Target, plan: &Plan, current: &Current, health: &HealthMap) -> Option<Campaign> {
	let mut eligible: Vec<(&str, u64, u64)> = Vec::new();

	for participant in plan.participants.keys() {
		let healthy = health.get(participant).map(|h| h.not_failed).unwrap_or(false);
		if !healthy {
			continue;
		}
		if let Some(state) = current.local_states.get(participant) {
			if state.term < plan.term {
				continue;
			}
			eligible.push((participant.as_str(), state.spearhead_term, state.spearhead_index));
		}
	}

	if eligible.len() < target.write_concern {
		return None;
	}

	eligible.sort_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)));
	let (winner, _, _) = eligible.last()?;

	Some(Campaign { winner: winner.to_string(), new_term: plan.term + 1 })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::{CurrentLocalState, ParticipantHealth};
	use std::collections::BTreeMap;

	fn healthy(ids: &[&str]) -> HealthMap {
		ids.iter().map(|id| (id.to_string(), ParticipantHealth { reboot_id: 1, not_failed: true })).collect()
	}

	fn target(ids: &[&str], write_concern: usize) -> Target {
		Target { participants: ids.iter().map(|s| s.to_string()).collect(), write_concern, wait_for_sync: true, forced_leader: None, version: 1 }
	}

	fn reported(ids: &[&str], term: u64) -> Current {
		let local_states = ids.iter().map(|id| (id.to_string(), CurrentLocalState { term, spearhead_term: term, spearhead_index: 0 })).collect();
		Current { local_states, leader: None, target_version_acked: None }
	}

	#[test]
	fn missing_plan_materializes_target() {
		let snapshot = ManagedObjectSnapshot { target: target(&["a", "b", "c"], 2), plan: None, current: Current::default(), health: healthy(&["a", "b", "c"]) };
		assert_eq!(step(&snapshot), Action::AddLogToPlan);
	}

	#[test]
	fn fresh_plan_gets_an_initial_term() {
		let plan = Plan { term: 0, leader: None, participants: BTreeMap::new(), write_concern: 2, wait_for_sync: true };
		let snapshot = ManagedObjectSnapshot { target: target(&["a", "b", "c"], 2), plan: Some(plan), current: Current::default(), health: healthy(&["a", "b", "c"]) };
		assert_eq!(step(&snapshot), Action::CreateInitialTerm);
	}

	#[test]
	fn leaderless_plan_with_quorum_elects_a_leader() {
		let participants: BTreeMap<String, ParticipantFlags> = ["a", "b", "c"].iter().map(|s| (s.to_string(), ParticipantFlags::default())).collect();
		let plan = Plan { term: 1, leader: None, participants, write_concern: 2, wait_for_sync: true };
		let snapshot = ManagedObjectSnapshot { target: target(&["a", "b", "c"], 2), plan: Some(plan), current: reported(&["a", "b", "c"], 1), health: healthy(&["a", "b", "c"]) };
		match step(&snapshot) {
			Action::LeaderElection(campaign) => assert_eq!(campaign.new_term, 2),
			other => panic!("expected LeaderElection, got {other:?}"),
		}
	}

	#[test]
	fn leaderless_plan_without_quorum_reports_impossible() {
		let participants: BTreeMap<String, ParticipantFlags> = ["a", "b", "c"].iter().map(|s| (s.to_string(), ParticipantFlags::default())).collect();
		let plan = Plan { term: 1, leader: None, participants, write_concern: 2, wait_for_sync: true };
		let mut health = healthy(&["a"]);
		health.insert("b".to_string(), ParticipantHealth { reboot_id: 1, not_failed: false });
		health.insert("c".to_string(), ParticipantHealth { reboot_id: 1, not_failed: false });
		let snapshot = ManagedObjectSnapshot { target: target(&["a", "b", "c"], 2), plan: Some(plan), current: reported(&["a", "b", "c"], 1), health };
		assert_eq!(step(&snapshot), Action::NoActionPossible { reason: Reason::LeaderElectionImpossible });
	}

	#[test]
	fn unhealthy_leader_is_evicted() {
		let participants: BTreeMap<String, ParticipantFlags> = ["a", "b", "c"].iter().map(|s| (s.to_string(), ParticipantFlags::default())).collect();
		let plan = Plan { term: 1, leader: Some("a".to_string()), participants, write_concern: 2, wait_for_sync: true };
		let mut health = healthy(&["b", "c"]);
		health.insert("a".to_string(), ParticipantHealth { reboot_id: 1, not_failed: false });
		let snapshot = ManagedObjectSnapshot { target: target(&["a", "b", "c"], 2), plan: Some(plan), current: Current::default(), health };
		assert_eq!(step(&snapshot), Action::EvictLeader { leader: "a".to_string() });
	}

	#[test]
	fn converged_plan_acks_the_target_version() {
		let participants: BTreeMap<String, ParticipantFlags> = ["a", "b", "c"].iter().map(|s| (s.to_string(), ParticipantFlags::default())).collect();
		let plan = Plan { term: 1, leader: Some("a".to_string()), participants, write_concern: 2, wait_for_sync: true };
		let local_states = ["a", "b", "c"].iter().map(|s| (s.to_string(), CurrentLocalState { term: 1, spearhead_term: 1, spearhead_index: 5 })).collect();
		let current = Current { local_states, leader: Some("a".to_string()), target_version_acked: None };
		let snapshot = ManagedObjectSnapshot { target: target(&["a", "b", "c"], 2), plan: Some(plan), current, health: healthy(&["a", "b", "c"]) };
		assert_eq!(step(&snapshot), Action::ConvergedToTarget { version: 1 });
	}

	#[test]
	fn already_converged_plan_is_a_no_op() {
		let participants: BTreeMap<String, ParticipantFlags> = ["a", "b", "c"].iter().map(|s| (s.to_string(), ParticipantFlags::default())).collect();
		let plan = Plan { term: 1, leader: Some("a".to_string()), participants, write_concern: 2, wait_for_sync: true };
		let local_states = ["a", "b", "c"].iter().map(|s| (s.to_string(), CurrentLocalState { term: 1, spearhead_term: 1, spearhead_index: 5 })).collect();
		let current = Current { local_states, leader: Some("a".to_string()), target_version_acked: Some(1) };
		let snapshot = ManagedObjectSnapshot { target: target(&["a", "b", "c"], 2), plan: Some(plan), current, health: healthy(&["a", "b", "c"]) };
		assert_eq!(step(&snapshot), Action::Empty);
	}

	#[test]
	fn step_is_deterministic_given_identical_inputs() {
		let participants: BTreeMap<String, ParticipantFlags> = ["a", "b"].iter().map(|s| (s.to_string(), ParticipantFlags::default())).collect();
		let plan = Plan { term: 1, leader: None, participants, write_concern: 1, wait_for_sync: true };
		let snapshot = ManagedObjectSnapshot { target: target(&["a", "b"], 1), plan: Some(plan), current: Current::default(), health: healthy(&["a", "b"]) };
		assert_eq!(step(&snapshot), step(&snapshot));
	}
}
