//! C7's background task: wakes on a fixed period, runs one
//! Snapshot/Decide/Execute cycle per managed object (spec §4.7), and
//! submits the resulting transaction through `raft::agent::Agent`.
//! Structured the same way `raft::compactor::Compactor` is — a plain
//! struct holding its tunables, spawned as its own `tokio::task` so a
//! slow decide step never blocks replication or client writes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use raft::agent::Agent;
use raft::protos::{MixedOperation, Operator, Precondition, ScalarOrTree, Transaction, Write};
use tracing::{debug, warn};

use crate::action::{Action, Reason};
use crate::model::{ActionTrace, Current, HealthMap, ManagedObjectSnapshot, ParticipantFlags, Plan, StatusReport, Target};
use crate::step::step;

/// Pluggable source of participant liveness (spec §4.7's `health` map).
/// Heartbeat aggregation lives outside this crate's scope; tests and
/// `agencyd` both provide their own implementation.
pub trait HealthSource: Send + Sync {
	fn health(&self) -> HealthMap;
}

pub struct StaticHealthSource(pub HealthMap);

impl HealthSource for StaticHealthSource {
	fn health(&self) -> HealthMap {
		self.0.clone()
	}
}

#[derive(Debug, Clone)]
pub struct SupervisionConfig {
	pub tick_interval: Duration,
	pub max_actions_trace_length: usize,
}

impl Default for SupervisionConfig {
	fn default() -> Self {
		SupervisionConfig { tick_interval: Duration::from_millis(250), max_actions_trace_length: 50 }
	}
}

pub struct Supervisor {
	agent: Arc<Agent>,
	health: Arc<dyn HealthSource>,
	config: SupervisionConfig,
}

fn target_path(object: &str) -> String {
	format!("/target/{object}")
}
fn plan_path(object: &str) -> String {
	format!("/plan/{object}")
}
fn current_path(object: &str) -> String {
	format!("/current/{object}")
}
fn status_path(object: &str) -> String {
	format!("/current/{object}/supervision")
}

impl Supervisor {
	pub fn new(agent: Arc<Agent>, health: Arc<dyn HealthSource>, config: SupervisionConfig) -> Self {
		Supervisor { agent, health, config }
	}

	/// Runs ticks forever (or until `shutdown` fires), one Supervisor
	/// sweep over `objects` per period. Inert when this Agent is not
	/// the leader: `Agent::write` itself rejects with `redirect` and
	/// the tick simply does nothing that period (spec §4.7 "Runs only
	/// on the leader").
	pub async fn run(self: Arc<Self>, objects: Vec<String>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
		loop {
			for object in &objects {
				self.tick(object).await;
			}
			tokio::select! {
				_ = &mut shutdown => return,
				_ = tokio::time::sleep(self.config.tick_interval) => {}
			}
		}
	}

	/// One Snapshot/Decide/Execute cycle for a single managed object.
	/// Returns the action taken, mostly for test observability.
	pub async fn tick(&self, object: &str) -> Option<Action> {
		let snapshot = self.read_snapshot(object).await?;
		let action = step(&snapshot);
		self.execute(object, &snapshot, action.clone()).await;
		Some(action)
	}

	async fn read_snapshot(&self, object: &str) -> Option<ManagedObjectSnapshot> {
		let paths = vec![target_path(object), plan_path(object), current_path(object)];
		let resp = self.agent.read(paths).await;
		if !resp.accepted {
			return None;
		}

		let target: Target = read_json(&resp.result[0])?;
		let plan: Option<Plan> = read_json(&resp.result[1]);
		let current: Current = read_json(&resp.result[2]).unwrap_or_default();

		Some(ManagedObjectSnapshot { target, plan, current, health: self.health.health() })
	}

	async fn execute(&self, object: &str, snapshot: &ManagedObjectSnapshot, action: Action) {
		if !action.is_write() {
			if let Action::NoActionPossible { reason } | Action::ErrorAction { reason } = &action {
				self.write_status_report(object, reason).await;
			}
			return;
		}

		let old_plan_json = snapshot.plan.as_ref().map(to_json);
		let new_plan = apply_action_to_plan(snapshot, &action);

		let mut tx = Transaction { writes: vec![], preconditions: BTreeMap::new(), client_id: format!("supervision-{object}") };

		match &old_plan_json {
			Some(json) => {
				tx.preconditions.insert(plan_path(object), Precondition::EqualToValue(ScalarOrTree::Str(json.clone())));
			}
			None => {
				tx.preconditions.insert(plan_path(object), Precondition::OldEmpty);
			}
		}

		tx.writes.push(Write { path: plan_path(object), operator: Operator::Set(ScalarOrTree::Str(to_json(&new_plan))), ttl_millis: None });

		if let Action::ConvergedToTarget { version } = &action {
			let mut current = snapshot.current.clone();
			current.target_version_acked = Some(*version);
			tx.writes.push(Write { path: current_path(object), operator: Operator::Set(ScalarOrTree::Str(to_json(&current))), ttl_millis: None });
		}

		let resp = self.agent.transact(MixedOperation { transaction: tx, reads: vec![] }).await;
		if !resp.accepted {
			debug!(object, "supervision tick skipped: not leader");
		} else if resp.outcome != raft::protos::Outcome::Applied {
			// Plan changed mid-tick (spec §4.7 "Failure semantics"):
			// discard, the next period re-evaluates from scratch.
			debug!(object, "supervision write lost a precondition race, will retry next period");
		}
	}

	async fn write_status_report(&self, object: &str, reason: &Reason) {
		let path = status_path(object);
		let resp = self.agent.read(vec![path.clone()]).await;
		let mut trace: ActionTrace = resp.result.first().and_then(read_json).unwrap_or_default();
		trace.push(StatusReport { reason: reason.as_str().to_string(), timestamp_millis: 0 }, self.config.max_actions_trace_length);

		let tx = Transaction {
			writes: vec![Write { path, operator: Operator::Set(ScalarOrTree::Str(to_json(&trace))), ttl_millis: None }],
			preconditions: BTreeMap::new(),
			client_id: format!("supervision-status-{object}"),
		};
		let resp = self.agent.transact(MixedOperation { transaction: tx, reads: vec![] }).await;
		if !resp.accepted {
			warn!(object, "could not record supervision status report: not leader");
		}
	}
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
	serde_json::to_string(value).expect("supervision model types always serialize")
}

fn read_json<T: serde::de::DeserializeOwned>(value: &ScalarOrTree) -> Option<T> {
	match value {
		ScalarOrTree::Str(s) => serde_json::from_str(s).ok(),
		_ => None,
	}
}

/// Applies a decided `Action` to produce the next Plan value. Every
/// write-producing branch of `Action` has exactly one corresponding
/// transformation here — kept a total match so a new `Action` variant
/// fails to compile until this function (and `step`) both handle it.
fn apply_action_to_plan(snapshot: &ManagedObjectSnapshot, action: &Action) -> Plan {
	let mut plan = snapshot.plan.clone().unwrap_or_else(|| Plan {
		term: 0,
		leader: None,
		participants: snapshot.target.participants.iter().map(|p| (p.clone(), ParticipantFlags::default())).collect(),
		write_concern: snapshot.target.write_concern,
		wait_for_sync: snapshot.target.wait_for_sync,
	});

	match action {
		Action::AddLogToPlan => {}
		Action::CreateInitialTerm => {
			plan.term = 1;
		}
		Action::LeaderElection(campaign) => {
			plan.term = campaign.new_term;
			plan.leader = Some(campaign.winner.clone());
		}
		Action::UpdateTerm { new_term } => {
			plan.term = *new_term;
		}
		Action::DictateLeader { leader } => {
			plan.term += 1;
			plan.leader = Some(leader.clone());
		}
		Action::EvictLeader { .. } => {
			plan.leader = None;
		}
		Action::UpdateParticipantFlags { participant, flags } => {
			plan.participants.insert(participant.clone(), *flags);
		}
		Action::AddParticipantToPlan { participant } => {
			plan.participants.insert(participant.clone(), ParticipantFlags::default());
		}
		Action::RemoveParticipantFromPlan { participant } => {
			plan.participants.remove(participant);
		}
		Action::UpdateLogConfig { write_concern, wait_for_sync } => {
			plan.write_concern = *write_concern;
			plan.wait_for_sync = *wait_for_sync;
		}
		Action::ConvergedToTarget { .. } => {}
		Action::Empty | Action::NoActionPossible { .. } | Action::ErrorAction { .. } => {
			unreachable!("execute() only calls apply_action_to_plan for Action::is_write() actions")
		}
	}

	plan
}
