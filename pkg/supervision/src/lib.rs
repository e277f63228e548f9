//! C7: the Target/Plan/Current control loop that runs on the leader
//! and converges managed objects toward their declared Target (spec
//! §3.5, §4.7). Built on top of `raft::agent::Agent` rather than
//! inside it, the same way the teacher keeps its Redis state machine
//! layered on top of its consensus core instead of merged into it.

pub mod action;
pub mod model;
pub mod step;
pub mod supervisor;

#[cfg(test)]
mod tests {
	use super::action::{Action, Campaign, Reason};
	use super::model::{
		ActionTrace, Current, CurrentLocalState, HealthMap, ManagedObjectSnapshot, ParticipantFlags, ParticipantHealth, Plan, StatusReport, Target,
	};
	use super::step::step;
	use super::supervisor::{StaticHealthSource, Supervisor, SupervisionConfig};
	use raft::agent::Agent;
	use raft::config_state::ConfigurationSnapshot;
	use raft::consensus::ClusterTiming;
	use raft::log::{MemoryLog, MemoryMetadataStore};
	use raft::protos::{Configuration, Operator, ScalarOrTree, Transaction, Write, WriteMode};
	use raft::rpc::mock::{MockNetwork, MockPeerClient};
	use std::collections::BTreeMap;
	use std::sync::Arc;
	use std::time::Duration;

	fn make_single_node_agent(network: &Arc<MockNetwork>) -> Arc<Agent> {
		let mut cfg = Configuration::default();
		cfg.members.insert("a".to_string());
		let peer_client = Arc::new(MockPeerClient { id: "a".to_string(), network: network.clone() });
		Agent::spawn(
			"a".to_string(),
			ConfigurationSnapshot { last_applied: 0, data: cfg },
			Arc::new(MemoryLog::new()),
			Arc::new(MemoryMetadataStore::default()),
			peer_client,
			BTreeMap::from([("a".to_string(), "mock://a".to_string())]),
			ClusterTiming { min_ping: Duration::from_millis(5), max_ping: Duration::from_millis(10), ..Default::default() },
			3,
		)
	}

	async fn settle(agent: &Arc<Agent>) {
		tokio::time::sleep(Duration::from_millis(15)).await;
		agent.tick_once().await;
	}

	fn target_json(target: &Target) -> String {
		serde_json::to_string(target).unwrap()
	}

	async fn seed_target(agent: &Agent, object: &str, target: &Target) {
		let tx = Transaction {
			writes: vec![Write { path: format!("/target/{object}"), operator: Operator::Set(ScalarOrTree::Str(target_json(target))), ttl_millis: None }],
			preconditions: BTreeMap::new(),
			client_id: "seed".into(),
		};
		let resp = agent.write(vec![tx], WriteMode::Normal).await;
		assert!(resp.accepted);
		agent.wait_for(resp.indices[0], Duration::from_secs(1)).await;
	}

	#[tokio::test]
	async fn first_tick_materializes_an_empty_target_into_a_plan() {
		let network = Arc::new(MockNetwork::default());
		let agent = make_single_node_agent(&network);
		network.nodes.lock().await.insert("a".into(), agent.clone());
		settle(&agent).await;

		let target = Target { participants: ["a".to_string()].into_iter().collect(), write_concern: 1, wait_for_sync: true, forced_leader: None, version: 1 };
		seed_target(&agent, "log1", &target).await;

		let health: HealthMap = [("a".to_string(), ParticipantHealth { reboot_id: 1, not_failed: true })].into_iter().collect();
		let supervisor = Supervisor::new(agent.clone(), Arc::new(StaticHealthSource(health)), SupervisionConfig::default());

		let first = supervisor.tick("log1").await;
		assert_eq!(first, Some(Action::AddLogToPlan));

		let second = supervisor.tick("log1").await;
		assert_eq!(second, Some(Action::CreateInitialTerm));

		let third = supervisor.tick("log1").await;
		match third {
			Some(Action::LeaderElection(campaign)) => assert_eq!(campaign.winner, "a"),
			other => panic!("expected a leader election once the quorum is healthy, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn unreachable_leader_is_retried_as_a_status_report() {
		let network = Arc::new(MockNetwork::default());
		let agent = make_single_node_agent(&network);
		network.nodes.lock().await.insert("a".into(), agent.clone());
		settle(&agent).await;

		let target = Target { participants: ["a".to_string()].into_iter().collect(), write_concern: 1, wait_for_sync: true, forced_leader: None, version: 1 };
		seed_target(&agent, "log1", &target).await;

		let health: HealthMap = [("a".to_string(), ParticipantHealth { reboot_id: 1, not_failed: false })].into_iter().collect();
		let supervisor = Supervisor::new(agent.clone(), Arc::new(StaticHealthSource(health)), SupervisionConfig::default());

		supervisor.tick("log1").await; // AddLogToPlan
		supervisor.tick("log1").await; // CreateInitialTerm
		let third = supervisor.tick("log1").await;
		assert_eq!(third, Some(Action::NoActionPossible { reason: Reason::LeaderElectionImpossible }));

		let resp = agent.read(vec!["/current/log1/supervision".to_string()]).await;
		let trace: ActionTrace = match &resp.result[0] {
			ScalarOrTree::Str(s) => serde_json::from_str(s).unwrap(),
			_ => panic!("expected a JSON status report blob"),
		};
		assert_eq!(trace.entries.last().unwrap().reason, "LeaderElectionImpossible");
	}

	#[test]
	fn step_predicate_order_prefers_dictate_leader_over_eviction() {
		let participants: BTreeMap<String, ParticipantFlags> = ["a", "b"].into_iter().map(|s| (s.to_string(), ParticipantFlags::default())).collect();
		let plan = Plan { term: 1, leader: Some("a".to_string()), participants, write_concern: 1, wait_for_sync: true };
		let target = Target { participants: ["a".to_string(), "b".to_string()].into_iter().collect(), write_concern: 1, wait_for_sync: true, forced_leader: Some("b".to_string()), version: 2 };
		let health: HealthMap = [("a".to_string(), ParticipantHealth { reboot_id: 1, not_failed: false }), ("b".to_string(), ParticipantHealth { reboot_id: 1, not_failed: true })].into_iter().collect();
		let snapshot = ManagedObjectSnapshot { target, plan: Some(plan), current: Current::default(), health };

		// A forced Target leader is dictated even though the current
		// leader is simultaneously unhealthy: DictateLeader is checked
		// before EvictLeader in the strict predicate order.
		assert_eq!(step(&snapshot), Action::DictateLeader { leader: "b".to_string() });
	}

	#[test]
	fn action_trace_drops_oldest_entries_past_the_cap() {
		let mut trace = ActionTrace::default();
		for i in 0..5 {
			trace.push(StatusReport { reason: format!("r{i}"), timestamp_millis: i }, 3);
		}
		assert_eq!(trace.entries.len(), 3);
		assert_eq!(trace.entries[0].reason, "r2");
		assert_eq!(trace.entries[2].reason, "r4");
	}

	#[test]
	fn campaign_picks_the_highest_spearhead_among_eligible_peers() {
		let participants: BTreeMap<String, ParticipantFlags> = ["a", "b"].into_iter().map(|s| (s.to_string(), ParticipantFlags::default())).collect();
		let plan = Plan { term: 1, leader: None, participants, write_concern: 2, wait_for_sync: true };
		let target = Target { participants: ["a".to_string(), "b".to_string()].into_iter().collect(), write_concern: 2, wait_for_sync: true, forced_leader: None, version: 1 };
		let health: HealthMap = [("a".to_string(), ParticipantHealth { reboot_id: 1, not_failed: true }), ("b".to_string(), ParticipantHealth { reboot_id: 1, not_failed: true })].into_iter().collect();
		let local_states = [("a".to_string(), CurrentLocalState { term: 1, spearhead_term: 1, spearhead_index: 3 }), ("b".to_string(), CurrentLocalState { term: 1, spearhead_term: 2, spearhead_index: 1 })].into_iter().collect();
		let current = Current { local_states, leader: None, target_version_acked: None };
		let snapshot = ManagedObjectSnapshot { target, plan: Some(plan), current, health };

		match step(&snapshot) {
			Action::LeaderElection(Campaign { winner, .. }) => assert_eq!(winner, "b"),
			other => panic!("expected b to win on a higher spearhead term, got {other:?}"),
		}
	}
}
