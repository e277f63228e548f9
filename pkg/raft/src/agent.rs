//! C4: the central orchestrator (spec §4.4). Owns the spearhead and
//! committed `Store` instances behind the locks spec §4.4 names
//! (`io_lock`, `output_lock`), drives the `ConsensusModule`'s ticks,
//! and exposes the client-facing API (`write`/`read`/`transact`/
//! `inquire`/`poll`/`wait_for`/`is_committed`).
//!
//! Lock ordering mirrors spec §4.4/§5 exactly: `io_lock` (spearhead)
//! → `log` → `output_lock` (committed store) → `wait_for_cv` →
//! `ti_lock`. `ti_lock` is folded into the `consensus` mutex, since
//! per-follower progress lives inside `ConsensusModule`'s leader
//! state; nothing else is ever held while waiting on `wait_for_cv`.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{info, warn};

use crate::config_state::ConfigurationSnapshot;
use crate::consensus::{ClusterTiming, ConsensusModule, MessageBody, ProposeError, Tick};
use crate::errors::{Error, Result};
use crate::log::{LogStorage, MetadataStore};
use crate::protos::{
	AppendEntriesResponse, InquireResponse, LogEntry, LogEntryData, LogIndex, MixedOperation, Outcome, ReadResponse, RequestVoteRequest, RequestVoteResponse,
	ScalarOrTree, ServerId, Transaction, TransactResponse, TransactionPayload, WriteMode, WriteResponse,
};
use crate::rpc::PeerClient;
use crate::store::observer::Notification;
use crate::store::Store;

struct InquiryRecord {
	outcome: Outcome,
	index: LogIndex,
}

pub struct Agent {
	id: ServerId,
	consensus: Mutex<ConsensusModule>,
	log: Arc<dyn LogStorage>,
	metadata_store: Arc<dyn MetadataStore>,
	spearhead: Mutex<Store>,
	committed: RwLock<Store>,
	committed_applied: Mutex<LogIndex>,
	endpoints: RwLock<BTreeMap<ServerId, String>>,
	peer_client: Arc<dyn PeerClient>,
	append_cv: Notify,
	wait_for_cv: Notify,
	client_index: Mutex<BTreeMap<String, InquiryRecord>>,
	resigned: Notify,
	/// Fires observer HTTP callbacks (spec §4.1 "observer firing");
	/// kept on the Agent rather than built per-delivery since building
	/// a `reqwest::Client` pools its own connections.
	observer_client: reqwest::Client,
	/// Set once, right after construction, so background RPC tasks can
	/// recover an `Arc<Agent>` to feed responses back into `consensus`
	/// without `Agent` itself needing to be the task's owner.
	self_ref: OnceLock<Weak<Agent>>,
}

impl Agent {
	/// Builds the `Agent` and wires its self-reference; always use this
	/// instead of a bare constructor, since replication cannot dispatch
	/// messages without it.
	pub fn spawn(
		id: ServerId,
		config_snapshot: ConfigurationSnapshot,
		log: Arc<dyn LogStorage>,
		metadata_store: Arc<dyn MetadataStore>,
		peer_client: Arc<dyn PeerClient>,
		endpoints: BTreeMap<ServerId, String>,
		timing: ClusterTiming,
		observer_max_misses: u32,
	) -> Arc<Self> {
		let meta = metadata_store.load();
		let consensus = ConsensusModule::new(id.clone(), meta, config_snapshot, log.clone(), timing, Instant::now());

		let agent = Arc::new(Agent {
			id,
			consensus: Mutex::new(consensus),
			log,
			metadata_store,
			spearhead: Mutex::new(Store::new(observer_max_misses)),
			committed: RwLock::new(Store::new(observer_max_misses)),
			committed_applied: Mutex::new(0),
			endpoints: RwLock::new(endpoints),
			peer_client,
			append_cv: Notify::new(),
			wait_for_cv: Notify::new(),
			client_index: Mutex::new(BTreeMap::new()),
			resigned: Notify::new(),
			observer_client: reqwest::Client::new(),
			self_ref: OnceLock::new(),
		});
		let _ = agent.self_ref.set(Arc::downgrade(&agent));
		agent
	}

	pub fn id(&self) -> &ServerId {
		&self.id
	}

	fn arc_self(&self) -> Option<Arc<Agent>> {
		self.self_ref.get().and_then(Weak::upgrade)
	}

	// --- Client API (spec §4.4) ----------------------------------------

	pub async fn write(&self, transactions: Vec<Transaction>, mode: WriteMode) -> WriteResponse {
		// spearhead staging happens under io_lock; this keeps the
		// critical section small and lets propose_command (which needs
		// the consensus lock, not io_lock) run outside it.
		let checked = mode == WriteMode::Normal;
		let results = {
			let mut spearhead = self.spearhead.lock().await;
			spearhead.apply_batch(&transactions, checked)
		};

		let mut consensus = self.consensus.lock().await;
		if !consensus.is_leader() {
			let hint = consensus.leader_hint();
			return WriteResponse { accepted: false, redirect: hint, applied: vec![], indices: vec![] };
		}

		let mut applied = Vec::with_capacity(transactions.len());
		let mut indices = Vec::with_capacity(transactions.len());

		for (tx, (outcome, _changed)) in transactions.iter().zip(results.into_iter()) {
			if outcome != Outcome::Applied {
				applied.push(outcome);
				indices.push(0);
				continue;
			}

			let mut tick = Tick::empty(Instant::now());
			let payload = TransactionPayload { transactions: vec![tx.clone()] };
			let now = crate::store::tree::now_millis();
			match consensus.propose_command(tx.client_id.clone(), now, payload, &mut tick) {
				Ok(pos) => {
					applied.push(Outcome::Applied);
					indices.push(pos.index);
					self.record_client_outcome(&tx.client_id, Outcome::Applied, pos.index).await;
				}
				Err(ProposeError::NotLeader { leader_hint }) => {
					drop(consensus);
					return WriteResponse { accepted: false, redirect: leader_hint, applied: vec![], indices: vec![] };
				}
				Err(ProposeError::RetryAfter(_)) => {
					applied.push(Outcome::UnknownError { reason: "a configuration change is already pending".into() });
					indices.push(0);
				}
			}
			self.dispatch(&mut tick);
		}

		let commit_index = consensus.meta().commit_index;
		drop(consensus);

		// A single-node cluster (or any case where the leader's own
		// match_index alone forms a majority) commits synchronously
		// above, with nobody else's callback left to apply it.
		self.apply_committed(commit_index).await;
		self.append_cv.notify_waiters();
		WriteResponse { accepted: true, redirect: None, applied, indices }
	}

	pub async fn read(&self, paths: Vec<String>) -> ReadResponse {
		let consensus = self.consensus.lock().await;
		if !consensus.is_leader() {
			let hint = consensus.leader_hint();
			return ReadResponse { accepted: false, redirect: hint, success: vec![], result: vec![] };
		}
		drop(consensus);

		let committed = self.committed.read().await;
		let result = committed.read(&paths);
		ReadResponse { accepted: true, redirect: None, success: vec![true; result.len()], result }
	}

	/// The mixed read/write primitive (spec §4.1 `transact`): runs
	/// `op.transaction` exactly like `write`, then reads `op.reads`
	/// back against the resulting committed state under the same call
	/// — "a sequence of reads and writes with a single atomic
	/// boundary". Reads are skipped (empty `results`) unless the
	/// transaction itself was applied.
	pub async fn transact(&self, op: MixedOperation) -> TransactResponse {
		let write_resp = self.write(vec![op.transaction], WriteMode::Normal).await;
		if !write_resp.accepted {
			return TransactResponse {
				accepted: false,
				redirect: write_resp.redirect,
				outcome: Outcome::UnknownError { reason: "not the leader".into() },
				index: 0,
				results: vec![],
			};
		}

		let outcome = write_resp.applied.into_iter().next().unwrap_or(Outcome::UnknownError { reason: "empty transaction batch".into() });
		let index = write_resp.indices.into_iter().next().unwrap_or(0);
		let results = if outcome == Outcome::Applied && !op.reads.is_empty() {
			self.committed.read().await.read(&op.reads)
		} else {
			vec![]
		};

		TransactResponse { accepted: true, redirect: None, outcome, index, results }
	}

	pub async fn inquire(&self, client_ids: Vec<String>) -> InquireResponse {
		let index = self.client_index.lock().await;
		let mut outcomes = BTreeMap::new();
		for id in client_ids {
			let entry = index.get(&id).map(|r| (r.outcome.clone(), r.index));
			outcomes.insert(id, entry);
		}
		InquireResponse { outcomes }
	}

	/// Long-polls for entries with index > `after`. Resolves with
	/// whatever is newly committed, with an empty result on timeout or
	/// on resignation (spec §4.4 `poll`).
	pub async fn poll(&self, after: LogIndex, timeout: Duration) -> Vec<LogEntry> {
		let deadline = Instant::now() + timeout;
		loop {
			{
				let applied = *self.committed_applied.lock().await;
				if applied > after {
					return self.log.get(after + 1, applied);
				}
			}
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				return vec![];
			}
			tokio::select! {
				_ = self.wait_for_cv.notified() => {}
				_ = self.resigned.notified() => return vec![],
				_ = tokio::time::sleep(remaining) => return vec![],
			}
		}
	}

	pub async fn wait_for(&self, index: LogIndex, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		loop {
			if self.is_committed(index).await {
				return true;
			}
			let remaining = deadline.saturating_duration_since(Instant::now());
			if remaining.is_zero() {
				return false;
			}
			tokio::select! {
				_ = self.wait_for_cv.notified() => {}
				_ = tokio::time::sleep(remaining) => return false,
			}
		}
	}

	pub async fn is_committed(&self, index: LogIndex) -> bool {
		self.consensus.lock().await.meta().commit_index >= index
	}

	async fn record_client_outcome(&self, client_id: &str, outcome: Outcome, index: LogIndex) {
		if client_id.is_empty() {
			return;
		}
		self.client_index.lock().await.insert(client_id.to_string(), InquiryRecord { outcome, index });
	}

	// --- Peer-facing RPC handlers ---------------------------------------

	pub async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
		let mut consensus = self.consensus.lock().await;
		let mut tick = Tick::empty(Instant::now());
		let resp = consensus.request_vote(req, &mut tick);
		if tick.meta {
			let _ = self.metadata_store.save(consensus.meta());
		}
		drop(consensus);
		self.dispatch(&mut tick);
		resp
	}

	pub async fn handle_append_entries(&self, req: crate::protos::AppendEntriesRequest) -> Result<AppendEntriesResponse> {
		let mut consensus = self.consensus.lock().await;
		let mut tick = Tick::empty(Instant::now());
		let constraint = consensus.append_entries(req, &mut tick)?;
		if tick.meta {
			self.metadata_store.save(consensus.meta()).map_err(|source| Error::Durability { what: "metadata".into(), source })?;
		}
		let commit_index = consensus.meta().commit_index;
		drop(consensus);

		if tick.new_entries {
			self.append_cv.notify_waiters();
		}
		self.apply_committed(commit_index).await;
		self.dispatch(&mut tick);

		Ok(constraint.satisfied())
	}

	pub async fn handle_install_snapshot(&self, req: crate::protos::InstallSnapshotRequest) -> crate::protos::InstallSnapshotResponse {
		let mut consensus = self.consensus.lock().await;
		let mut tick = Tick::empty(Instant::now());
		consensus.observe_remote_term(req.term, &mut tick);
		let current_term = consensus.meta().current_term;
		if tick.meta {
			let _ = self.metadata_store.save(consensus.meta());
		}
		drop(consensus);
		self.dispatch(&mut tick);

		if req.term < current_term {
			return crate::protos::InstallSnapshotResponse { term: current_term, success: false };
		}

		match self.install_snapshot(req.last_included_index, req.last_included_term, &req.data).await {
			Ok(()) => crate::protos::InstallSnapshotResponse { term: current_term, success: true },
			Err(e) => {
				warn!(error = %e, "failed to install snapshot from leader");
				crate::protos::InstallSnapshotResponse { term: current_term, success: false }
			}
		}
	}

	// --- Background replication loop ------------------------------------

	/// Runs until `shutdown` resolves. Each iteration ticks the
	/// consensus module, dispatches any resulting messages, then sleeps
	/// until the next scheduled tick or an external wakeup
	/// (`append_cv`, e.g. a fresh client write).
	pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
		loop {
			let next_tick = self.tick_once().await;

			tokio::select! {
				_ = &mut shutdown => return,
				_ = self.append_cv.notified() => {}
				_ = tokio::time::sleep(next_tick) => {}
			}
		}
	}

	/// Runs exactly one `cycle()` plus its outgoing dispatch, without
	/// sleeping — the unit of work `run()`'s loop body performs each
	/// iteration, exposed separately so tests can drive elections and
	/// replication deterministically instead of waiting on real timers.
	pub async fn tick_once(&self) -> Duration {
		let mut consensus = self.consensus.lock().await;
		let mut tick = Tick::empty(Instant::now());
		let was_leader = consensus.is_leader();
		consensus.cycle(&mut tick);
		if was_leader && !consensus.is_leader() {
			self.resigned.notify_waiters();
		}
		if tick.meta {
			let _ = self.metadata_store.save(consensus.meta());
		}
		let commit_index = consensus.meta().commit_index;
		drop(consensus);
		self.dispatch(&mut tick);
		self.apply_committed(commit_index).await;
		tick.next_tick.unwrap_or(Duration::from_millis(50))
	}

	/// Sends every message a tick produced, spawning one task per
	/// `(message, recipient)` so a slow/unreachable follower never
	/// blocks the others (spec §4.4 replication loop step 6: "send
	/// asynchronously"). Each task feeds the RPC's response back into
	/// `consensus` via the matching callback once it resolves.
	fn dispatch(&self, tick: &mut Tick) {
		let Some(agent) = self.arc_self() else {
			warn!("dropping outgoing messages: agent has no self-reference yet");
			return;
		};

		for message in tick.messages.drain(..) {
			match message.body {
				MessageBody::RequestVote(req) => {
					for to in message.to {
						let agent = agent.clone();
						let req = req.clone();
						tokio::spawn(async move { agent.send_request_vote(to, req).await });
					}
				}
				MessageBody::AppendEntries(req, last_index) => {
					for to in message.to {
						let agent = agent.clone();
						let req = req.clone();
						tokio::spawn(async move { agent.send_append_entries(to, req, last_index).await });
					}
				}
			}
		}
	}

	async fn endpoint_for(&self, peer: &ServerId) -> Option<String> {
		self.endpoints.read().await.get(peer).cloned()
	}

	async fn send_request_vote(self: Arc<Self>, to: ServerId, req: RequestVoteRequest) {
		let Some(endpoint) = self.endpoint_for(&to).await else { return };
		match self.peer_client.request_vote(&to, &endpoint, req).await {
			Ok(resp) => {
				let mut consensus = self.consensus.lock().await;
				let mut tick = Tick::empty(Instant::now());
				consensus.request_vote_callback(to, resp, &mut tick);
				if tick.meta {
					let _ = self.metadata_store.save(consensus.meta());
				}
				drop(consensus);
				self.dispatch(&mut tick);
				self.append_cv.notify_waiters();
			}
			Err(e) => warn!(peer = %to, error = %e, "request_vote failed"),
		}
	}

	async fn send_append_entries(self: Arc<Self>, to: ServerId, req: crate::protos::AppendEntriesRequest, last_index: LogIndex) {
		let Some(endpoint) = self.endpoint_for(&to).await else { return };
		let mut consensus = self.consensus.lock().await;
		let mut tick = Tick::empty(Instant::now());
		match self.peer_client.append_entries(&to, &endpoint, req).await {
			Ok(resp) => consensus.append_entries_callback(to, last_index, resp, &mut tick),
			Err(_) => consensus.append_entries_noresponse(to, &mut tick),
		}
		if tick.meta {
			let _ = self.metadata_store.save(consensus.meta());
		}
		let commit_index = consensus.meta().commit_index;
		drop(consensus);
		self.dispatch(&mut tick);
		self.apply_committed(commit_index).await;
		self.append_cv.notify_waiters();
	}

	/// Copies newly committed log entries into the committed Store and
	/// wakes anyone waiting on `commit_index` (spec §4.4 "apply newly
	/// committed entries to committed Store; broadcast wait_for_cv").
	async fn apply_committed(&self, commit_index: LogIndex) {
		let mut applied = self.committed_applied.lock().await;
		if commit_index <= *applied {
			return;
		}

		let entries = self.log.get(*applied + 1, commit_index);
		let mut changed_paths = Vec::new();
		{
			let mut committed = self.committed.write().await;
			for entry in &entries {
				if let LogEntryData::Transaction(payload) = &entry.data {
					for tx in &payload.transactions {
						let (outcome, changed) = committed.apply_transaction(tx, false);
						if outcome == Outcome::Applied {
							changed_paths.extend(changed);
						}
					}
				}
			}
		}
		*applied = commit_index;
		drop(applied);

		if !changed_paths.is_empty() {
			let notifications = { self.committed.read().await.notifications_for(&changed_paths) };
			if !notifications.is_empty() {
				info!(count = notifications.len(), "notifying observers of committed changes");
				if let Some(arc_self) = self.arc_self() {
					tokio::spawn(async move { arc_self.deliver_observer_notifications(notifications).await });
				}
			}
		}
		self.wait_for_cv.notify_waiters();
	}

	/// Delivers one batch of observer callbacks and feeds each outcome
	/// into the trash-bin miss counter (spec §8 S7), off the commit-
	/// apply path so a slow or dead observer endpoint never blocks
	/// replication.
	async fn deliver_observer_notifications(self: Arc<Self>, notifications: Vec<Notification>) {
		for note in notifications {
			let delivered = self.post_observer_notification(&note).await;
			let should_evict = { self.committed.write().await.record_delivery(&note.url, delivered) };
			if should_evict {
				warn!(url = %note.url, "observer crossed miss threshold, evicting");
				self.evict_observer(&note.url).await;
			}
		}
	}

	async fn post_observer_notification(&self, note: &Notification) -> bool {
		let body = serde_json::json!({ "path": note.path, "client_id": note.client_id });
		match self.observer_client.post(&note.url).timeout(Duration::from_secs(5)).json(&body).send().await {
			Ok(resp) => resp.status().is_success(),
			Err(_) => false,
		}
	}

	pub async fn resign(&self) {
		let consensus = self.consensus.lock().await;
		if consensus.is_leader() {
			warn!("resigning leadership");
		}
		let mut spearhead = self.spearhead.lock().await;
		*spearhead = Store::new(3);
		drop(spearhead);
		drop(consensus);
		self.resigned.notify_waiters();
	}

	pub fn set_endpoint(&self, id: ServerId, endpoint: String) -> impl std::future::Future<Output = ()> + '_ {
		async move {
			self.endpoints.write().await.insert(id, endpoint);
		}
	}

	pub async fn observe(&self, path: &str, url: &str, client_id: &str) -> Result<()> {
		let mut committed = self.committed.write().await;
		committed.observe(path, url, client_id).map_err(|e| Error::InvariantViolation(e.to_string()))
	}

	pub async fn unobserve(&self, path: &str, url: &str, client_id: &str) -> Result<()> {
		let mut committed = self.committed.write().await;
		committed.unobserve(path, url, client_id).map_err(|e| Error::InvariantViolation(e.to_string()))
	}

	pub async fn dump_committed(&self) -> Vec<u8> {
		self.committed.read().await.dump()
	}

	pub fn log_handle(&self) -> Arc<dyn LogStorage> {
		self.log.clone()
	}

	pub async fn commit_index(&self) -> LogIndex {
		self.consensus.lock().await.meta().commit_index
	}

	/// Installs a compactor-produced snapshot (spec §4.5): replaces the
	/// committed Store wholesale, drops covered log entries, and fast-
	/// forwards the commit index. Used both by the leader's own
	/// compactor and by a follower that received one via RPC.
	pub async fn install_snapshot(&self, last_included_index: LogIndex, last_included_term: crate::protos::Term, data: &[u8]) -> Result<()> {
		{
			let mut committed = self.committed.write().await;
			committed.load(data)?;
		}
		self.log.compact(last_included_index, last_included_term);

		let mut applied = self.committed_applied.lock().await;
		if last_included_index > *applied {
			*applied = last_included_index;
		}
		drop(applied);

		let mut consensus = self.consensus.lock().await;
		let mut tick = Tick::empty(Instant::now());
		consensus.observe_snapshot(last_included_index, &mut tick);
		if tick.meta {
			self.metadata_store.save(consensus.meta()).map_err(|source| Error::Durability { what: "metadata".into(), source })?;
		}
		drop(consensus);

		self.wait_for_cv.notify_waiters();
		Ok(())
	}

	/// Evicts `url` from every committed node's observer list via a
	/// normal proposed transaction (spec §8 S7's trash-bin GC). No-op
	/// if this node isn't currently the leader.
	pub fn evict_observer<'a>(&'a self, url: &'a str) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
		Box::pin(async move {
			let tx = { self.committed.read().await.evict_observer_transaction(url) };
			if tx.writes.is_empty() {
				return;
			}
			let _ = self.write(vec![tx], WriteMode::Unchecked).await;
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config_state::ConfigurationSnapshot;
	use crate::log::{MemoryLog, MemoryMetadataStore};
	use crate::protos::{Configuration, Operator, Precondition};
	use crate::rpc::mock::{MockNetwork, MockPeerClient};
	use std::collections::BTreeMap as Map;

	fn config(members: &[&str]) -> ConfigurationSnapshot {
		let mut cfg = Configuration::default();
		for m in members {
			cfg.members.insert((*m).to_string());
		}
		ConfigurationSnapshot { last_applied: 0, data: cfg }
	}

	fn make_agent(id: &str, members: &[&str], network: &Arc<MockNetwork>) -> Arc<Agent> {
		let peer_client = Arc::new(MockPeerClient { id: id.to_string(), network: network.clone() });
		let endpoints: Map<ServerId, String> = members.iter().map(|m| (m.to_string(), format!("mock://{m}"))).collect();
		Agent::spawn(
			id.to_string(),
			config(members),
			Arc::new(MemoryLog::new()),
			Arc::new(MemoryMetadataStore::default()),
			peer_client,
			endpoints,
			ClusterTiming { min_ping: Duration::from_millis(10), max_ping: Duration::from_millis(20), ..Default::default() },
			3,
		)
	}

	async fn run_ticks(agents: &[Arc<Agent>], rounds: usize) {
		for _ in 0..rounds {
			for agent in agents {
				agent.tick_once().await;
			}
			// Give every spawned RPC/callback task a chance to run to
			// completion before the next round drives another cycle().
			for _ in 0..20 {
				tokio::time::sleep(Duration::from_millis(1)).await;
			}
		}
	}

	#[tokio::test]
	async fn single_node_cluster_accepts_writes() {
		let network = Arc::new(MockNetwork::default());
		let agent = make_agent("a", &["a"], &network);
		network.nodes.lock().await.insert("a".into(), agent.clone());

		run_ticks(&[agent.clone()], 5).await;
		assert!(agent.consensus.lock().await.is_leader());

		let tx = Transaction {
			writes: vec![crate::protos::Write { path: "/x".into(), operator: Operator::Set(ScalarOrTree::Int(7)), ttl_millis: None }],
			preconditions: Map::new(),
			client_id: "client-1".into(),
		};
		let resp = agent.write(vec![tx], WriteMode::Normal).await;
		assert!(resp.accepted);
		assert_eq!(resp.applied, vec![Outcome::Applied]);

		assert!(agent.wait_for(resp.indices[0], Duration::from_secs(1)).await);
		let read = agent.read(vec!["/x".to_string()]).await;
		assert_eq!(read.result, vec![ScalarOrTree::Int(7)]);
	}

	#[tokio::test]
	async fn three_node_cluster_elects_a_leader_and_replicates() {
		let network = Arc::new(MockNetwork::default());
		let ids = ["a", "b", "c"];
		let mut agents = Vec::new();
		for id in ids {
			let agent = make_agent(id, &ids, &network);
			network.nodes.lock().await.insert(id.to_string(), agent.clone());
			agents.push(agent);
		}

		run_ticks(&agents, 10).await;
		let mut leader_count = 0;
		for agent in &agents {
			if agent.consensus.lock().await.is_leader() {
				leader_count += 1;
			}
		}
		assert_eq!(leader_count, 1, "exactly one node should have become leader");
	}

	#[tokio::test]
	async fn write_against_non_leader_returns_redirect() {
		let network = Arc::new(MockNetwork::default());
		let agent = make_agent("a", &["a", "b"], &network);
		network.nodes.lock().await.insert("a".into(), agent.clone());

		// Never ticked, so it's still a fresh follower.
		let tx = Transaction { writes: vec![], preconditions: Map::new(), client_id: "c".into() };
		let resp = agent.write(vec![tx], WriteMode::Normal).await;
		assert!(!resp.accepted);
	}

	#[tokio::test]
	async fn precondition_failure_is_reported_without_committing() {
		let network = Arc::new(MockNetwork::default());
		let agent = make_agent("a", &["a"], &network);
		network.nodes.lock().await.insert("a".into(), agent.clone());
		run_ticks(&[agent.clone()], 5).await;

		let mut preconditions = Map::new();
		preconditions.insert("/missing".to_string(), Precondition::HasKey("x".into()));
		let tx = Transaction { writes: vec![crate::protos::Write { path: "/missing/x".into(), operator: Operator::Set(ScalarOrTree::Int(1)), ttl_millis: None }], preconditions, client_id: "c".into() };
		let resp = agent.write(vec![tx], WriteMode::Normal).await;
		assert!(matches!(resp.applied[0], Outcome::PreconditionFailed { .. }));
	}

	#[tokio::test]
	async fn partitioned_leader_loses_quorum_and_a_follower_takes_over() {
		let network = Arc::new(MockNetwork::default());
		let ids = ["a", "b", "c"];
		let mut agents = Vec::new();
		for id in ids {
			let agent = make_agent(id, &ids, &network);
			network.nodes.lock().await.insert(id.to_string(), agent.clone());
			agents.push(agent);
		}

		run_ticks(&agents, 10).await;
		let original_leader = {
			let mut leader = None;
			for agent in &agents {
				if agent.consensus.lock().await.is_leader() {
					leader = Some(agent.clone());
				}
			}
			leader.expect("cluster should have elected a leader")
		};
		let original_term = original_leader.consensus.lock().await.meta().current_term;

		network.partitioned.lock().await.insert(original_leader.id().clone());

		run_ticks(&agents, 20).await;

		let mut new_leader_term = None;
		for agent in &agents {
			if agent.id() != original_leader.id() && agent.consensus.lock().await.is_leader() {
				new_leader_term = Some(agent.consensus.lock().await.meta().current_term);
			}
		}
		let new_leader_term = new_leader_term.expect("one of the two remaining peers should become leader");
		assert!(new_leader_term > original_term);

		let tx = Transaction { writes: vec![], preconditions: Map::new(), client_id: "c".into() };
		let resp = original_leader.write(vec![tx], WriteMode::Normal).await;
		assert!(!resp.accepted, "the partitioned former leader must no longer accept writes as leader");
	}

	#[tokio::test]
	async fn offline_follower_catches_up_after_rejoining() {
		let network = Arc::new(MockNetwork::default());
		let ids = ["a", "b", "c"];
		let mut agents = Vec::new();
		for id in ids {
			let agent = make_agent(id, &ids, &network);
			network.nodes.lock().await.insert(id.to_string(), agent.clone());
			agents.push(agent);
		}
		run_ticks(&agents, 10).await;

		network.partitioned.lock().await.insert("c".to_string());

		let leader = {
			let mut leader = None;
			for agent in &agents {
				if agent.consensus.lock().await.is_leader() {
					leader = Some(agent.clone());
				}
			}
			leader.expect("cluster should have elected a leader")
		};

		let mut last_index = 0;
		for i in 0..10 {
			let tx = Transaction { writes: vec![crate::protos::Write { path: format!("/k{i}"), operator: Operator::Set(ScalarOrTree::Int(i as i64)), ttl_millis: None }], preconditions: Map::new(), client_id: format!("c{i}") };
			let resp = leader.write(vec![tx], WriteMode::Normal).await;
			assert!(resp.accepted);
			last_index = resp.indices[0];
			run_ticks(&agents, 2).await;
		}
		leader.wait_for(last_index, Duration::from_secs(1)).await;

		network.partitioned.lock().await.remove("c");
		run_ticks(&agents, 30).await;

		let c = agents.iter().find(|a| a.id() == "c").unwrap();
		assert!(c.wait_for(last_index, Duration::from_secs(1)).await, "rejoined follower should catch up to the leader's last committed index");
	}
}
