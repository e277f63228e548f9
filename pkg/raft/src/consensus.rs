//! C3 (Constituent) plus the leader-side replication *decision*
//! logic that spec §4.4 describes for the Agent. Structured exactly
//! like the teacher's `ConsensusModule`: a pure state machine driven
//! by an external ticker, taking RPC calls as plain method calls and
//! reporting every side effect (messages to send, metadata to
//! persist) through an output `Tick` rather than performing I/O
//! itself. This keeps the hardest-to-test part of the system —
//! election and replication safety — runnable without a network or a
//! clock mock more elaborate than swapping in a fixed `Instant`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::{debug, info, instrument, warn};

use crate::config_state::{ConfigurationSnapshot, ConfigurationSnapshotRef, ConfigurationStateMachine};
use crate::constraint::MatchConstraint;
use crate::errors::{Error, Result};
use crate::log::LogStorage;
use crate::protos::{
	AppendEntriesRequest, AppendEntriesResponse, LogEntry, LogEntryData, LogIndex, LogPosition, Metadata,
	RequestVoteRequest, RequestVoteResponse, ServerId, Term,
};
use crate::state::{ServerCandidateState, ServerFollowerState, ServerLeaderState, ServerProgress, ServerState};

/// Tunables from spec §3.3/§4.3/§4.4. `timeout_mult` is mutated in
/// place by the adaptive policy (§4.3 "Adaptive timeouts").
#[derive(Debug, Clone)]
pub struct ClusterTiming {
	pub min_ping: Duration,
	pub max_ping: Duration,
	pub timeout_mult: f64,
	pub max_append_size: usize,
	pub max_append_bytes: usize,
}

impl Default for ClusterTiming {
	fn default() -> Self {
		ClusterTiming {
			min_ping: Duration::from_millis(300),
			max_ping: Duration::from_millis(1000),
			timeout_mult: 1.0,
			max_append_size: 1000,
			max_append_bytes: 4 * 1024 * 1024,
		}
	}
}

/// Proposal handle: an accepted write has a definite `(term, index)`
/// that callers can later ask `proposal_status` about.
pub type Proposal = LogPosition;

pub type ProposeResult = std::result::Result<Proposal, ProposeError>;

#[derive(Debug)]
pub enum ProposeError {
	RetryAfter(Proposal),
	NotLeader { leader_hint: Option<ServerId> },
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProposalStatus {
	Committed,
	Failed,
	Pending,
	Missing,
	Unavailable,
}

/// Everything the ConsensusModule asks the surrounding Agent to do as
/// a result of one `cycle()` or RPC handler call (spec §9's "message
/// passing instead of back-pointers").
pub struct Tick {
	pub time: Instant,
	pub meta: bool,
	pub config: bool,
	pub new_entries: bool,
	pub messages: Vec<Message>,
	pub next_tick: Option<Duration>,
}

impl Tick {
	pub fn empty(time: Instant) -> Self {
		Tick { time, meta: false, config: false, new_entries: false, messages: vec![], next_tick: None }
	}

	pub fn write_meta(&mut self) {
		self.meta = true;
	}

	pub fn write_config(&mut self) {
		self.config = true;
	}

	pub fn send(&mut self, msg: Message) {
		self.messages.push(msg);
	}
}

pub enum MessageBody {
	RequestVote(RequestVoteRequest),
	AppendEntries(AppendEntriesRequest, LogIndex),
}

pub struct Message {
	pub to: Vec<ServerId>,
	pub body: MessageBody,
}

pub struct ConsensusModule {
	id: ServerId,
	meta: Metadata,
	config: ConfigurationStateMachine,
	log: Arc<dyn LogStorage>,
	state: ServerState,
	timing: ClusterTiming,
	/// Recent election start times, used to grow/decay `timeout_mult`
	/// (spec §4.3's adaptive timeout policy).
	recent_elections: Vec<Instant>,
}

impl ConsensusModule {
	pub fn new(
		id: ServerId,
		mut meta: Metadata,
		config_snapshot: ConfigurationSnapshot,
		log: Arc<dyn LogStorage>,
		timing: ClusterTiming,
		now: Instant,
	) -> Self {
		let last_log_term = log.term(log.last_index().unwrap_or(0)).unwrap_or(0);
		if last_log_term > meta.current_term {
			meta.current_term = last_log_term;
			meta.voted_for = None;
		}

		if config_snapshot.last_applied > meta.commit_index {
			meta.commit_index = config_snapshot.last_applied;
		}

		let mut config = ConfigurationStateMachine::from(config_snapshot);
		let last_log_index = log.last_index().unwrap_or(0);
		for i in (config.last_applied + 1)..=last_log_index {
			if let Some(e) = log.entry(i) {
				config.apply(&e, meta.commit_index);
			}
		}

		let state = Self::new_follower(now, &timing, &mut rand::thread_rng());
		ConsensusModule { id, meta, config, log, state, timing, recent_elections: vec![] }
	}

	pub fn id(&self) -> &ServerId {
		&self.id
	}

	pub fn meta(&self) -> &Metadata {
		&self.meta
	}

	pub fn config_snapshot(&self) -> ConfigurationSnapshotRef {
		self.config.snapshot()
	}

	pub fn is_leader(&self) -> bool {
		matches!(self.state, ServerState::Leader(_))
	}

	pub fn leader_hint(&self) -> Option<ServerId> {
		match &self.state {
			ServerState::Follower(s) => s.last_leader_id.clone().or_else(|| self.meta.voted_for.clone()),
			ServerState::Leader(_) => Some(self.id.clone()),
			ServerState::Candidate(_) => None,
		}
	}

	pub fn propose_command(&mut self, client_id: String, timestamp_millis: u64, data: crate::protos::TransactionPayload, out: &mut Tick) -> ProposeResult {
		self.propose_entry(LogEntryData::Transaction(data), client_id, timestamp_millis, out)
	}

	pub fn propose_noop(&mut self, out: &mut Tick) -> ProposeResult {
		self.propose_entry(LogEntryData::Noop, String::new(), 0, out)
	}

	pub fn proposal_status(&self, prop: &Proposal) -> ProposalStatus {
		let last_log_index = self.log.last_index().unwrap_or(0);
		let last_log_term = self.log.term(last_log_index).unwrap_or(0);

		if prop.term > last_log_term || prop.index > last_log_index {
			return ProposalStatus::Missing;
		}

		let cur_term = match self.log.term(prop.index) {
			Some(v) => v,
			None => return ProposalStatus::Unavailable,
		};

		if cur_term > prop.term {
			ProposalStatus::Failed
		} else if cur_term < prop.term {
			if self.meta.commit_index >= prop.index { ProposalStatus::Failed } else { ProposalStatus::Missing }
		} else if self.meta.commit_index >= prop.index {
			ProposalStatus::Committed
		} else {
			ProposalStatus::Pending
		}
	}

	pub fn propose_entry(&mut self, data: LogEntryData, client_id: String, timestamp_millis: u64, out: &mut Tick) -> ProposeResult {
		match &self.state {
			ServerState::Leader(_) => {
				let index = self.log.last_index().unwrap_or(0) + 1;
				let term = self.meta.current_term;
				assert!(term > 0, "a leader must have won an election in term > 0");

				if let LogEntryData::Config(_) = data {
					if let Some(pending) = &self.config.pending {
						let pending_term = self.log.term(pending.last_change).unwrap_or(term);
						return Err(ProposeError::RetryAfter(Proposal { index: pending.last_change, term: pending_term }));
					}
				}

				out.new_entries = true;
				let entry = LogEntry { index, term, data, client_id, timestamp_millis };
				self.log.append(entry.clone());
				self.config.apply(&entry, self.meta.commit_index);

				self.cycle(out);
				Ok(Proposal { term, index })
			}
			ServerState::Follower(s) => Err(ProposeError::NotLeader { leader_hint: s.last_leader_id.clone().or_else(|| self.meta.voted_for.clone()) }),
			ServerState::Candidate(_) => Err(ProposeError::NotLeader { leader_hint: None }),
		}
	}

	/// The single entry point driving all state transitions: called
	/// periodically by the Agent's ticker and after every RPC/callback
	/// that might have changed something (spec §4.3's election timer,
	/// §4.4's replication loop).
	#[instrument(skip(self, tick), fields(id = %self.id))]
	pub fn cycle(&mut self, tick: &mut Tick) {
		if self.config.value.members.is_empty() || !self.config.value.members.contains(&self.id) {
			tick.next_tick = Some(Duration::from_secs(1));
			return;
		}

		enum Summary {
			Follower { elapsed: Duration, election_timeout: Duration },
			Candidate { vote_count: usize, election_start: Instant, election_timeout: Duration },
			Leader { next_commit_index: Option<LogIndex> },
		}

		let summary = match &self.state {
			ServerState::Follower(s) => Summary::Follower { elapsed: tick.time.saturating_duration_since(s.last_heartbeat), election_timeout: s.election_timeout },
			ServerState::Candidate(s) => Summary::Candidate {
				vote_count: 1 + s.votes_received.len(),
				election_start: s.election_start,
				election_timeout: s.election_timeout,
			},
			ServerState::Leader(s) => Summary::Leader { next_commit_index: self.find_next_commit_index(s) },
		};

		match summary {
			Summary::Follower { elapsed, election_timeout } => {
				if !self.can_be_leader() {
					let mut rng = rand::thread_rng();
					self.state = Self::new_follower(tick.time, &self.timing, &mut rng);
				} else if elapsed >= election_timeout || self.config.value.members.len() == 1 {
					self.start_election(tick);
				} else {
					tick.next_tick = Some(election_timeout - elapsed);
				}
			}
			Summary::Candidate { vote_count, election_start, election_timeout } => {
				let majority = self.majority_size();
				if vote_count >= majority {
					info!(term = self.meta.current_term, "won election");
					let last_log_index = self.log.last_index().unwrap_or(0);
					let servers = self
						.config
						.value
						.iter()
						.filter(|s| **s != self.id)
						.map(|s| (s.clone(), ServerProgress::new(last_log_index)))
						.collect::<HashMap<_, _>>();

					self.state = ServerState::Leader(ServerLeaderState { servers });

					if self.meta.commit_index < last_log_index {
						self.propose_noop(tick).expect("leader must be able to propose its own noop");
					}
					self.cycle(tick);
				} else {
					let elapsed = tick.time.saturating_duration_since(election_start);
					if elapsed >= election_timeout {
						self.start_election(tick);
					} else {
						tick.next_tick = Some(election_timeout - elapsed);
					}
				}
			}
			Summary::Leader { next_commit_index } => {
				if let Some(ci) = next_commit_index {
					self.update_committed(ci, tick);
				}

				let mut next_heartbeat = self.replicate_entries(tick);
				if self.config.value.members.len() + self.config.value.learners.len() == 1 {
					next_heartbeat = Duration::from_secs(2);
				}
				tick.next_tick = Some(next_heartbeat);
			}
		}
	}

	fn can_be_leader(&self) -> bool {
		self.log.last_index().unwrap_or(0) >= self.meta.commit_index
	}

	fn find_next_commit_index(&self, s: &ServerLeaderState) -> Option<LogIndex> {
		let mut ci = self.log.last_index().unwrap_or(0);
		let majority = self.majority_size();
		while ci > self.meta.commit_index {
			let term = match self.log.term(ci) {
				Some(t) => t,
				None => break,
			};

			if term < self.meta.current_term {
				break;
			} else if term == self.meta.current_term {
				let mut count = 0;
				if self.log.match_index().unwrap_or(0) >= ci {
					count += 1;
				}
				for (id, progress) in s.servers.iter() {
					if !self.config.value.members.contains(id) || *id == self.id {
						continue;
					}
					if progress.match_index >= ci {
						count += 1;
					}
				}
				if count >= majority {
					return Some(ci);
				}
			}
			ci -= 1;
		}
		None
	}

	/// Builds AppendEntries batches for each follower that isn't
	/// already being sent something and isn't within its heartbeat
	/// window, bounded by `max_append_size`/`max_append_bytes` (spec
	/// §4.4 steps 1-5). Returns the time until the next heartbeat is
	/// due for the soonest follower.
	fn replicate_entries(&mut self, tick: &mut Tick) -> Duration {
		let leader_id = self.id.clone();
		let term = self.meta.current_term;
		let leader_commit = self.meta.commit_index;
		let log = self.log.clone();
		let last_log_index = log.last_index().unwrap_or(0);
		let min_ping = self.timing.min_ping;
		let max_append_size = self.timing.max_append_size;
		let max_append_bytes = self.timing.max_append_bytes;
		let heartbeat_timeout = min_ping / 3;

		let config_ids: Vec<ServerId> = self.config.value.iter().cloned().collect();

		let state = match &mut self.state {
			ServerState::Leader(s) => s,
			_ => unreachable!("replicate_entries is only called while leading"),
		};

		let mut since_last_heartbeat = Duration::from_millis(0);

		for server_id in config_ids {
			if server_id == leader_id {
				continue;
			}

			let progress = state.servers.entry(server_id.clone()).or_insert_with(|| ServerProgress::new(last_log_index));

			if progress.request_pending {
				continue;
			}
			if let Some(earliest) = progress.earliest_package {
				if tick.time < earliest {
					continue;
				}
			}

			let needs_heartbeat = progress.last_sent.map(|t| tick.time.saturating_duration_since(t) > heartbeat_timeout).unwrap_or(true);

			if progress.match_index >= last_log_index {
				if let Some(sent) = progress.last_sent {
					let elapsed = tick.time.saturating_duration_since(sent);
					if elapsed < heartbeat_timeout {
						if elapsed > since_last_heartbeat {
							since_last_heartbeat = elapsed;
						}
						continue;
					}
				}
			} else if !needs_heartbeat && progress.last_sent.is_some() {
				continue;
			}

			progress.request_pending = true;
			progress.last_sent = Some(tick.time);

			let prev_log_index = progress.next_index.saturating_sub(1);
			let prev_log_term = log.term(prev_log_index).unwrap_or(0);

			let mut entries = Vec::new();
			let mut byte_count = 0usize;
			let mut idx = prev_log_index + 1;
			while idx <= last_log_index && entries.len() < max_append_size {
				let Some(e) = log.entry(idx) else { break };
				byte_count += approximate_entry_size(&e);
				if byte_count > max_append_bytes && !entries.is_empty() {
					break;
				}
				entries.push(e);
				idx += 1;
			}

			let req = AppendEntriesRequest {
				term,
				leader_id: leader_id.clone(),
				prev_log_index,
				prev_log_term,
				entries,
				leader_commit_index: leader_commit,
				sender_timestamp: 0,
			};

			tick.send(Message { to: vec![server_id], body: MessageBody::AppendEntries(req, last_log_index) });
		}

		heartbeat_timeout.saturating_sub(since_last_heartbeat)
	}

	fn start_election(&mut self, tick: &mut Tick) {
		if !self.can_be_leader() {
			warn!("cannot become leader: log is behind our own commit index");
			return;
		}

		let must_increment = match &self.state {
			ServerState::Candidate(s) => s.some_rejected,
			_ => true,
		};

		if must_increment {
			self.meta.current_term += 1;
			self.meta.voted_for = Some(self.id.clone());
			tick.write_meta();
		}

		info!(term = self.meta.current_term, "starting election");
		self.recent_elections.push(tick.time);
		self.adapt_timeout_mult(tick.time);

		let mut rng = rand::thread_rng();
		self.state = ServerState::Candidate(ServerCandidateState {
			election_start: tick.time,
			election_timeout: Self::new_election_timeout(&self.timing, &mut rng),
			votes_received: std::collections::HashSet::new(),
			some_rejected: false,
		});

		self.perform_election(tick);
		self.cycle(tick);
	}

	fn perform_election(&self, tick: &mut Tick) {
		let last_log_index = self.log.last_index().unwrap_or(0);
		let last_log_term = self.log.term(last_log_index).unwrap_or(0);

		let req = RequestVoteRequest {
			term: self.meta.current_term,
			candidate_id: self.id.clone(),
			last_log_index,
			last_log_term,
			timeout_mult: Some(self.timing.timeout_mult.round() as u32),
		};

		let ids: Vec<ServerId> = self.config.value.members.iter().filter(|s| **s != self.id).cloned().collect();
		if ids.is_empty() {
			return;
		}
		tick.send(Message { to: ids, body: MessageBody::RequestVote(req) });
	}

	/// Grows `timeout_mult` when elections are happening in quick
	/// succession (thrash), decays it otherwise (spec §4.3).
	fn adapt_timeout_mult(&mut self, now: Instant) {
		let window = Duration::from_secs(30);
		self.recent_elections.retain(|t| now.saturating_duration_since(*t) < window);
		if self.recent_elections.len() > 3 {
			self.timing.timeout_mult = (self.timing.timeout_mult * 1.5).min(32.0);
		} else {
			self.timing.timeout_mult = (self.timing.timeout_mult * 0.95).max(1.0);
		}
	}

	fn new_follower(now: Instant, timing: &ClusterTiming, rng: &mut impl RngCore) -> ServerState {
		ServerState::Follower(ServerFollowerState {
			election_timeout: Self::new_election_timeout(timing, rng),
			last_leader_id: None,
			last_heartbeat: now,
		})
	}

	fn become_follower(&mut self, tick: &mut Tick) {
		let mut rng = rand::thread_rng();
		self.state = Self::new_follower(tick.time, &self.timing, &mut rng);
		self.cycle(tick);
	}

	/// Public entry point for peer RPC handlers outside this module
	/// (e.g. install-snapshot) that need to step down on a higher term
	/// without going through `append_entries`/`request_vote`.
	pub fn observe_remote_term(&mut self, term: Term, tick: &mut Tick) {
		self.observe_term(term, tick);
	}

	fn observe_term(&mut self, term: Term, tick: &mut Tick) {
		if term > self.meta.current_term {
			self.meta.current_term = term;
			self.meta.voted_for = None;
			tick.write_meta();
			self.become_follower(tick);
		}
	}

	fn update_committed(&mut self, index: LogIndex, tick: &mut Tick) {
		assert!(index > self.meta.commit_index, "commit index must be monotonically increasing");
		self.meta.commit_index = index;
		tick.write_meta();
		if self.config.commit(self.meta.commit_index) {
			tick.write_config();
		}
	}

	fn majority_size(&self) -> usize {
		if self.config.value.members.is_empty() {
			return usize::MAX;
		}
		(self.config.value.members.len() / 2) + 1
	}

	#[instrument(skip(self, tick), fields(id = %self.id))]
	pub fn request_vote_callback(&mut self, from_id: ServerId, resp: RequestVoteResponse, tick: &mut Tick) {
		self.observe_term(resp.term, tick);
		if self.meta.current_term != resp.term {
			return;
		}
		if from_id == self.id {
			warn!("rejected a duplicate self-vote response");
			return;
		}

		let should_cycle = if let ServerState::Candidate(s) = &mut self.state {
			if resp.vote_granted {
				s.votes_received.insert(from_id);
			} else {
				s.some_rejected = true;
			}
			true
		} else {
			false
		};

		if should_cycle {
			self.cycle(tick);
		}
	}

	pub fn append_entries_callback(&mut self, from_id: ServerId, last_index: LogIndex, resp: AppendEntriesResponse, tick: &mut Tick) {
		self.observe_term(resp.term, tick);

		let mut should_noop = false;
		let should_cycle = if let ServerState::Leader(s) = &mut self.state {
			if let Some(progress) = s.servers.get_mut(&from_id) {
				if resp.success {
					if last_index > progress.match_index {
						progress.match_index = last_index;
						progress.next_index = last_index + 1;
					}
					progress.last_acked = Some(tick.time);

					if let Some(idx) = resp.last_log_index_hint {
						let our_last = self.log.last_index().unwrap_or(0);
						let our_last_term = self.log.term(our_last).unwrap_or(0);
						if idx > our_last && our_last_term != self.meta.current_term {
							should_noop = true;
						}
					}
				} else if let Some(idx) = resp.last_log_index_hint {
					progress.next_index = idx + 1;
				} else {
					progress.next_index = progress.next_index.saturating_sub(1).max(1);
				}
				progress.request_pending = false;
			}
			true
		} else {
			false
		};

		if should_noop {
			let _ = self.propose_noop(tick);
		} else if should_cycle {
			self.cycle(tick);
		}
	}

	pub fn append_entries_noresponse(&mut self, from_id: ServerId, tick: &mut Tick) {
		if let ServerState::Leader(s) = &mut self.state {
			if let Some(progress) = s.servers.get_mut(&from_id) {
				progress.request_pending = false;
				// Backpressure: don't hammer a follower that just
				// timed out (spec §3.4 `earliest_package`).
				progress.earliest_package = Some(tick.time + self.timing.min_ping);
			}
		}
	}

	fn new_election_timeout(timing: &ClusterTiming, rng: &mut impl RngCore) -> Duration {
		let lo = timing.min_ping.mul_f64(timing.timeout_mult).as_millis() as u64;
		let hi = timing.max_ping.mul_f64(timing.timeout_mult).as_millis() as u64;
		let span = hi.saturating_sub(lo).max(1);
		let millis = lo + (rng.next_u64() % span);
		Duration::from_millis(millis)
	}

	pub fn pre_vote(&self, req: &RequestVoteRequest) -> RequestVoteResponse {
		let should_grant = || -> bool {
			if req.term < self.meta.current_term {
				return false;
			}

			let last_log_index = self.log.last_index().unwrap_or(0);
			let last_log_term = self.log.term(last_log_index).unwrap_or(0);

			let up_to_date = req.last_log_term > last_log_term || (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);
			if !up_to_date {
				return false;
			}

			if req.term > self.meta.current_term {
				return true;
			}

			match &self.meta.voted_for {
				Some(id) => *id == req.candidate_id,
				None => true,
			}
		};

		RequestVoteResponse { term: self.meta.current_term, vote_granted: should_grant() }
	}

	#[instrument(skip(self, req, tick), fields(id = %self.id, candidate = %req.candidate_id))]
	pub fn request_vote(&mut self, req: RequestVoteRequest, tick: &mut Tick) -> RequestVoteResponse {
		debug!("received request_vote");
		self.observe_term(req.term, tick);

		let res = self.pre_vote(&req);

		if res.vote_granted {
			if let ServerState::Follower(s) = &mut self.state {
				s.last_heartbeat = tick.time;
			}
			self.meta.voted_for = Some(req.candidate_id.clone());
			tick.write_meta();
			info!(candidate = %req.candidate_id, "granted vote");
		}

		res
	}

	/// spec §4.4 AppendEntries handling (follower side). Returns a
	/// constraint tying the response to the log position that must be
	/// durable before the response may be sent (spec §5 durability
	/// ordering guarantee).
	#[instrument(skip(self, req, tick), fields(id = %self.id, leader = %req.leader_id))]
	pub fn append_entries(&mut self, req: AppendEntriesRequest, tick: &mut Tick) -> Result<MatchConstraint<AppendEntriesResponse>> {
		self.observe_term(req.term, tick);

		if req.term == self.meta.current_term && matches!(self.state, ServerState::Candidate(_)) {
			self.become_follower(tick);
		}

		let current_term = self.meta.current_term;
		let response = |success: bool, hint: Option<LogIndex>| AppendEntriesResponse {
			term: current_term,
			success,
			sender_timestamp: req.sender_timestamp,
			last_log_index_hint: hint,
		};

		if req.term < self.meta.current_term {
			return Ok(response(false, None).into());
		}

		match &mut self.state {
			ServerState::Follower(s) => {
				s.last_heartbeat = tick.time;
				s.last_leader_id = Some(req.leader_id.clone());
			}
			ServerState::Leader(_) => {
				if req.leader_id != self.id {
					return Err(Error::InvariantViolation("received AppendEntries from another leader in our own term".into()));
				}
			}
			ServerState::Candidate(_) => {
				return Err(Error::InvariantViolation("still a candidate after observing current-term AppendEntries".into()));
			}
		}

		if !req.entries.is_empty() {
			let first = &req.entries[0];
			if first.term < req.prev_log_term || first.index != req.prev_log_index + 1 {
				return Err(Error::LogInconsistency { index: first.index, reason: "first entry does not follow prev_log_index/term".into() });
			}
			for w in req.entries.windows(2) {
				if w[0].term > w[1].term || w[1].index != w[0].index + 1 {
					return Err(Error::LogInconsistency { index: w[1].index, reason: "entries are unsorted or non-contiguous".into() });
				}
			}
		}

		if req.prev_log_index + 1 < self.log.first_index().unwrap_or(1) {
			return Err(Error::LogInconsistency { index: req.prev_log_index, reason: "requested previous entry is before the start of the log".into() });
		}

		match self.log.term(req.prev_log_index) {
			Some(term) => {
				if term != req.prev_log_term {
					return Ok(response(false, Some(self.meta.commit_index)).into());
				}
			}
			None => return Ok(response(false, Some(self.log.last_index().unwrap_or(0))).into()),
		}

		let mut first_new = 0;
		for e in req.entries.iter() {
			match self.log.term(e.index) {
				Some(t) if t == e.term => first_new += 1,
				Some(_) => {
					if self.meta.commit_index >= e.index {
						return Err(Error::InvariantViolation("refusing to truncate a locally committed entry".into()));
					}
					self.config.revert(e.index);
					self.log.truncate_from(e.index);
					break;
				}
				None => break,
			}
		}

		let mut last_new = req.prev_log_index;
		let mut last_new_term = req.prev_log_term;

		if req.entries.len() > first_new {
			let new_entries = &req.entries[first_new..];
			last_new = new_entries.last().unwrap().index;
			last_new_term = new_entries.last().unwrap().term;

			for e in new_entries {
				tick.new_entries = true;
				self.log.append(e.clone());
				self.config.apply(e, self.meta.commit_index);
			}
		}

		if req.leader_commit_index > self.meta.commit_index {
			let next_commit_index = req.leader_commit_index.min(last_new);
			if next_commit_index > self.meta.commit_index {
				self.update_committed(next_commit_index, tick);
			}
		}

		let pos = LogPosition { term: last_new_term, index: last_new };
		let last_log_index = self.log.last_index().unwrap_or(0);
		Ok(MatchConstraint::new(response(true, if last_log_index != last_new { Some(last_log_index) } else { None }), pos))
	}

	pub fn timeout_now(&mut self, tick: &mut Tick) {
		self.start_election(tick);
	}

	/// Fast-forwards the commit index after a compactor-installed
	/// snapshot (spec §4.5): a follower too far behind to catch up via
	/// ordinary AppendEntries jumps straight to the snapshot's covered
	/// index instead of replaying every intervening entry.
	pub fn observe_snapshot(&mut self, last_included_index: LogIndex, tick: &mut Tick) {
		if last_included_index > self.meta.commit_index {
			self.meta.commit_index = last_included_index;
			tick.write_meta();
		}
	}
}

fn approximate_entry_size(entry: &LogEntry) -> usize {
	// A rough, allocation-free upper bound used only to decide batch
	// boundaries; exact wire size is whatever serde_json produces
	// downstream.
	std::mem::size_of::<LogEntry>()
		+ entry.client_id.len()
		+ match &entry.data {
			LogEntryData::Noop => 0,
			LogEntryData::Config(_) => 64,
			LogEntryData::Transaction(t) => t.transactions.len() * 128,
		}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::log::MemoryLog;
	use crate::protos::Configuration;

	fn make_module(id: &str, members: &[&str]) -> ConsensusModule {
		let mut cfg = Configuration::default();
		for m in members {
			cfg.members.insert((*m).to_string());
		}
		ConsensusModule::new(
			id.to_string(),
			Metadata::default(),
			ConfigurationSnapshot { last_applied: 0, data: cfg },
			Arc::new(MemoryLog::new()),
			ClusterTiming { min_ping: Duration::from_millis(10), max_ping: Duration::from_millis(20), ..Default::default() },
			Instant::now(),
		)
	}

	#[test]
	fn single_node_cluster_elects_itself() {
		let mut m = make_module("a", &["a"]);
		let mut tick = Tick::empty(Instant::now() + Duration::from_secs(1));
		m.cycle(&mut tick);
		assert!(m.is_leader());
	}

	#[test]
	fn follower_grants_vote_for_up_to_date_candidate() {
		let mut m = make_module("a", &["a", "b"]);
		let req = RequestVoteRequest { term: 1, candidate_id: "b".into(), last_log_index: 0, last_log_term: 0, timeout_mult: None };
		let mut tick = Tick::empty(Instant::now());
		let resp = m.request_vote(req, &mut tick);
		assert!(resp.vote_granted);
		assert_eq!(m.meta().voted_for.as_deref(), Some("b"));
	}

	#[test]
	fn follower_rejects_vote_for_stale_term() {
		let mut m = make_module("a", &["a", "b"]);
		m.meta.current_term = 5;
		let req = RequestVoteRequest { term: 3, candidate_id: "b".into(), last_log_index: 0, last_log_term: 0, timeout_mult: None };
		let mut tick = Tick::empty(Instant::now());
		let resp = m.request_vote(req, &mut tick);
		assert!(!resp.vote_granted);
	}

	#[test]
	fn candidate_becomes_leader_on_majority_votes() {
		let mut m = make_module("a", &["a", "b", "c"]);
		let mut tick = Tick::empty(Instant::now() + Duration::from_secs(1));
		m.cycle(&mut tick);
		assert!(matches!(m.state, ServerState::Candidate(_)));

		let term = m.meta.current_term;
		let mut tick2 = Tick::empty(tick.time);
		m.request_vote_callback("b".into(), RequestVoteResponse { term, vote_granted: true }, &mut tick2);
		assert!(m.is_leader());
	}

	#[test]
	fn observing_higher_term_steps_down_leader() {
		let mut m = make_module("a", &["a", "b", "c"]);
		let mut tick = Tick::empty(Instant::now() + Duration::from_secs(1));
		m.cycle(&mut tick);
		let term = m.meta.current_term;
		m.request_vote_callback("b".into(), RequestVoteResponse { term, vote_granted: true }, &mut Tick::empty(tick.time));
		assert!(m.is_leader());

		let mut tick3 = Tick::empty(tick.time);
		m.observe_term(term + 10, &mut tick3);
		assert!(!m.is_leader());
	}

	#[test]
	fn append_entries_rejects_stale_term() {
		let mut m = make_module("a", &["a", "b"]);
		m.meta.current_term = 5;
		let req = AppendEntriesRequest {
			term: 2,
			leader_id: "b".into(),
			prev_log_index: 0,
			prev_log_term: 0,
			entries: vec![],
			leader_commit_index: 0,
			sender_timestamp: 0,
		};
		let mut tick = Tick::empty(Instant::now());
		let resp = m.append_entries(req, &mut tick).unwrap().satisfied();
		assert!(!resp.success);
	}

	#[test]
	fn append_entries_commits_entries_up_to_leader_commit() {
		let mut m = make_module("a", &["a", "b"]);
		let entries = vec![
			LogEntry { index: 1, term: 1, data: LogEntryData::Noop, client_id: String::new(), timestamp_millis: 0 },
			LogEntry { index: 2, term: 1, data: LogEntryData::Noop, client_id: String::new(), timestamp_millis: 0 },
		];
		let req = AppendEntriesRequest { term: 1, leader_id: "b".into(), prev_log_index: 0, prev_log_term: 0, entries, leader_commit_index: 2, sender_timestamp: 0 };
		let mut tick = Tick::empty(Instant::now());
		let resp = m.append_entries(req, &mut tick).unwrap().satisfied();
		assert!(resp.success);
		assert_eq!(m.meta().commit_index, 2);
	}

	#[test]
	fn majority_size_matches_raft_quorum_formula() {
		let m = make_module("a", &["a", "b", "c", "d", "e"]);
		assert_eq!(m.majority_size(), 3);
	}
}
