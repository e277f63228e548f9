//! HTTP surface (spec §6): peer RPC routes backing `HttpPeerClient`/
//! `HttpGossipClient` on the other side of the wire, plus the
//! client-facing `write`/`read`/`transact`/`poll`/`inquire` routes
//! (spec §6.2). Built on `axum`, the same stack `aptos-core` uses for
//! its own node API, grounded the way `agency-raft`'s own
//! `HttpPeerClient` assumes a server shaped exactly like this one.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use raft::agent::Agent;
use raft::inception::Inception;
use raft::protos::{
	AppendEntriesRequest, AppendEntriesResponse, GossipRequest, GossipResponse, InstallSnapshotRequest, InstallSnapshotResponse, MixedOperation, ReadRequest,
	ReadResponse, RequestVoteRequest, RequestVoteResponse, TransactResponse, WriteRequest, WriteResponse,
};
use serde::Deserialize;

pub struct AppState {
	pub agent: Arc<Agent>,
	pub inception: Arc<Inception>,
}

pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/raft/append_entries", post(append_entries))
		.route("/raft/request_vote", post(request_vote))
		.route("/raft/install_snapshot", post(install_snapshot))
		.route("/raft/gossip", post(gossip))
		.route("/v1/write", post(write))
		.route("/v1/read", post(read))
		.route("/v1/transact", post(transact))
		.route("/v1/inquire", post(inquire))
		.route("/v1/poll", get(poll))
		.with_state(state)
}

async fn append_entries(State(state): State<Arc<AppState>>, Json(req): Json<AppendEntriesRequest>) -> Json<AppendEntriesResponse> {
	let sender_timestamp = req.sender_timestamp;
	match state.agent.handle_append_entries(req).await {
		Ok(resp) => Json(resp),
		Err(_) => Json(AppendEntriesResponse { term: 0, success: false, sender_timestamp, last_log_index_hint: None }),
	}
}

async fn request_vote(State(state): State<Arc<AppState>>, Json(req): Json<RequestVoteRequest>) -> Json<RequestVoteResponse> {
	Json(state.agent.handle_request_vote(req).await)
}

async fn install_snapshot(State(state): State<Arc<AppState>>, Json(req): Json<InstallSnapshotRequest>) -> Json<InstallSnapshotResponse> {
	Json(state.agent.handle_install_snapshot(req).await)
}

async fn gossip(State(state): State<Arc<AppState>>, Json(req): Json<GossipRequest>) -> Json<GossipResponse> {
	Json(state.inception.handle_gossip(req).await)
}

async fn write(State(state): State<Arc<AppState>>, Json(req): Json<WriteRequest>) -> Json<WriteResponse> {
	Json(state.agent.write(req.transactions, req.mode).await)
}

async fn read(State(state): State<Arc<AppState>>, Json(req): Json<ReadRequest>) -> Json<ReadResponse> {
	Json(state.agent.read(req.paths).await)
}

async fn transact(State(state): State<Arc<AppState>>, Json(op): Json<MixedOperation>) -> Json<TransactResponse> {
	Json(state.agent.transact(op).await)
}

#[derive(Deserialize)]
struct InquireQuery {
	client_ids: String,
}

async fn inquire(State(state): State<Arc<AppState>>, Query(q): Query<InquireQuery>) -> Json<raft::protos::InquireResponse> {
	let ids = q.client_ids.split(',').map(str::to_string).collect();
	Json(state.agent.inquire(ids).await)
}

#[derive(Deserialize)]
struct PollQuery {
	after: u64,
	#[serde(default = "default_poll_timeout_millis")]
	timeout_millis: u64,
}

fn default_poll_timeout_millis() -> u64 {
	5000
}

async fn poll(State(state): State<Arc<AppState>>, Query(q): Query<PollQuery>) -> Json<Vec<raft::protos::LogEntry>> {
	let entries = state.agent.poll(q.after, Duration::from_millis(q.timeout_millis)).await;
	Json(entries)
}
