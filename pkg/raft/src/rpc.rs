//! Peer transport (spec §6.1): an async trait so the replication loop
//! and the test harness can share code, with an HTTP implementation
//! over `reqwest` for production. Kept separate from `consensus.rs` so
//! the pure state machine never has to know about sockets.

use async_trait::async_trait;

use crate::errors::{Error, Result};
use crate::protos::{
	AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, RequestVoteRequest, RequestVoteResponse, ServerId,
};

#[async_trait]
pub trait PeerClient: Send + Sync {
	async fn append_entries(&self, peer: &ServerId, endpoint: &str, req: AppendEntriesRequest) -> Result<AppendEntriesResponse>;
	async fn request_vote(&self, peer: &ServerId, endpoint: &str, req: RequestVoteRequest) -> Result<RequestVoteResponse>;
	async fn install_snapshot(&self, peer: &ServerId, endpoint: &str, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse>;
}

/// Production transport: plain JSON-over-HTTP via `reqwest`, matching
/// the `axum` server exposed by `agencyd` (spec §6.1/§6.3's decision
/// to use HTTP rather than a binary RPC framework).
pub struct HttpPeerClient {
	client: reqwest::Client,
	timeout: std::time::Duration,
}

impl HttpPeerClient {
	pub fn new(timeout: std::time::Duration) -> Self {
		HttpPeerClient { client: reqwest::Client::new(), timeout }
	}
}

#[async_trait]
impl PeerClient for HttpPeerClient {
	async fn append_entries(&self, peer: &ServerId, endpoint: &str, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
		let url = format!("{endpoint}/raft/append_entries");
		let resp = self
			.client
			.post(&url)
			.timeout(self.timeout)
			.json(&req)
			.send()
			.await
			.map_err(|source| Error::TransientNetwork { peer: peer.clone(), source })?;
		resp.json::<AppendEntriesResponse>().await.map_err(|source| Error::TransientNetwork { peer: peer.clone(), source })
	}

	async fn request_vote(&self, peer: &ServerId, endpoint: &str, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
		let url = format!("{endpoint}/raft/request_vote");
		let resp = self
			.client
			.post(&url)
			.timeout(self.timeout)
			.json(&req)
			.send()
			.await
			.map_err(|source| Error::TransientNetwork { peer: peer.clone(), source })?;
		resp.json::<RequestVoteResponse>().await.map_err(|source| Error::TransientNetwork { peer: peer.clone(), source })
	}

	async fn install_snapshot(&self, peer: &ServerId, endpoint: &str, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
		let url = format!("{endpoint}/raft/install_snapshot");
		let resp = self
			.client
			.post(&url)
			.timeout(self.timeout)
			.json(&req)
			.send()
			.await
			.map_err(|source| Error::TransientNetwork { peer: peer.clone(), source })?;
		resp.json::<InstallSnapshotResponse>().await.map_err(|source| Error::TransientNetwork { peer: peer.clone(), source })
	}
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
	//! An in-process transport used by the deterministic multi-peer
	//! test harness: routes calls directly into another node's Agent
	//! instead of opening a socket.

	use super::*;
	use crate::agent::Agent;
	use std::collections::HashMap;
	use std::sync::Arc;
	use tokio::sync::Mutex;

	#[derive(Default)]
	pub struct MockNetwork {
		pub nodes: Mutex<HashMap<ServerId, Arc<Agent>>>,
		pub partitioned: Mutex<std::collections::HashSet<ServerId>>,
	}

	/// `id` is the node this client acts on behalf of: a link is down
	/// if either endpoint is partitioned, so isolating the leader cuts
	/// off its outbound calls too, not just inbound ones addressed to it.
	pub struct MockPeerClient {
		pub id: ServerId,
		pub network: Arc<MockNetwork>,
	}

	impl MockPeerClient {
		async fn check_link(&self, peer: &ServerId) -> Result<()> {
			let partitioned = self.network.partitioned.lock().await;
			if partitioned.contains(&self.id) || partitioned.contains(peer) {
				return Err(Error::PeerUnreachable(peer.clone()));
			}
			Ok(())
		}
	}

	#[async_trait]
	impl PeerClient for MockPeerClient {
		async fn append_entries(&self, peer: &ServerId, _endpoint: &str, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
			self.check_link(peer).await?;
			let nodes = self.network.nodes.lock().await;
			let node = nodes.get(peer).cloned().ok_or_else(|| Error::PeerUnreachable(peer.clone()))?;
			drop(nodes);
			node.handle_append_entries(req).await
		}

		async fn request_vote(&self, peer: &ServerId, _endpoint: &str, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
			self.check_link(peer).await?;
			let nodes = self.network.nodes.lock().await;
			let node = nodes.get(peer).cloned().ok_or_else(|| Error::PeerUnreachable(peer.clone()))?;
			drop(nodes);
			Ok(node.handle_request_vote(req).await)
		}

		async fn install_snapshot(&self, peer: &ServerId, _endpoint: &str, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
			self.check_link(peer).await?;
			let nodes = self.network.nodes.lock().await;
			let node = nodes.get(peer).cloned().ok_or_else(|| Error::PeerUnreachable(peer.clone()))?;
			drop(nodes);
			Ok(node.handle_install_snapshot(req).await)
		}
	}
}
