//! C6: gossip-based cluster bootstrap (spec §4.6). Before a peer's
//! `ConsensusModule` can start, it needs a consistent view of the
//! voting pool. `Inception` gossips `{id, endpoint, pool, version}` to
//! one seed at a time, merges whatever pool it's handed back, and
//! hands off a settled, persisted membership record once the pool
//! stabilizes. It never touches the `Store` — membership bootstrap and
//! state-machine replication are kept deliberately separate, the way
//! the teacher keeps cluster discovery out of its replication path.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::protos::{GossipRequest, GossipResponse, ServerId};

#[async_trait]
pub trait GossipClient: Send + Sync {
	async fn gossip(&self, endpoint: &str, req: GossipRequest) -> Result<GossipResponse>;
}

pub struct HttpGossipClient {
	client: reqwest::Client,
	timeout: Duration,
}

impl HttpGossipClient {
	pub fn new(timeout: Duration) -> Self {
		HttpGossipClient { client: reqwest::Client::new(), timeout }
	}
}

#[async_trait]
impl GossipClient for HttpGossipClient {
	async fn gossip(&self, endpoint: &str, req: GossipRequest) -> Result<GossipResponse> {
		let url = format!("{endpoint}/raft/gossip");
		let resp = self.client.post(&url).timeout(self.timeout).json(&req).send().await.map_err(|source| Error::TransientNetwork { peer: req.id.clone(), source })?;
		resp.json::<GossipResponse>().await.map_err(|source| Error::TransientNetwork { peer: req.id, source })
	}
}

#[derive(Debug, Clone)]
pub struct InceptionConfig {
	pub pool_size: usize,
	pub gossip_interval: Duration,
	pub timeout: Duration,
}

impl Default for InceptionConfig {
	fn default() -> Self {
		InceptionConfig { pool_size: 1, gossip_interval: Duration::from_millis(500), timeout: Duration::from_secs(30) }
	}
}

/// Gossip state shared between the bootstrap loop (outbound) and the
/// inbound `/raft/gossip` handler (`handle_gossip`).
pub struct Inception {
	id: ServerId,
	endpoint: String,
	pool: Mutex<BTreeMap<ServerId, String>>,
	version: AtomicU64,
	client: Arc<dyn GossipClient>,
	config: InceptionConfig,
}

impl Inception {
	pub fn new(id: ServerId, endpoint: String, seed_pool: BTreeMap<ServerId, String>, client: Arc<dyn GossipClient>, config: InceptionConfig) -> Self {
		let mut pool = seed_pool;
		pool.insert(id.clone(), endpoint.clone());
		Inception { id, endpoint, pool: Mutex::new(pool), version: AtomicU64::new(0), client, config }
	}

	pub async fn pool_snapshot(&self) -> BTreeMap<ServerId, String> {
		self.pool.lock().await.clone()
	}

	/// Round-robins through the current pool (minus ourselves), sending
	/// one gossip round at a time, until the pool reaches the
	/// configured size and a full round changes nothing (version
	/// converged), or `timeout` elapses — whichever comes first (spec
	/// §4.6's termination condition).
	pub async fn run(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> BTreeMap<ServerId, String> {
		let deadline = Instant::now() + self.config.timeout;
		let mut stable_rounds = 0;

		loop {
			let targets: Vec<(ServerId, String)> = {
				let pool = self.pool.lock().await;
				pool.iter().filter(|(id, _)| **id != self.id).map(|(id, ep)| (id.clone(), ep.clone())).collect()
			};

			let version_before = self.version.load(Ordering::SeqCst);
			let pool_size_before = self.pool.lock().await.len();

			if !targets.is_empty() {
				let target = &targets[(version_before as usize) % targets.len()];
				self.gossip_once(&target.0, &target.1).await;
			}

			let pool_size_after = self.pool.lock().await.len();
			let version_after = self.version.load(Ordering::SeqCst);

			let settled = pool_size_after >= self.config.pool_size && pool_size_after == pool_size_before && version_after == version_before;
			stable_rounds = if settled { stable_rounds + 1 } else { 0 };

			if stable_rounds >= 2 {
				info!(pool_size = pool_size_after, "gossip pool settled");
				break;
			}
			if Instant::now() >= deadline {
				warn!(pool_size = pool_size_after, wanted = self.config.pool_size, "gossip bootstrap timed out before reaching target pool size");
				break;
			}

			tokio::select! {
				_ = &mut shutdown => break,
				_ = tokio::time::sleep(self.config.gossip_interval) => {}
			}
		}

		self.pool_snapshot().await
	}

	async fn gossip_once(&self, to_id: &ServerId, to_endpoint: &str) {
		let mut endpoint = to_endpoint.to_string();
		let mut hops = 0;
		loop {
			hops += 1;
			if hops > 5 {
				warn!(to = %to_id, "too many gossip redirects, giving up this round");
				return;
			}

			let req = self.build_request().await;
			match self.client.gossip(&endpoint, req).await {
				Ok(GossipResponse::Merged { pool, version }) => {
					self.merge_pool(pool, version).await;
					return;
				}
				Ok(GossipResponse::Redirect { endpoint: new_endpoint, id }) => {
					debug!(from = %to_id, to = %id, "gossip redirected to another seed");
					endpoint = new_endpoint;
					continue;
				}
				Ok(GossipResponse::Error { code, message }) => {
					warn!(to = %to_id, code, message, "gossip peer returned an error");
					return;
				}
				Err(e) => {
					warn!(to = %to_id, error = %e, "gossip request failed");
					return;
				}
			}
		}
	}

	async fn build_request(&self) -> GossipRequest {
		GossipRequest { id: self.id.clone(), endpoint: self.endpoint.clone(), pool: self.pool_snapshot().await, version: self.version.load(Ordering::SeqCst) }
	}

	/// Merges an incoming pool: a peer already known under a different
	/// endpoint is updated in place (last writer wins, since endpoint
	/// changes only happen on restart); a brand-new peer is added. Bumps
	/// our own version whenever the merge actually changes something,
	/// so the next round's request reflects the update.
	async fn merge_pool(&self, incoming: BTreeMap<ServerId, String>, incoming_version: u64) {
		let mut pool = self.pool.lock().await;
		let mut changed = false;
		for (id, endpoint) in incoming {
			match pool.get(&id) {
				Some(existing) if *existing == endpoint => {}
				_ => {
					pool.insert(id, endpoint);
					changed = true;
				}
			}
		}
		drop(pool);
		if changed {
			let bumped = self.version.fetch_add(1, Ordering::SeqCst) + 1;
			if incoming_version > bumped {
				self.version.store(incoming_version, Ordering::SeqCst);
			}
		}
	}

	/// Inbound handler for a peer's gossip request: merges their view
	/// of the pool into ours and replies with the merged result (spec
	/// §4.6's pool-merge-on-receipt). Never redirects on the inbound
	/// side — redirection is only used to point a *new* node at a
	/// better-connected seed, decided by `agencyd`'s server layer.
	pub async fn handle_gossip(&self, req: GossipRequest) -> GossipResponse {
		let mut incoming = req.pool;
		incoming.insert(req.id, req.endpoint);
		self.merge_pool(incoming, req.version).await;
		GossipResponse::Merged { pool: self.pool_snapshot().await, version: self.version.load(Ordering::SeqCst) }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	struct LoopbackGossipClient {
		nodes: Mutex<HashMap<String, Arc<Inception>>>,
	}

	#[async_trait]
	impl GossipClient for LoopbackGossipClient {
		async fn gossip(&self, endpoint: &str, req: GossipRequest) -> Result<GossipResponse> {
			let nodes = self.nodes.lock().await;
			let node = nodes.get(endpoint).cloned().ok_or_else(|| Error::PeerUnreachable(endpoint.to_string()))?;
			drop(nodes);
			Ok(node.handle_gossip(req).await)
		}
	}

	#[tokio::test]
	async fn two_node_gossip_converges_to_a_shared_pool() {
		let client = Arc::new(LoopbackGossipClient { nodes: Mutex::new(HashMap::new()) });

		let config = InceptionConfig { pool_size: 2, gossip_interval: Duration::from_millis(5), timeout: Duration::from_millis(500) };
		let a = Arc::new(Inception::new("a".into(), "mock://a".into(), BTreeMap::new(), client.clone(), config.clone()));
		let mut seed_for_b = BTreeMap::new();
		seed_for_b.insert("a".to_string(), "mock://a".to_string());
		let b = Arc::new(Inception::new("b".into(), "mock://b".into(), seed_for_b, client.clone(), config));

		client.nodes.lock().await.insert("mock://a".to_string(), a.clone());
		client.nodes.lock().await.insert("mock://b".to_string(), b.clone());

		let (_tx_a, rx_a) = tokio::sync::oneshot::channel();
		let (_tx_b, rx_b) = tokio::sync::oneshot::channel();
		let (pool_a, pool_b) = tokio::join!(a.run(rx_a), b.run(rx_b));

		assert_eq!(pool_a.len(), 2);
		assert_eq!(pool_b.len(), 2);
		assert!(pool_a.contains_key("a") && pool_a.contains_key("b"));
	}

	#[tokio::test]
	async fn gossip_to_unreachable_seed_times_out_without_hanging() {
		let client = Arc::new(LoopbackGossipClient { nodes: Mutex::new(HashMap::new()) });
		let config = InceptionConfig { pool_size: 3, gossip_interval: Duration::from_millis(5), timeout: Duration::from_millis(50) };
		let mut seed = BTreeMap::new();
		seed.insert("ghost".to_string(), "mock://ghost".to_string());
		let a = Inception::new("a".into(), "mock://a".into(), seed, client, config);

		let (_tx, rx) = tokio::sync::oneshot::channel();
		let pool = a.run(rx).await;
		assert!(pool.contains_key("a"));
	}
}
