//! Process entry point: wires Inception (C6) into a Log/Store/
//! ConsensusModule triple (C1-C3), the Agent (C4), the Compactor (C5)
//! and the Supervision loop (C7) behind one `axum` listener, the way
//! the teacher's old `main.rs` wired a single Redis-protocol server
//! but scaled out to this system's several background loops.

mod cli;
mod config;
mod error;
mod http;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use agency_core::fs::DirLock;
use raft::agent::Agent;
use raft::compactor::{Compactor, FileSnapshotStore};
use raft::config_state::ConfigurationSnapshot;
use raft::consensus::ClusterTiming;
use raft::inception::{HttpGossipClient, Inception, InceptionConfig};
use raft::log::{FileLog, FileMetadataStore};
use raft::protos::Configuration;
use raft::rpc::HttpPeerClient;
use supervision::model::{HealthMap, ParticipantHealth};
use supervision::supervisor::{StaticHealthSource, Supervisor, SupervisionConfig};

use crate::cli::Cli;
use crate::config::Config;
use crate::error::Result;
use crate::http::AppState;

fn load_config(cli: &Cli) -> Result<Config> {
	let mut config = match &cli.config {
		Some(path) => Config::load(path)?,
		None => Config::default(),
	};
	if let Some(dir) = &cli.dir {
		config.data_dir = dir.clone();
	}
	if let Some(endpoint) = &cli.endpoint {
		config.endpoint = endpoint.clone();
	}
	if let Some(listen) = cli.listen {
		config.listen_addr = listen;
	}
	for (id, endpoint) in &cli.join {
		config.pool.insert(id.clone(), endpoint.clone());
	}
	Ok(config)
}

/// Reads `data_dir/ID` if present, otherwise mints a fresh one and
/// persists it so a restart rejoins the cluster under the same
/// identity rather than as a brand-new peer (spec §3.3).
fn load_or_create_id(data_dir: &std::path::Path) -> std::io::Result<String> {
	let path = data_dir.join("ID");
	match std::fs::read_to_string(&path) {
		Ok(id) => Ok(id.trim().to_string()),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			let id = uuid::Uuid::new_v4().to_string();
			std::fs::write(&path, &id)?;
			Ok(id)
		}
		Err(e) => Err(e),
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

	let cli = Cli::parse();
	let config = load_config(&cli)?;

	let _lock = DirLock::open(&config.data_dir)?;
	let id = config.id.clone().unwrap_or(load_or_create_id(&config.data_dir)?);
	info!(%id, endpoint = %config.endpoint, data_dir = ?config.data_dir, "starting agencyd");

	let gossip_client = Arc::new(HttpGossipClient::new(config.gossip_timeout()));
	let inception_config = InceptionConfig { pool_size: config.gossip_pool_size, gossip_interval: config.gossip_interval(), timeout: config.gossip_timeout() };
	let inception = Arc::new(Inception::new(id.clone(), config.endpoint.clone(), config.pool.clone(), gossip_client, inception_config));

	let (gossip_shutdown_tx, gossip_shutdown_rx) = tokio::sync::oneshot::channel();
	let inception_for_bootstrap = inception.clone();
	let bootstrap = tokio::spawn(async move { inception_for_bootstrap.run(gossip_shutdown_rx).await });

	// /raft/gossip must already be live for peers that gossip back at
	// us mid-bootstrap, so the listener is bound before awaiting the
	// bootstrap task rather than after.
	let log = Arc::new(FileLog::open(&config.data_dir.join("log"), config.wait_for_sync)?);
	let metadata_store = Arc::new(FileMetadataStore::open(&config.data_dir.join("meta"))?);
	let snapshots = Arc::new(FileSnapshotStore::open(&config.data_dir.join("snapshots"))?);

	let pool: BTreeMap<String, String> = bootstrap.await.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
	drop(gossip_shutdown_tx);
	info!(pool_size = pool.len(), "bootstrap complete");

	let members = pool.keys().cloned().collect();
	let config_snapshot = ConfigurationSnapshot { last_applied: 0, data: Configuration { members, learners: Default::default() } };
	let timing = ClusterTiming { min_ping: config.min_ping(), max_ping: config.max_ping(), timeout_mult: 1.0, max_append_size: config.max_append_size, max_append_bytes: 4 * 1024 * 1024 };

	let peer_client = Arc::new(HttpPeerClient::new(config.max_ping()));
	let agent = Agent::spawn(id.clone(), config_snapshot, log, metadata_store, peer_client, pool.clone(), timing, config.observer_max_misses);

	let (agent_shutdown_tx, agent_shutdown_rx) = tokio::sync::oneshot::channel();
	let agent_for_run = agent.clone();
	tokio::spawn(async move { agent_for_run.run(agent_shutdown_rx).await });

	let compactor = Arc::new(Compactor::new(snapshots, config.compaction_poll_interval(), config.compaction_step_size, config.compaction_keep_size));
	compactor.restore_on_startup(&agent).await?;
	let (compactor_shutdown_tx, compactor_shutdown_rx) = tokio::sync::oneshot::channel();
	let compactor_for_run = compactor.clone();
	let agent_for_compactor = agent.clone();
	tokio::spawn(async move { compactor_for_run.run(agent_for_compactor, compactor_shutdown_rx).await });

	// Every peer in the bootstrapped pool is assumed up and on its
	// first incarnation until a real failure detector lands; until
	// then Supervision can still materialize Plan/Current convergence
	// and hand control back once health reporting exists.
	let health: HealthMap = pool.keys().map(|id| (id.clone(), ParticipantHealth { reboot_id: 0, not_failed: true })).collect();
	let supervisor = Arc::new(Supervisor::new(
		agent.clone(),
		Arc::new(StaticHealthSource(health)),
		SupervisionConfig { tick_interval: config.supervision_tick_interval(), max_actions_trace_length: config.max_actions_trace_length },
	));
	let (supervision_shutdown_tx, supervision_shutdown_rx) = tokio::sync::oneshot::channel();
	let supervisor_for_run = supervisor.clone();
	tokio::spawn(async move { supervisor_for_run.run(vec![id.clone()], supervision_shutdown_rx).await });

	let state = Arc::new(AppState { agent: agent.clone(), inception });
	let app = http::router(state);
	let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
	info!(addr = %config.listen_addr, "listening");

	axum::serve(listener, app).await?;

	let _ = agent_shutdown_tx.send(());
	let _ = compactor_shutdown_tx.send(());
	let _ = supervision_shutdown_tx.send(());
	tokio::time::sleep(Duration::from_millis(50)).await;
	Ok(())
}
