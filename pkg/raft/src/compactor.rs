//! C5: the background snapshotting worker (spec §4.5). Wakes on a
//! timer, checks how far the committed index has drifted past the
//! last snapshot, and if it has drifted more than `step_size`, dumps
//! the committed `Store` and asks the log to drop everything at or
//! below `last_included_index - keep_size`. Kept as its own task, the
//! same way the teacher splits its background compaction worker from
//! the request-handling path, so a slow snapshot write never blocks a
//! client write or an AppendEntries response.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agent::Agent;
use crate::protos::{LogIndex, Term};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SnapshotMeta {
	pub last_included_index: LogIndex,
	pub last_included_term: Term,
}

/// Where compacted snapshots are persisted. Kept separate from
/// `log::MetadataStore` since a snapshot is bulk state-machine data,
/// not a small fixed record (spec §4.5).
pub trait SnapshotStore: Send + Sync {
	fn save(&self, meta: SnapshotMeta, data: &[u8]) -> io::Result<()>;
	fn load(&self) -> Option<(SnapshotMeta, Vec<u8>)>;
}

#[derive(Default)]
pub struct MemorySnapshotStore {
	inner: Mutex<Option<(SnapshotMeta, Vec<u8>)>>,
}

impl SnapshotStore for MemorySnapshotStore {
	fn save(&self, meta: SnapshotMeta, data: &[u8]) -> io::Result<()> {
		*self.inner.lock().unwrap() = Some((meta, data.to_vec()));
		Ok(())
	}

	fn load(&self) -> Option<(SnapshotMeta, Vec<u8>)> {
		self.inner.lock().unwrap().clone()
	}
}

/// Writes `snapshot.meta.json` + `snapshot.data` into a directory,
/// temp-file-then-rename like `log::FileMetadataStore` so a crash
/// mid-write never leaves a half-written snapshot visible.
pub struct FileSnapshotStore {
	dir: PathBuf,
}

impl FileSnapshotStore {
	pub fn open(dir: &Path) -> io::Result<Self> {
		std::fs::create_dir_all(dir)?;
		Ok(FileSnapshotStore { dir: dir.to_owned() })
	}

	fn meta_path(&self) -> PathBuf {
		self.dir.join("snapshot.meta.json")
	}

	fn data_path(&self) -> PathBuf {
		self.dir.join("snapshot.data")
	}
}

impl SnapshotStore for FileSnapshotStore {
	fn save(&self, meta: SnapshotMeta, data: &[u8]) -> io::Result<()> {
		let meta_bytes = serde_json::to_vec(&meta)?;

		let data_tmp = self.data_path().with_extension("data.tmp");
		std::fs::write(&data_tmp, data)?;
		let data_file = std::fs::File::open(&data_tmp)?;
		agency_core::fs::sync_file(&data_file, true)?;
		std::fs::rename(&data_tmp, self.data_path())?;

		let meta_tmp = self.meta_path().with_extension("json.tmp");
		std::fs::write(&meta_tmp, meta_bytes)?;
		let meta_file = std::fs::File::open(&meta_tmp)?;
		agency_core::fs::sync_file(&meta_file, true)?;
		std::fs::rename(&meta_tmp, self.meta_path())?;

		Ok(())
	}

	fn load(&self) -> Option<(SnapshotMeta, Vec<u8>)> {
		let meta_bytes = std::fs::read(self.meta_path()).ok()?;
		let meta: SnapshotMeta = serde_json::from_slice(&meta_bytes).ok()?;
		let data = std::fs::read(self.data_path()).ok()?;
		Some((meta, data))
	}
}

pub struct Compactor {
	snapshots: Arc<dyn SnapshotStore>,
	poll_interval: Duration,
	step_size: LogIndex,
	keep_size: LogIndex,
	last_snapshot_index: AtomicU64,
}

impl Compactor {
	pub fn new(snapshots: Arc<dyn SnapshotStore>, poll_interval: Duration, step_size: LogIndex, keep_size: LogIndex) -> Self {
		let last_snapshot_index = snapshots.load().map(|(m, _)| m.last_included_index).unwrap_or(0);
		Compactor { snapshots, poll_interval, step_size, keep_size, last_snapshot_index: AtomicU64::new(last_snapshot_index) }
	}

	/// On startup, a follower that was offline long enough for its
	/// predecessor's log entries to be compacted away needs the
	/// snapshot installed before it can resume normal replication.
	pub async fn restore_on_startup(&self, agent: &Agent) -> crate::errors::Result<()> {
		if let Some((meta, data)) = self.snapshots.load() {
			agent.install_snapshot(meta.last_included_index, meta.last_included_term, &data).await?;
		}
		Ok(())
	}

	pub async fn run(self: Arc<Self>, agent: Arc<Agent>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
		loop {
			tokio::select! {
				_ = &mut shutdown => return,
				_ = tokio::time::sleep(self.poll_interval) => {}
			}
			self.maybe_compact(&agent).await;
		}
	}

	async fn maybe_compact(&self, agent: &Agent) {
		let commit_index = agent.commit_index().await;
		let last_snapshot_index = self.last_snapshot_index.load(Ordering::Relaxed);
		if commit_index.saturating_sub(last_snapshot_index) <= self.step_size {
			return;
		}

		let log = agent.log_handle();
		let term = match log.term(commit_index) {
			Some(t) => t,
			None => return, // already compacted past commit_index by someone else
		};

		let data = agent.dump_committed().await;
		let meta = SnapshotMeta { last_included_index: commit_index, last_included_term: term };
		if let Err(e) = self.snapshots.save(meta, &data) {
			warn!(error = %e, "failed to persist snapshot; leaving log uncompacted");
			return;
		}
		self.last_snapshot_index.store(commit_index, Ordering::Relaxed);

		let cutoff = commit_index.saturating_sub(self.keep_size);
		if cutoff > 0 {
			let cutoff_term = log.term(cutoff).unwrap_or(term);
			log.compact(cutoff, cutoff_term);
		}

		info!(commit_index, cutoff, "compacted log against new snapshot");
	}

	/// The most recently taken snapshot, if any — used by the leader
	/// to answer an install-snapshot request for a follower whose
	/// `next_index` has fallen below the log's `first_index`.
	pub fn latest(&self) -> Option<(SnapshotMeta, Vec<u8>)> {
		self.snapshots.load()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config_state::ConfigurationSnapshot;
	use crate::consensus::ClusterTiming;
	use crate::log::{MemoryLog, MemoryMetadataStore};
	use crate::protos::{Configuration, Operator, ScalarOrTree, Transaction, Write};
	use crate::rpc::mock::{MockNetwork, MockPeerClient};
	use std::collections::BTreeMap;

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

	#[tokio::test]
	async fn compacts_once_step_size_is_exceeded() {
		let network = Arc::new(MockNetwork::default());
		let agent = make_single_node_agent(&network);
		network.nodes.lock().await.insert("a".into(), agent.clone());

		tokio::time::sleep(Duration::from_millis(15)).await;
		agent.tick_once().await;

		for i in 0..5 {
			let tx = Transaction { writes: vec![Write { path: format!("/k{i}"), operator: Operator::Set(ScalarOrTree::Int(i as i64)), ttl_millis: None }], preconditions: BTreeMap::new(), client_id: format!("c{i}") };
			let resp = agent.write(vec![tx], crate::protos::WriteMode::Normal).await;
			assert!(resp.accepted);
			agent.wait_for(resp.indices[0], Duration::from_secs(1)).await;
		}

		let snapshots = Arc::new(MemorySnapshotStore::default());
		let compactor = Compactor::new(snapshots.clone(), Duration::from_millis(10), 2, 1);
		compactor.maybe_compact(&agent).await;

		assert!(snapshots.load().is_some());
	}

	#[tokio::test]
	async fn follower_installs_snapshot_sent_by_a_higher_term_leader() {
		let network = Arc::new(MockNetwork::default());
		let agent = make_single_node_agent(&network);
		network.nodes.lock().await.insert("a".into(), agent.clone());

		let data = crate::store::Store::new(3).dump();
		let req = crate::protos::InstallSnapshotRequest { term: 5, leader_id: "b".into(), last_included_index: 10, last_included_term: 4, data };
		let resp = agent.handle_install_snapshot(req).await;
		assert!(resp.success);
		assert_eq!(agent.commit_index().await, 10);
	}

	#[test]
	fn file_snapshot_store_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileSnapshotStore::open(dir.path()).unwrap();
		let meta = SnapshotMeta { last_included_index: 42, last_included_term: 3 };
		store.save(meta, b"hello").unwrap();
		let (loaded_meta, data) = store.load().unwrap();
		assert_eq!(loaded_meta.last_included_index, 42);
		assert_eq!(data, b"hello");
	}
}
