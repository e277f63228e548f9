//! On-disk configuration (spec §IX.3 / §6.3): a TOML file deserialized
//! with `serde`, the same `toml` crate the retrieved pack reaches for
//! this (e.g. `aptos-core`'s node config). CLI flags (`cli.rs`) layer
//! on top of whatever this loads, so a flag always wins over a file.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Stable UUID text (spec §3.3). Generated once on first startup
	/// and persisted under `data_dir` if not set here.
	pub id: Option<String>,
	pub endpoint: String,
	pub listen_addr: SocketAddr,
	pub data_dir: PathBuf,
	/// Gossip seed pool (spec §4.6): `id -> endpoint`.
	pub pool: BTreeMap<String, String>,
	pub min_ping_millis: u64,
	pub max_ping_millis: u64,
	pub wait_for_sync: bool,
	pub compaction_poll_millis: u64,
	pub compaction_step_size: u64,
	pub compaction_keep_size: u64,
	pub max_append_size: usize,
	pub supervision_frequency_millis: u64,
	pub observer_max_misses: u32,
	pub max_actions_trace_length: usize,
	pub gossip_pool_size: usize,
	pub gossip_interval_millis: u64,
	pub gossip_timeout_secs: u64,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			id: None,
			endpoint: "http://127.0.0.1:8529".to_string(),
			listen_addr: "127.0.0.1:8529".parse().unwrap(),
			data_dir: PathBuf::from("./data"),
			pool: BTreeMap::new(),
			min_ping_millis: 300,
			max_ping_millis: 1000,
			wait_for_sync: true,
			compaction_poll_millis: 5000,
			compaction_step_size: 1000,
			compaction_keep_size: 100,
			max_append_size: 1000,
			supervision_frequency_millis: 250,
			observer_max_misses: 3,
			max_actions_trace_length: 50,
			gossip_pool_size: 1,
			gossip_interval_millis: 500,
			gossip_timeout_secs: 30,
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("failed to read config file {0}: {1}")]
	Read(PathBuf, #[source] std::io::Error),
	#[error("failed to parse config file {0}: {1}")]
	Parse(PathBuf, #[source] toml::de::Error),
}

impl Config {
	pub fn load(path: &Path) -> Result<Self, Error> {
		let text = std::fs::read_to_string(path).map_err(|e| Error::Read(path.to_owned(), e))?;
		toml::from_str(&text).map_err(|e| Error::Parse(path.to_owned(), e))
	}

	pub fn min_ping(&self) -> Duration {
		Duration::from_millis(self.min_ping_millis)
	}

	pub fn max_ping(&self) -> Duration {
		Duration::from_millis(self.max_ping_millis)
	}

	pub fn compaction_poll_interval(&self) -> Duration {
		Duration::from_millis(self.compaction_poll_millis)
	}

	pub fn supervision_tick_interval(&self) -> Duration {
		Duration::from_millis(self.supervision_frequency_millis)
	}

	pub fn gossip_interval(&self) -> Duration {
		Duration::from_millis(self.gossip_interval_millis)
	}

	pub fn gossip_timeout(&self) -> Duration {
		Duration::from_secs(self.gossip_timeout_secs)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn a_minimal_toml_file_overrides_only_the_named_fields() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("agencyd.toml");
		std::fs::write(&path, "endpoint = \"http://10.0.0.5:8529\"\nlisten_addr = \"0.0.0.0:8529\"\n").unwrap();
		let config = Config::load(&path).unwrap();
		assert_eq!(config.endpoint, "http://10.0.0.5:8529");
		assert_eq!(config.compaction_step_size, Config::default().compaction_step_size);
	}
}
