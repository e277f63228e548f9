//! Process entry point flags, modernizing the teacher's `clap` 2.x
//! `App`/`Arg` builder (`pkg/raft/src/main.rs`) into `clap` v4's derive
//! API.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "agencyd", about = "Runs a single Agency consensus peer")]
pub struct Cli {
	/// Directory to store this peer's log, metadata and snapshots in.
	#[arg(long, short = 'd')]
	pub dir: Option<PathBuf>,

	/// TOML configuration file; CLI flags override whatever it sets.
	#[arg(long, short = 'c')]
	pub config: Option<PathBuf>,

	/// This peer's own address, as advertised to the rest of the pool.
	#[arg(long)]
	pub endpoint: Option<String>,

	/// Address to bind the HTTP listener to.
	#[arg(long)]
	pub listen: Option<SocketAddr>,

	/// A seed peer to gossip with on startup, `id=endpoint`; repeatable.
	#[arg(long = "join", value_parser = parse_seed)]
	pub join: Vec<(String, String)>,
}

fn parse_seed(s: &str) -> Result<(String, String), String> {
	let (id, endpoint) = s.split_once('=').ok_or_else(|| format!("expected id=endpoint, got {s}"))?;
	Ok((id.to_string(), endpoint.to_string()))
}
