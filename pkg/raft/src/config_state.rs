//! Tracks the currently-effective cluster `Configuration` as log
//! entries are appended, committed, or truncated, the same way the
//! teacher's `ConfigurationStateMachine` layers an uncommitted pending
//! change on top of the last-committed snapshot.

use crate::protos::{ConfigChange, Configuration, LogEntry, LogEntryData, LogIndex};

#[derive(Debug, Clone)]
pub struct ConfigurationSnapshot {
	pub last_applied: LogIndex,
	pub data: Configuration,
}

impl Default for ConfigurationSnapshot {
	fn default() -> Self {
		ConfigurationSnapshot { last_applied: 0, data: Configuration::default() }
	}
}

pub struct ConfigurationSnapshotRef<'a> {
	pub last_applied: LogIndex,
	pub data: &'a Configuration,
}

#[derive(Debug, Clone)]
pub struct PendingChange {
	pub last_change: LogIndex,
	pub change: ConfigChange,
	pub previous: Configuration,
}

/// Applies configuration-changing log entries eagerly (as soon as they
/// land in the log, before they're committed), while retaining enough
/// history to revert a change if its entry is later truncated — spec
/// §1's "membership is fixed per term" means these transitions are
/// rare, but the mechanics are load-bearing when a join does happen.
pub struct ConfigurationStateMachine {
	pub value: Configuration,
	pub last_applied: LogIndex,
	pub pending: Option<PendingChange>,
}

impl From<ConfigurationSnapshot> for ConfigurationStateMachine {
	fn from(snap: ConfigurationSnapshot) -> Self {
		ConfigurationStateMachine { value: snap.data, last_applied: snap.last_applied, pending: None }
	}
}

impl ConfigurationStateMachine {
	pub fn snapshot(&self) -> ConfigurationSnapshotRef {
		ConfigurationSnapshotRef { last_applied: self.last_applied, data: &self.value }
	}

	/// Applies a single log entry's effect on the configuration. For
	/// non-config entries this only advances `last_applied`.
	pub fn apply(&mut self, entry: &LogEntry, commit_index: LogIndex) {
		if let LogEntryData::Config(change) = &entry.data {
			let previous = self.value.clone();
			self.value.apply(change);
			if entry.index > commit_index {
				self.pending = Some(PendingChange { last_change: entry.index, change: change.clone(), previous });
			} else {
				self.pending = None;
			}
		}
		self.last_applied = entry.index;
	}

	/// Called whenever the commit index advances; resolves a pending
	/// change once its entry is committed. Returns true if the pending
	/// state changed (callers use this to decide whether to persist).
	pub fn commit(&mut self, commit_index: LogIndex) -> bool {
		if let Some(p) = &self.pending {
			if p.last_change <= commit_index {
				self.pending = None;
				return true;
			}
		}
		false
	}

	/// Reverts the configuration to what it was before `index`,
	/// because the entry at `index` (or an earlier one covering the
	/// same change) is being truncated from the log.
	pub fn revert(&mut self, index: LogIndex) {
		if let Some(p) = &self.pending {
			if p.last_change >= index {
				self.value = p.previous.clone();
				self.pending = None;
			}
		}
	}
}
