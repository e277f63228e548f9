//! C1: the replicated state machine (spec §4.1). `Store` wraps a
//! [`tree::Tree`] with the transaction pipeline (precondition check →
//! operator application → TTL write-back), observer bookkeeping, and
//! snapshot dump/load. Callers (the Agent) are responsible for
//! holding it behind the right lock (`io_lock` for the leader's
//! spearhead, `output_lock` for the committed store) — `Store` itself
//! does no internal locking, the same way the teacher's in-memory
//! data structures assume a single owner per instance.

pub mod observer;
pub mod tree;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::protos::{Outcome, ScalarOrTree, Transaction, Write};
use observer::{notifications_for_changed_paths, Notification, TrashBin};
use tree::{now_millis, Tree, TreeError};

pub struct Store {
	tree: Tree,
	trash_bin: TrashBin,
}

/// On-disk/wire snapshot format (spec §4.1 `dump`/`load`).
#[derive(Serialize, Deserialize)]
struct Snapshot {
	tree: tree::Node,
}

impl Store {
	pub fn new(observer_max_misses: u32) -> Self {
		Store { tree: Tree::new(), trash_bin: TrashBin::new(observer_max_misses) }
	}

	pub fn read(&self, paths: &[String]) -> Vec<ScalarOrTree> {
		paths.iter().map(|p| self.tree.read(p)).collect()
	}

	/// Applies one transaction, following spec §4.1's ordering:
	/// preconditions are evaluated against the pre-transaction state
	/// only, then operators run left to right. `checked=false` skips
	/// precondition evaluation (used only when replaying already-
	/// committed log entries, spec §4.1 `unchecked` mode).
	pub fn apply_transaction(&mut self, tx: &Transaction, checked: bool) -> (Outcome, Vec<String>) {
		self.tree.expire(now_millis());

		if checked {
			for (path, pred) in &tx.preconditions {
				if let Err(TreeError::PreconditionFailed { path }) = self.tree.check_precondition(path, pred) {
					return (Outcome::PreconditionFailed { path }, vec![]);
				}
			}
		}

		let mut changed = Vec::with_capacity(tx.writes.len());
		for write in &tx.writes {
			if let Err(err) = self.apply_write(write) {
				return (to_outcome(err), changed);
			}
			changed.push(write.path.clone());
		}

		(Outcome::Applied, changed)
	}

	fn apply_write(&mut self, write: &Write) -> Result<(), TreeError> {
		self.tree.apply_operator(&write.path, &write.operator)?;
		if let Some(ttl) = write.ttl_millis {
			self.tree.set_ttl(&write.path, Some(ttl))?;
		}
		Ok(())
	}

	/// Applies a batch left to right; each transaction's outcome is
	/// independent of the others' success or failure (spec §4.1 "Tie-
	/// breaks and ordering").
	pub fn apply_batch(&mut self, txs: &[Transaction], checked: bool) -> Vec<(Outcome, Vec<String>)> {
		txs.iter().map(|tx| self.apply_transaction(tx, checked)).collect()
	}

	pub fn observe(&mut self, path: &str, url: &str, client_id: &str) -> Result<(), TreeError> {
		self.mutate_observers(path, |observers| {
			if !observers.iter().any(|(u, c)| u == url && c == client_id) {
				observers.push((url.to_string(), client_id.to_string()));
			}
		})
	}

	pub fn unobserve(&mut self, path: &str, url: &str, client_id: &str) -> Result<(), TreeError> {
		self.mutate_observers(path, |observers| observers.retain(|(u, c)| !(u == url && c == client_id)))
	}

	fn mutate_observers(&mut self, path: &str, f: impl FnOnce(&mut Vec<(String, String)>)) -> Result<(), TreeError> {
		// Observers are metadata, not a tracked write: direct node
		// mutation bypasses the operator pipeline the same way TTL
		// changes would if they weren't required to be transactional.
		let parts: Vec<&str> = path.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect();
		let mut cur = &mut self.tree.root;
		for p in &parts {
			match &mut cur.value {
				tree::NodeValue::Branch(children) => {
					cur = children.entry((*p).to_string()).or_insert_with(tree::Node::branch);
				}
				tree::NodeValue::Leaf(_) => return Err(TreeError::TypeError { path: path.to_string(), reason: format!("'{}' is a leaf", p) }),
			}
		}
		f(&mut cur.observers);
		Ok(())
	}

	/// Expands the paths a committed batch touched into concrete
	/// observer notifications (spec §4.1 "Observer firing").
	pub fn notifications_for(&self, changed_paths: &[String]) -> Vec<Notification> {
		notifications_for_changed_paths(&self.tree, changed_paths)
	}

	/// Records a delivery attempt; returns the observer URL if it has
	/// just crossed the miss threshold and should be evicted via a
	/// garbage-collection transaction (spec §8 S7).
	pub fn record_delivery(&mut self, url: &str, delivered: bool) -> bool {
		self.trash_bin.record(url, delivered)
	}

	/// Builds the committed transaction that removes `url` from every
	/// node's observer list (the "trash bin" GC transaction).
	pub fn evict_observer_transaction(&self, url: &str) -> Transaction {
		let mut writes = Vec::new();
		fn walk(node: &tree::Node, path: &str, url: &str, writes: &mut Vec<Write>) {
			if !path.is_empty() && node.observers.iter().any(|(u, _)| u == url) {
				writes.push(Write { path: path.to_string(), operator: crate::protos::Operator::Unobserve(url.to_string()), ttl_millis: None });
			}
			if let tree::NodeValue::Branch(children) = &node.value {
				for (name, child) in children {
					walk(child, &format!("{}/{}", path, name), url, writes);
				}
			}
		}
		walk(&self.tree.root, "", url, &mut writes);
		Transaction { writes, preconditions: BTreeMap::new(), client_id: format!("trash-bin:{url}") }
	}

	pub fn dump(&self) -> Vec<u8> {
		serde_json::to_vec(&Snapshot { tree: self.tree.root.clone() }).expect("snapshot serialization cannot fail for an in-memory tree")
	}

	pub fn load(&mut self, bytes: &[u8]) -> Result<(), crate::errors::Error> {
		let snap: Snapshot = serde_json::from_slice(bytes)?;
		self.tree.root = snap.tree;
		Ok(())
	}

	pub fn expire(&mut self, now: u64) {
		self.tree.expire(now);
	}
}

fn to_outcome(err: TreeError) -> Outcome {
	match err {
		TreeError::PreconditionFailed { path } => Outcome::PreconditionFailed { path },
		TreeError::TypeError { path, reason } => Outcome::Forbidden { reason: format!("type error at {path}: {reason}") },
		TreeError::Forbidden { path, reason } => Outcome::Forbidden { reason: format!("{path}: {reason}") },
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protos::Operator;

	fn write(path: &str, op: Operator) -> Write {
		Write { path: path.to_string(), operator: op, ttl_millis: None }
	}

	#[test]
	fn applied_transaction_reports_changed_paths() {
		let mut store = Store::new(3);
        let tx = Transaction { writes: vec![write("/a", Operator::Set(ScalarOrTree::Int(1)))], preconditions: BTreeMap::new(), client_id: "c1".into() };
		let (outcome, changed) = store.apply_transaction(&tx, true);
		assert_eq!(outcome, Outcome::Applied);
		assert_eq!(changed, vec!["/a".to_string()]);
		assert_eq!(store.read(&["/a".to_string()]), vec![ScalarOrTree::Int(1)]);
	}

	#[test]
	fn precondition_failure_stops_before_any_write() {
		let mut store = Store::new(3);
		let mut preconditions = BTreeMap::new();
		preconditions.insert("/a".to_string(), crate::protos::Precondition::HasKey("missing".into()));
		let tx = Transaction { writes: vec![write("/a/b", Operator::Set(ScalarOrTree::Int(1)))], preconditions, client_id: "c1".into() };
		let (outcome, changed) = store.apply_transaction(&tx, true);
		assert!(matches!(outcome, Outcome::PreconditionFailed { .. }));
		assert!(changed.is_empty());
	}

	#[test]
	fn batch_transactions_are_independent() {
		let mut store = Store::new(3);
		let ok = Transaction { writes: vec![write("/a", Operator::Set(ScalarOrTree::Int(1)))], preconditions: BTreeMap::new(), client_id: "c1".into() };
		let bad = Transaction { writes: vec![write("/a", Operator::Pop)], preconditions: BTreeMap::new(), client_id: "c2".into() };
		let results = store.apply_batch(&[ok, bad], true);
		assert_eq!(results[0].0, Outcome::Applied);
		assert!(matches!(results[1].0, Outcome::Forbidden { .. }));
		// The first transaction's effect survives the second's failure.
		assert_eq!(store.read(&["/a".to_string()]), vec![ScalarOrTree::Int(1)]);
	}

	#[test]
	fn dump_and_load_round_trip() {
		let mut store = Store::new(3);
		let tx = Transaction { writes: vec![write("/a/b", Operator::Set(ScalarOrTree::Str("v".into())))], preconditions: BTreeMap::new(), client_id: "c1".into() };
		store.apply_transaction(&tx, true);
		let bytes = store.dump();

		let mut other = Store::new(3);
		other.load(&bytes).unwrap();
		assert_eq!(other.read(&["/a/b".to_string()]), vec![ScalarOrTree::Str("v".into())]);
	}

	#[test]
	fn observe_then_notify_on_change() {
		let mut store = Store::new(3);
		store.observe("/q", "http://cb", "client-1").unwrap();
		let tx = Transaction { writes: vec![write("/q/a", Operator::Set(ScalarOrTree::Int(1)))], preconditions: BTreeMap::new(), client_id: "c1".into() };
		let (_, changed) = store.apply_transaction(&tx, true);
		let notifications = store.notifications_for(&changed);
		assert_eq!(notifications.len(), 1);
		assert_eq!(notifications[0].url, "http://cb");
	}
}
