//! The hierarchical node tree (spec §3.2): an ordered map from path
//! segment to child, leaves holding a tagged scalar/array/object
//! value. One node is either a branch or a leaf, never both.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protos::{Operator, Precondition, ScalarOrTree};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
	pub readers: Vec<String>,
	pub writer: Option<String>,
}

impl Default for LockState {
	fn default() -> Self {
		LockState { readers: vec![], writer: None }
	}
}

impl LockState {
	fn is_locked(&self) -> bool {
		self.writer.is_some() || !self.readers.is_empty()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeValue {
	Branch(BTreeMap<String, Node>),
	Leaf(ScalarOrTree),
}

/// A single tree node: its value, plus the TTL/observer/lock metadata
/// spec §3.2 says every node may carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
	pub value: NodeValue,
	/// Absolute expiry, milliseconds since the Unix epoch.
	pub ttl_millis: Option<u64>,
	pub observers: Vec<(String, String)>,
	#[serde(default)]
	pub locks: LockState,
}

impl Node {
	pub fn leaf(v: ScalarOrTree) -> Self {
		Node { value: NodeValue::Leaf(v), ttl_millis: None, observers: vec![], locks: LockState::default() }
	}

	pub fn branch() -> Self {
		Node { value: NodeValue::Branch(BTreeMap::new()), ttl_millis: None, observers: vec![], locks: LockState::default() }
	}

	pub fn is_branch(&self) -> bool {
		matches!(self.value, NodeValue::Branch(_))
	}
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TreeError {
	#[error("type error at {path}: {reason}")]
	TypeError { path: String, reason: String },
	#[error("precondition failed at {path}")]
	PreconditionFailed { path: String },
	#[error("{path} would violate a structural invariant: {reason}")]
	Forbidden { path: String, reason: String },
}

fn split_path(path: &str) -> Result<Vec<&str>, TreeError> {
	if !path.starts_with('/') {
		return Err(TreeError::TypeError { path: path.to_string(), reason: "path must start with '/'".into() });
	}
	let trimmed = path.trim_start_matches('/');
	if trimmed.is_empty() {
		return Ok(vec![]);
	}
	let parts: Vec<&str> = trimmed.split('/').collect();
	for p in &parts {
		if p.is_empty() || *p == "." || *p == ".." {
			return Err(TreeError::TypeError { path: path.to_string(), reason: "empty or '.'/'..' segment".into() });
		}
	}
	Ok(parts)
}

pub fn now_millis() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// The root of a Store's tree, plus the operations spec §4.1 lists.
pub struct Tree {
	pub root: Node,
}

impl Tree {
	pub fn new() -> Self {
		Tree { root: Node::branch() }
	}

	pub fn get(&self, path: &str) -> Option<&Node> {
		let parts = split_path(path).ok()?;
		let mut cur = &self.root;
		for p in parts {
			match &cur.value {
				NodeValue::Branch(children) => cur = children.get(p)?,
				NodeValue::Leaf(_) => return None,
			}
		}
		Some(cur)
	}

	fn get_mut(&mut self, path: &str) -> Option<&mut Node> {
		let parts = split_path(path).ok()?;
		let mut cur = &mut self.root;
		for p in parts {
			match &mut cur.value {
				NodeValue::Branch(children) => cur = children.get_mut(p)?,
				NodeValue::Leaf(_) => return None,
			}
		}
		Some(cur)
	}

	/// Creates every branch node along `path` that doesn't exist yet,
	/// then returns the terminal node for mutation. Fails with
	/// `TypeError` if an intermediate segment is a leaf.
	fn ensure_path<'a>(&'a mut self, path: &str) -> Result<&'a mut Node, TreeError> {
		let parts = split_path(path)?;
		let mut cur = &mut self.root;
		for p in parts {
			match &mut cur.value {
				NodeValue::Branch(children) => {
					cur = children.entry(p.to_string()).or_insert_with(Node::branch);
				}
				NodeValue::Leaf(_) => {
					return Err(TreeError::TypeError { path: path.to_string(), reason: format!("'{}' is a leaf, not a branch", p) });
				}
			}
		}
		Ok(cur)
	}

	fn parent_and_name<'a>(&'a mut self, path: &str) -> Result<(&'a mut Node, String), TreeError> {
		let parts = split_path(path)?;
		let Some((last, prefix)) = parts.split_last() else {
			return Err(TreeError::Forbidden { path: path.to_string(), reason: "cannot operate on the root".into() });
		};
		let mut cur = &mut self.root;
		for p in prefix {
			match &mut cur.value {
				NodeValue::Branch(children) => cur = children.entry((*p).to_string()).or_insert_with(Node::branch),
				NodeValue::Leaf(_) => return Err(TreeError::TypeError { path: path.to_string(), reason: format!("'{}' is a leaf, not a branch", p) }),
			}
		}
		Ok((cur, last.to_string()))
	}

	/// Removes expired nodes rooted under `path`, recursively (spec
	/// §4.1's "on each apply tick, expired nodes are removed before
	/// new operations are applied").
	pub fn expire(&mut self, now: u64) {
		fn walk(node: &mut Node, now: u64) {
			if let NodeValue::Branch(children) = &mut node.value {
				children.retain(|_, child| !child.ttl_millis.map(|t| t <= now).unwrap_or(false));
				for child in children.values_mut() {
					walk(child, now);
				}
			}
		}
		walk(&mut self.root, now);
	}

	pub fn check_precondition(&self, path: &str, pred: &Precondition) -> Result<(), TreeError> {
		let node = self.get(path);
		let fail = || TreeError::PreconditionFailed { path: path.to_string() };

		let ok = match pred {
			Precondition::OldEmpty => node.is_none(),
			Precondition::EqualToValue(expected) => matches!(&node.map(|n| &n.value), Some(NodeValue::Leaf(v)) if v == expected),
			Precondition::IsArray => matches!(node.map(|n| &n.value), Some(NodeValue::Leaf(ScalarOrTree::Array(_)))),
			Precondition::IsObject => matches!(node.map(|n| &n.value), Some(NodeValue::Branch(_)) | Some(NodeValue::Leaf(ScalarOrTree::Object(_)))),
			Precondition::InArray(v) => matches!(node.map(|n| &n.value), Some(NodeValue::Leaf(ScalarOrTree::Array(a))) if a.contains(v)),
			Precondition::NotInArray(v) => match node.map(|n| &n.value) {
				Some(NodeValue::Leaf(ScalarOrTree::Array(a))) => !a.contains(v),
				_ => true,
			},
			Precondition::HasKey(k) => match node.map(|n| &n.value) {
				Some(NodeValue::Branch(children)) => children.contains_key(k),
				Some(NodeValue::Leaf(ScalarOrTree::Object(o))) => o.contains_key(k),
				_ => false,
			},
			Precondition::NotHasKey(k) => match node.map(|n| &n.value) {
				Some(NodeValue::Branch(children)) => !children.contains_key(k),
				Some(NodeValue::Leaf(ScalarOrTree::Object(o))) => !o.contains_key(k),
				_ => true,
			},
			Precondition::ReadLockableBy(who) => match node {
				Some(n) => n.locks.writer.is_none() && !n.locks.readers.iter().any(|r| r == who),
				None => true,
			},
			Precondition::WriteLockableBy(who) => match node {
				Some(n) => !n.locks.is_locked() || n.locks.writer.as_deref() == Some(who.as_str()),
				None => true,
			},
		};

		if ok { Ok(()) } else { Err(fail()) }
	}

	/// Applies one operator at `path`. Locks are acquired last, after
	/// the value mutation the same operator requested, matching the
	/// "preconditions, then operator body, then lock acquisition"
	/// ordering decided for same-transaction lock+mutate operators.
	pub fn apply_operator(&mut self, path: &str, op: &Operator) -> Result<(), TreeError> {
		match op {
			Operator::Set(v) => {
				let (parent, name) = self.parent_and_name(path)?;
				match &mut parent.value {
					NodeValue::Branch(children) => {
						children.insert(name, Node::leaf(v.clone()));
						Ok(())
					}
					NodeValue::Leaf(_) => Err(TreeError::TypeError { path: path.to_string(), reason: "parent is a leaf".into() }),
				}
			}
			Operator::Increment(delta) => {
				let node = self.ensure_leaf_default(path, ScalarOrTree::Int(0))?;
				match &mut node.value {
					NodeValue::Leaf(ScalarOrTree::Int(n)) => {
						*n += delta;
						Ok(())
					}
					_ => Err(TreeError::TypeError { path: path.to_string(), reason: "increment requires an integer leaf".into() }),
				}
			}
			Operator::Decrement(delta) => self.apply_operator(path, &Operator::Increment(-delta)),
			Operator::Push { value, limit } => {
				let node = self.ensure_leaf_default(path, ScalarOrTree::Array(vec![]))?;
				match &mut node.value {
					NodeValue::Leaf(ScalarOrTree::Array(a)) => {
						a.push(value.clone());
						if let Some(limit) = limit {
							while a.len() > *limit {
								a.remove(0);
							}
						}
						Ok(())
					}
					_ => Err(TreeError::TypeError { path: path.to_string(), reason: "push requires an array leaf".into() }),
				}
			}
			Operator::PushQueue { value, limit } => self.apply_operator(path, &Operator::Push { value: value.clone(), limit: Some(*limit) }),
			Operator::Pop => match self.get_mut(path) {
				Some(Node { value: NodeValue::Leaf(ScalarOrTree::Array(a)), .. }) => {
					a.pop();
					Ok(())
				}
				_ => Err(TreeError::TypeError { path: path.to_string(), reason: "pop requires an array leaf".into() }),
			},
			Operator::Prepend(value) => {
				let node = self.ensure_leaf_default(path, ScalarOrTree::Array(vec![]))?;
				match &mut node.value {
					NodeValue::Leaf(ScalarOrTree::Array(a)) => {
						a.insert(0, value.clone());
						Ok(())
					}
					_ => Err(TreeError::TypeError { path: path.to_string(), reason: "prepend requires an array leaf".into() }),
				}
			}
			Operator::Shift => match self.get_mut(path) {
				Some(Node { value: NodeValue::Leaf(ScalarOrTree::Array(a)), .. }) => {
					if !a.is_empty() {
						a.remove(0);
					}
					Ok(())
				}
				_ => Err(TreeError::TypeError { path: path.to_string(), reason: "shift requires an array leaf".into() }),
			},
			Operator::Erase(member) => {
				let (parent, name) = self.parent_and_name(path)?;
				match (&mut parent.value, member) {
					(NodeValue::Branch(children), None) => {
						children.remove(&name);
						Ok(())
					}
					(NodeValue::Branch(children), Some(m)) => {
						if let Some(Node { value: NodeValue::Leaf(ScalarOrTree::Array(a)), .. }) = children.get_mut(&name) {
							a.retain(|x| x != m);
							Ok(())
						} else {
							Err(TreeError::TypeError { path: path.to_string(), reason: "erase(member) requires an array leaf".into() })
						}
					}
					(NodeValue::Leaf(_), _) => Err(TreeError::TypeError { path: path.to_string(), reason: "parent is a leaf".into() }),
				}
			}
			Operator::Replace { old, new } => match self.get_mut(path) {
				Some(Node { value: NodeValue::Leaf(v), .. }) if v == old => {
					*v = new.clone();
					Ok(())
				}
				Some(_) => Err(TreeError::PreconditionFailed { path: path.to_string() }),
				None => Err(TreeError::PreconditionFailed { path: path.to_string() }),
			},
			Operator::ReadLock(by) => {
				let node = self.ensure_path(path)?;
				if node.locks.writer.is_some() {
					return Err(TreeError::Forbidden { path: path.to_string(), reason: "already write-locked".into() });
				}
				if !node.locks.readers.iter().any(|r| r == by) {
					node.locks.readers.push(by.clone());
				}
				Ok(())
			}
			Operator::ReadUnlock(by) => {
				if let Some(node) = self.get_mut(path) {
					node.locks.readers.retain(|r| r != by);
				}
				Ok(())
			}
			Operator::WriteLock(by) => {
				let node = self.ensure_path(path)?;
				if node.locks.is_locked() && node.locks.writer.as_deref() != Some(by.as_str()) {
					return Err(TreeError::Forbidden { path: path.to_string(), reason: "already locked".into() });
				}
				node.locks.writer = Some(by.clone());
				Ok(())
			}
			Operator::WriteUnlock(by) => {
				if let Some(node) = self.get_mut(path) {
					if node.locks.writer.as_deref() == Some(by.as_str()) {
						node.locks.writer = None;
					}
				}
				Ok(())
			}
			Operator::Unobserve(url) => {
				if let Some(node) = self.get_mut(path) {
					node.observers.retain(|(u, _)| u != url);
				}
				Ok(())
			}
		}
	}

	fn ensure_leaf_default(&mut self, path: &str, default: ScalarOrTree) -> Result<&mut Node, TreeError> {
		let (parent, name) = self.parent_and_name(path)?;
		match &mut parent.value {
			NodeValue::Branch(children) => {
				let node = children.entry(name).or_insert_with(|| Node::leaf(default));
				Ok(node)
			}
			NodeValue::Leaf(_) => Err(TreeError::TypeError { path: path.to_string(), reason: "parent is a leaf".into() }),
		}
	}

	pub fn read(&self, path: &str) -> ScalarOrTree {
		match self.get(path) {
			None => ScalarOrTree::Null,
			Some(node) => Self::node_to_value(node),
		}
	}

	fn node_to_value(node: &Node) -> ScalarOrTree {
		match &node.value {
			NodeValue::Leaf(v) => v.clone(),
			NodeValue::Branch(children) => {
				ScalarOrTree::Object(children.iter().map(|(k, v)| (k.clone(), Self::node_to_value(v))).collect())
			}
		}
	}

	pub fn set_ttl(&mut self, path: &str, ttl_millis: Option<u64>) -> Result<(), TreeError> {
		let node = self.ensure_path(path)?;
		node.ttl_millis = ttl_millis;
		Ok(())
	}
}

impl Default for Tree {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_and_read_scalar() {
		let mut t = Tree::new();
		t.apply_operator("/a/b", &Operator::Set(ScalarOrTree::Int(5))).unwrap();
		assert_eq!(t.read("/a/b"), ScalarOrTree::Int(5));
	}

	#[test]
	fn increment_creates_zero_leaf() {
		let mut t = Tree::new();
		t.apply_operator("/counter", &Operator::Increment(3)).unwrap();
		assert_eq!(t.read("/counter"), ScalarOrTree::Int(3));
		t.apply_operator("/counter", &Operator::Increment(-1)).unwrap();
		assert_eq!(t.read("/counter"), ScalarOrTree::Int(2));
	}

	#[test]
	fn push_respects_limit_by_dropping_head() {
		let mut t = Tree::new();
		for i in 0..5 {
			t.apply_operator("/q", &Operator::Push { value: i.to_string(), limit: Some(3) }).unwrap();
		}
		assert_eq!(t.read("/q"), ScalarOrTree::Array(vec!["2".into(), "3".into(), "4".into()]));
	}

	#[test]
	fn replace_fails_when_old_does_not_match() {
		let mut t = Tree::new();
		t.apply_operator("/x", &Operator::Set(ScalarOrTree::Int(1))).unwrap();
		let err = t.apply_operator("/x", &Operator::Replace { old: ScalarOrTree::Int(2), new: ScalarOrTree::Int(3) }).unwrap_err();
		assert!(matches!(err, TreeError::PreconditionFailed { .. }));
	}

	#[test]
	fn write_lock_excludes_other_writer() {
		let mut t = Tree::new();
		t.apply_operator("/res", &Operator::WriteLock("a".into())).unwrap();
		let err = t.apply_operator("/res", &Operator::WriteLock("b".into())).unwrap_err();
		assert!(matches!(err, TreeError::Forbidden { .. }));
	}

	#[test]
	fn read_lock_allows_multiple_readers_but_blocks_writer() {
		let mut t = Tree::new();
		t.apply_operator("/res", &Operator::ReadLock("a".into())).unwrap();
		t.apply_operator("/res", &Operator::ReadLock("b".into())).unwrap();
		let err = t.apply_operator("/res", &Operator::WriteLock("c".into())).unwrap_err();
		assert!(matches!(err, TreeError::Forbidden { .. }));
	}

	#[test]
	fn precondition_has_key_checks_branch_children() {
		let mut t = Tree::new();
		t.apply_operator("/a/b", &Operator::Set(ScalarOrTree::Int(1))).unwrap();
		assert!(t.check_precondition("/a", &Precondition::HasKey("b".into())).is_ok());
		assert!(t.check_precondition("/a", &Precondition::HasKey("c".into())).is_err());
	}

	#[test]
	fn expire_removes_nodes_past_their_ttl() {
		let mut t = Tree::new();
		t.apply_operator("/ephemeral", &Operator::Set(ScalarOrTree::Int(1))).unwrap();
		t.set_ttl("/ephemeral", Some(1000)).unwrap();
		t.expire(500);
		assert_eq!(t.read("/ephemeral"), ScalarOrTree::Int(1));
		t.expire(1500);
		assert_eq!(t.read("/ephemeral"), ScalarOrTree::Null);
	}

	#[test]
	fn erase_member_removes_matching_array_elements() {
		let mut t = Tree::new();
		t.apply_operator("/a", &Operator::Set(ScalarOrTree::Array(vec!["x".into(), "y".into(), "x".into()]))).unwrap();
		t.apply_operator("/a", &Operator::Erase(Some("x".into()))).unwrap();
		assert_eq!(t.read("/a"), ScalarOrTree::Array(vec!["y".into()]));
	}
}
