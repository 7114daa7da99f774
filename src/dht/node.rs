//! A contact record and the k-bucket that holds a handful of them.

use crate::common::*;
use crate::dht::node_id::NodeId;

/// How long a node can go unanswered before it's no longer "good".
pub const QUESTIONABLE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Bucket capacity.
pub const K: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Health {
  /// Responded to us, or queried us, within the last 15 minutes.
  Good,
  /// Inactive for more than 15 minutes, but hasn't failed twice in a row yet.
  Questionable,
  /// Failed to answer two consecutive queries. A replacement candidate for this slot.
  Bad,
}

/// A contact: a remote node's identity, address, and liveness bookkeeping.
#[derive(Clone, Debug)]
pub struct Node {
  pub id: NodeId,
  pub addr: SocketAddrV4,
  last_seen: Instant,
  failed_queries: u32,
  pub last_token_received: Option<Vec<u8>>,
}

impl Node {
  pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
    Node {
      id,
      addr,
      last_seen: Instant::now(),
      failed_queries: 0,
      last_token_received: None,
    }
  }

  pub fn last_seen(&self) -> Instant {
    self.last_seen
  }

  pub fn failed_queries(&self) -> u32 {
    self.failed_queries
  }

  /// Records a successful response from this node: resets the failure counter and bumps
  /// `last_seen`, which can only move forward.
  pub fn mark_responded(&mut self) {
    self.failed_queries = 0;
    self.touch();
  }

  /// Bumps `last_seen` without touching the failure counter — used when the node queries us,
  /// which demonstrates liveness but isn't a response to our own RPC.
  pub fn touch(&mut self) {
    let now = Instant::now();
    if now > self.last_seen {
      self.last_seen = now;
    }
  }

  pub fn mark_failed(&mut self) {
    self.failed_queries += 1;
  }

  pub fn health(&self) -> Health {
    if self.failed_queries >= 2 {
      Health::Bad
    } else if self.last_seen.elapsed() >= QUESTIONABLE_AFTER {
      Health::Questionable
    } else {
      Health::Good
    }
  }

  pub fn is_bad(&self) -> bool {
    self.health() == Health::Bad
  }
}

impl PartialEq for Node {
  fn eq(&self, other: &Self) -> bool {
    self.id == other.id
  }
}
impl Eq for Node {}

/// The result of attempting to add a contact to a bucket.
#[derive(Debug, Eq, PartialEq)]
pub enum AddOutcome {
  Updated,
  Added,
  Replaced,
  Full,
}

/// A bucket covering the half-open range `[min, max)` of the id space.
pub struct Bucket {
  pub min: NodeId,
  pub max: NodeId,
  nodes: Vec<Node>,
  replacement: Option<Node>,
  last_changed: Instant,
}

impl Bucket {
  pub fn new(min: NodeId, max: NodeId) -> Self {
    Bucket {
      min,
      max,
      nodes: Vec::with_capacity(K),
      replacement: None,
      last_changed: Instant::now(),
    }
  }

  pub fn can_contain(&self, id: &NodeId) -> bool {
    *id >= self.min && *id < self.max
  }

  pub fn nodes(&self) -> &[Node] {
    &self.nodes
  }

  pub fn replacement(&self) -> Option<&Node> {
    self.replacement.as_ref()
  }

  pub fn last_changed(&self) -> Instant {
    self.last_changed
  }

  pub fn is_full(&self) -> bool {
    self.nodes.len() >= K
  }

  pub fn find(&self, id: &NodeId) -> Option<&Node> {
    self.nodes.iter().find(|n| n.id == *id)
  }

  pub fn find_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
    self.nodes.iter_mut().find(|n| n.id == *id)
  }

  pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
    let index = self.nodes.iter().position(|n| n.id == *id)?;
    self.last_changed = Instant::now();
    Some(self.nodes.remove(index))
  }

  /// Adds (or touches) `node`.
  pub fn add(&mut self, node: Node) -> AddOutcome {
    if let Some(existing) = self.find_mut(&node.id) {
      existing.touch();
      self.last_changed = Instant::now();
      return AddOutcome::Updated;
    }

    if self.nodes.len() < K {
      self.nodes.push(node);
      self.sort_by_last_seen();
      self.last_changed = Instant::now();
      return AddOutcome::Added;
    }

    if let Some(worst_index) = self
      .nodes
      .iter()
      .position(|n| n.is_bad())
    {
      self.nodes.remove(worst_index);
      self.nodes.push(node);
      self.sort_by_last_seen();
      self.last_changed = Instant::now();
      return AddOutcome::Replaced;
    }

    self.replacement = Some(node);
    self.last_changed = Instant::now();
    AddOutcome::Full
  }

  pub fn sort_by_last_seen(&mut self) {
    self.nodes.sort_by_key(|n| n.last_seen());
  }

  /// The live member least recently seen — the one the task engine pings when the bucket is
  /// full and a new contact is waiting as a replacement.
  pub fn least_recently_seen(&self) -> Option<&Node> {
    self.nodes.first()
  }

  pub fn take_replacement(&mut self) -> Option<Node> {
    self.replacement.take()
  }

  pub fn drop_replacement(&mut self) {
    self.replacement = None;
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use std::net::Ipv4Addr;

  fn node_with_id(byte: u8) -> Node {
    let mut bytes = [0u8; crate::dht::node_id::ID_LEN];
    bytes[crate::dht::node_id::ID_LEN - 1] = byte;
    Node::new(
      NodeId::from_bytes(bytes),
      SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881),
    )
  }

  #[test]
  fn add_until_full_then_replacement() {
    let mut bucket = Bucket::new(NodeId::ZERO, NodeId::MAX);
    for i in 1..=K as u8 {
      assert_eq!(bucket.add(node_with_id(i)), AddOutcome::Added);
    }
    assert!(bucket.is_full());
    assert_eq!(bucket.add(node_with_id(K as u8 + 1)), AddOutcome::Full);
    assert!(bucket.replacement().is_some());
  }

  #[test]
  fn re_adding_existing_node_updates_it() {
    let mut bucket = Bucket::new(NodeId::ZERO, NodeId::MAX);
    bucket.add(node_with_id(1));
    assert_eq!(bucket.add(node_with_id(1)), AddOutcome::Updated);
    assert_eq!(bucket.len(), 1);
  }

  #[test]
  fn full_bucket_with_a_bad_node_replaces_it() {
    let mut bucket = Bucket::new(NodeId::ZERO, NodeId::MAX);
    for i in 1..=K as u8 {
      bucket.add(node_with_id(i));
    }
    let target = bucket.find_mut(&node_with_id(1).id).unwrap();
    target.mark_failed();
    target.mark_failed();

    let outcome = bucket.add(node_with_id(200));
    assert_eq!(outcome, AddOutcome::Replaced);
    assert!(bucket.find(&node_with_id(1).id).is_none());
    assert!(bucket.find(&node_with_id(200).id).is_some());
  }

  #[test]
  fn health_transitions() {
    let node = node_with_id(1);
    assert_eq!(node.health(), Health::Good);

    let mut failed_twice = node_with_id(2);
    failed_twice.mark_failed();
    failed_twice.mark_failed();
    assert_eq!(failed_twice.health(), Health::Bad);
  }
}
