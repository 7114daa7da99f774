//! The dynamic tree of buckets that tiles the full 160-bit id space.
//!
//! Callers share this behind a single mutex; a channel-based subscription lets other components
//! learn when a new node is added without polling.

use crate::common::*;
use crate::dht::node::{AddOutcome, Bucket, Node, K};
use crate::dht::node_id::NodeId;

/// A candidate returned by `get_closest`, paired with its XOR distance to the query target so
/// callers can see why it was chosen without recomputing the distance.
#[derive(Clone, Debug)]
pub struct Candidate {
  pub node: Node,
  pub distance: NodeId,
}

/// The result of `RoutingTable::add`. When `outcome` is `AddOutcome::Full`, `contested` names
/// the bucket that refused the insert so the caller can run the ping-to-evict check (§4.D/§4.H):
/// ping that bucket's least-recently-seen live node and promote the waiting replacement on
/// timeout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddReport {
  pub outcome: AddOutcome,
  pub contested: Option<(NodeId, NodeId)>,
}

pub struct RoutingTable {
  local_id: NodeId,
  buckets: Vec<Bucket>,
  subscribers: Vec<mpsc::Sender<NodeId>>,
  loading: bool,
}

impl RoutingTable {
  pub fn new(local_id: NodeId) -> Self {
    RoutingTable {
      local_id,
      buckets: vec![Bucket::new(NodeId::ZERO, {
        // The bucket spanning the whole space is `[0, 2^160)`; we represent the open upper
        // bound with an explicit MAX-plus-one sentinel by treating `max` comparisons as
        // `id <= max_inclusive` only for this one, full-span bucket. Bucket::can_contain uses a
        // strict `<`, so the full-span bucket instead uses `NodeId::MAX` as an *inclusive* max
        // by special-casing it below in `bucket_index_for`.
        NodeId::MAX
      })],
      subscribers: Vec::new(),
      loading: false,
    }
  }

  pub fn local_id(&self) -> NodeId {
    self.local_id
  }

  pub fn subscribe(&mut self) -> mpsc::Receiver<NodeId> {
    let (tx, rx) = mpsc::channel();
    self.subscribers.push(tx);
    rx
  }

  fn notify_added(&self, id: NodeId) {
    if self.loading {
      return;
    }
    for subscriber in &self.subscribers {
      // A dropped receiver just means nobody's listening anymore; ignore the error.
      let _ = subscriber.send(id);
    }
  }

  fn bucket_index_for(&self, id: &NodeId) -> usize {
    self
      .buckets
      .iter()
      .position(|b| b.can_contain(id) || (b.max == NodeId::MAX && *id == NodeId::MAX))
      .expect("buckets always tile the full id space")
  }

  pub fn bucket_count(&self) -> usize {
    self.buckets.len()
  }

  pub fn count_nodes(&self) -> usize {
    self.buckets.iter().map(Bucket::len).sum()
  }

  /// Inserts or refreshes `node`, splitting the bucket containing the local id when it's full.
  pub fn add(&mut self, node: Node) -> AddReport {
    let index = self.bucket_index_for(&node.id);
    let outcome = self.buckets[index].add(node.clone());

    let (outcome, final_index) = if outcome == AddOutcome::Full
      && self.buckets[index].can_contain(&self.local_id)
    {
      if self.split(index) {
        let retry_index = self.bucket_index_for(&node.id);
        (self.buckets[retry_index].add(node.clone()), retry_index)
      } else {
        (outcome, index)
      }
    } else {
      (outcome, index)
    };

    if outcome == AddOutcome::Added {
      self.notify_added(node.id);
    }

    let contested = if outcome == AddOutcome::Full {
      let bucket = &self.buckets[final_index];
      Some((bucket.min, bucket.max))
    } else {
      None
    };

    AddReport { outcome, contested }
  }

  /// Inserts `node` without emitting `NodeAdded` notifications, for bulk-loading a persisted
  /// table.
  pub fn add_without_notify(&mut self, node: Node) -> AddReport {
    self.loading = true;
    let report = self.add(node);
    self.loading = false;
    report
  }

  pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
    let index = self.bucket_index_for(id);
    self.buckets[index].remove(id)
  }

  pub fn find_node(&self, id: &NodeId) -> Option<&Node> {
    let index = self.bucket_index_for(id);
    self.buckets[index].find(id)
  }

  /// Records a successful response from an already-known contact: resets its failure counter
  /// and refreshes `last_seen`. A no-op if `id` isn't in the table (e.g. it was the querier in
  /// a lookup round but hasn't itself been added as a contact yet).
  pub fn mark_responded(&mut self, id: &NodeId) {
    let index = self.bucket_index_for(id);
    if let Some(node) = self.buckets[index].find_mut(id) {
      node.mark_responded();
    }
  }

  /// Records a failed (timed-out or errored) query to an already-known contact, incrementing
  /// its failure counter. After two consecutive failures the contact becomes "bad" and is a
  /// replacement candidate.
  pub fn mark_failed(&mut self, id: &NodeId) {
    let index = self.bucket_index_for(id);
    if let Some(node) = self.buckets[index].find_mut(id) {
      node.mark_failed();
    }
  }

  /// Records the token a contact most recently handed back from a `get_peers` query, so it can
  /// later be used to `announce_peer` to that same contact.
  pub fn set_last_token_received(&mut self, id: &NodeId, token: Vec<u8>) {
    let index = self.bucket_index_for(id);
    if let Some(node) = self.buckets[index].find_mut(id) {
      node.last_token_received = Some(token);
    }
  }

  pub fn bucket_containing(&self, id: &NodeId) -> &Bucket {
    &self.buckets[self.bucket_index_for(id)]
  }

  pub fn bucket_containing_mut(&mut self, id: &NodeId) -> &mut Bucket {
    let index = self.bucket_index_for(id);
    &mut self.buckets[index]
  }

  pub fn buckets(&self) -> &[Bucket] {
    &self.buckets
  }

  pub fn clear(&mut self) {
    self.buckets = vec![Bucket::new(NodeId::ZERO, NodeId::MAX)];
  }

  /// Splits the bucket at `index` into two, redistributing its nodes and replacement by
  /// `can_contain`. Returns `false` (refusing to split) if the bucket's span is already below
  /// `K` — a bucket this narrow cannot be divided any further without becoming pointless.
  fn split(&mut self, index: usize) -> bool {
    let old = &self.buckets[index];
    let span = span_len(&old.min, &old.max);
    if span < K as u64 {
      return false;
    }

    let mid = NodeId::midpoint(&old.min, &old.max);
    if mid <= old.min || mid >= old.max {
      return false;
    }

    let mut lower = Bucket::new(old.min, mid);
    let mut upper = Bucket::new(mid, old.max);

    let old = self.buckets.remove(index);
    for node in old.nodes().iter().cloned() {
      if lower.can_contain(&node.id) {
        lower.add(node);
      } else {
        upper.add(node);
      }
    }
    if let Some(replacement) = old.replacement().cloned() {
      if lower.can_contain(&replacement.id) {
        lower.add(replacement);
      } else {
        upper.add(replacement);
      }
    }

    self.buckets.insert(index, upper);
    self.buckets.insert(index, lower);
    self.buckets.sort_by(|a, b| a.min.cmp(&b.min));
    debug!("split bucket [{}, {}) at {} into two", old.min, old.max, mid);
    true
  }

  /// Up to `K` nodes ordered by ascending XOR distance to `target`, ties broken by ascending
  /// NodeId.
  pub fn get_closest(&self, target: &NodeId) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = self
      .buckets
      .iter()
      .flat_map(Bucket::nodes)
      .map(|node| Candidate {
        node: node.clone(),
        distance: node.id.xor(target),
      })
      .collect();

    candidates.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.node.id.cmp(&b.node.id)));
    candidates.truncate(K);
    candidates
  }

  /// Ranges of buckets whose `last_changed` is older than `after` — candidates for a refresh
  /// lookup against a random id drawn from their own range, the standard way an otherwise-idle
  /// area of the table gets revisited.
  pub fn stale_buckets(&self, after: Duration) -> Vec<(NodeId, NodeId)> {
    self
      .buckets
      .iter()
      .filter(|bucket| bucket.last_changed().elapsed() >= after)
      .map(|bucket| (bucket.min, bucket.max))
      .collect()
  }
}

/// An approximate span length for the split-refusal guard: `min(max - min, u64::MAX)`, which is
/// exact for any bucket this crate will ever actually split (real buckets shrink well below
/// `u64::MAX` wide after a handful of splits near any one area of the space) and safely saturates
/// for the initial full-space bucket.
fn span_len(min: &NodeId, max: &NodeId) -> u64 {
  let min_bytes = min.as_bytes();
  let max_bytes = max.as_bytes();
  let tail = |b: &[u8; 20]| -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&b[12..20]);
    u64::from_be_bytes(out)
  };
  // If the high 12 bytes differ the span exceeds u64::MAX; saturate rather than overflow.
  if min_bytes[..12] != max_bytes[..12] {
    u64::MAX
  } else {
    tail(max_bytes).saturating_sub(tail(min_bytes))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::Ipv4Addr;

  fn id_from_u8(byte: u8) -> NodeId {
    let mut bytes = [0u8; crate::dht::node_id::ID_LEN];
    bytes[crate::dht::node_id::ID_LEN - 1] = byte;
    NodeId::from_bytes(bytes)
  }

  fn node_with_id(byte: u8) -> Node {
    Node::new(id_from_u8(byte), SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881))
  }

  #[test]
  fn add_then_find() {
    let mut table = RoutingTable::new(NodeId::ZERO);
    let n = node_with_id(5);
    assert_eq!(table.add(n.clone()).outcome, AddOutcome::Added);
    assert_eq!(table.find_node(&n.id).unwrap().id, n.id);
    assert_eq!(table.count_nodes(), 1);
  }

  #[test]
  fn bucket_splits_after_k_plus_one_inserts() {
    let mut table = RoutingTable::new(NodeId::ZERO);
    for i in 1u8..=(K as u8 + 1) {
      table.add(node_with_id(i));
    }
    assert!(table.bucket_count() >= 2);
    let containing = table.bucket_containing(&NodeId::ZERO);
    // The bucket holding the local (all-zero) id must now be narrower than the full range.
    assert_ne!(containing.max, NodeId::MAX);
  }

  #[test]
  fn get_closest_returns_k_nodes_sorted_by_distance() {
    let mut table = RoutingTable::new(NodeId::random());
    for _ in 0..100 {
      table.add(Node::new(
        NodeId::random(),
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881),
      ));
    }
    let target = NodeId::random();
    let closest = table.get_closest(&target);
    assert!(closest.len() <= K);
    for pair in closest.windows(2) {
      assert!(pair[0].distance <= pair[1].distance);
    }
  }

  #[test]
  fn never_splits_a_bucket_that_excludes_the_local_id() {
    // Local id at the very top of the space; fill the bucket covering the bottom half, which
    // never contains the local id, with K+1 nodes that are all "bad" except the cap.
    let mut table = RoutingTable::new(NodeId::MAX);
    for i in 1u8..=(K as u8) {
      table.add(node_with_id(i));
    }
    let before = table.bucket_count();
    table.add(node_with_id(K as u8 + 1));
    assert_eq!(table.bucket_count(), before);
  }

  #[test]
  fn notifications_fire_only_on_true_adds() {
    let mut table = RoutingTable::new(NodeId::ZERO);
    let rx = table.subscribe();
    let n = node_with_id(9);
    table.add(n.clone());
    table.add(n); // touch, not an add
    let mut received = Vec::new();
    while let Ok(id) = rx.try_recv() {
      received.push(id);
    }
    assert_eq!(received.len(), 1);
  }

  #[test]
  fn loading_suppresses_notifications() {
    let mut table = RoutingTable::new(NodeId::ZERO);
    let rx = table.subscribe();
    table.add_without_notify(node_with_id(3));
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn mark_failed_twice_makes_a_contact_bad() {
    let mut table = RoutingTable::new(NodeId::ZERO);
    let n = node_with_id(4);
    table.add(n.clone());
    table.mark_failed(&n.id);
    table.mark_failed(&n.id);
    assert!(table.find_node(&n.id).unwrap().is_bad());
  }

  #[test]
  fn mark_responded_resets_a_previously_failed_contact() {
    let mut table = RoutingTable::new(NodeId::ZERO);
    let n = node_with_id(6);
    table.add(n.clone());
    table.mark_failed(&n.id);
    table.mark_responded(&n.id);
    assert_eq!(table.find_node(&n.id).unwrap().failed_queries(), 0);
  }

  #[test]
  fn set_last_token_received_is_retrievable() {
    let mut table = RoutingTable::new(NodeId::ZERO);
    let n = node_with_id(7);
    table.add(n.clone());
    table.set_last_token_received(&n.id, b"tok".to_vec());
    assert_eq!(
      table.find_node(&n.id).unwrap().last_token_received,
      Some(b"tok".to_vec())
    );
  }

  #[test]
  fn stale_buckets_reports_the_untouched_single_bucket() {
    let table = RoutingTable::new(NodeId::ZERO);
    // Freshly created, so "stale" against a zero-length window must still report it.
    let stale = table.stale_buckets(Duration::from_secs(0));
    assert_eq!(stale, vec![(NodeId::ZERO, NodeId::MAX)]);
  }

  #[test]
  fn stale_buckets_excludes_a_recently_touched_bucket() {
    let mut table = RoutingTable::new(NodeId::ZERO);
    table.add(node_with_id(1));
    assert!(table.stale_buckets(Duration::from_secs(60)).is_empty());
  }
}
