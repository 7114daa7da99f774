//! Iterative lookups and the specialized tasks built on top of one: bootstrap, announce, the
//! ping-to-evict check run when a bucket reports full, and the periodic refresh of buckets that
//! have gone quiet.

use crate::common::*;
use crate::dht::message::{Query, Want};
use crate::dht::node::{AddOutcome, Node};
use crate::dht::node_id::{Infohash, NodeId};
use crate::dht::routing_table::{AddReport, RoutingTable};
use crate::dht::rpc::RpcEngine;
use crate::dht::token::TokenManager;

/// Lookup concurrency width: at most this many RPCs outstanding at once within one task.
pub const ALPHA: usize = 3;

/// Hard ceiling on the number of RPCs a single lookup will issue, so a lookup against a
/// pathological or adversarial swarm still terminates.
pub const MAX_QUERIES_PER_LOOKUP: usize = 200;

/// How many candidates the lookup keeps under consideration at once. Wider than `K` so a late
/// better candidate still has room to unseat an early, worse one.
const CANDIDATE_POOL: usize = 4 * crate::dht::node::K;

/// How long the bootstrap task waits for the routing table to grow beyond a single bucket
/// before giving up anyway.
pub const BOOTSTRAP_TIME_CAP: Duration = Duration::from_secs(30);

/// How long a bucket can go untouched before `refresh_stale_buckets` revisits it with a
/// `find_node` lookup against a random id drawn from its own range — the same 15-minute horizon
/// after which a single contact is no longer "good".
pub const BUCKET_REFRESH_AFTER: Duration = crate::dht::node::QUESTIONABLE_AFTER;

#[derive(Clone, Copy, Eq, PartialEq)]
enum Status {
  Unqueried,
  Queried,
  Failed,
}

struct Candidate {
  id: NodeId,
  addr: SocketAddrV4,
  distance: NodeId,
  status: Status,
}

enum Target {
  FindNode(NodeId),
  GetPeers(Infohash),
}

impl Target {
  fn as_node_id(&self) -> NodeId {
    match self {
      Target::FindNode(id) => *id,
      Target::GetPeers(info_hash) => info_hash.as_node_id(),
    }
  }

  fn query(&self, local_id: NodeId) -> Query {
    match self {
      Target::FindNode(target) => Query::FindNode {
        id: local_id,
        target: *target,
        want: None,
      },
      Target::GetPeers(info_hash) => Query::GetPeers {
        id: local_id,
        info_hash: *info_hash,
        want: None,
      },
    }
  }
}

/// What an iterative lookup produced: the K closest live nodes it found, any peer values
/// returned (only non-empty for a `get_peers` lookup against an infohash with announced
/// peers), and the tokens handed back by each responder, needed to `announce_peer` afterward.
pub struct LookupOutcome {
  pub closest: Vec<(NodeId, SocketAddrV4)>,
  pub values: Vec<SocketAddrV4>,
  pub tokens: HashMap<NodeId, Vec<u8>>,
}

enum RoundReply {
  Success {
    id: NodeId,
    addr: SocketAddrV4,
    nodes: Vec<(NodeId, SocketAddrV4)>,
    values: Vec<SocketAddrV4>,
    token: Option<Vec<u8>>,
  },
  Failure {
    id: NodeId,
    addr: SocketAddrV4,
  },
}

fn run_lookup(
  table: &Arc<Mutex<RoutingTable>>,
  rpc: &Arc<RpcEngine>,
  target: Target,
) -> LookupOutcome {
  let local_id = table.lock().unwrap().local_id();
  let target_id = target.as_node_id();

  let mut candidates: Vec<Candidate> = table
    .lock()
    .unwrap()
    .get_closest(&target_id)
    .into_iter()
    .map(|c| Candidate {
      id: c.node.id,
      addr: c.node.addr,
      distance: c.distance,
      status: Status::Unqueried,
    })
    .collect();

  let mut values = Vec::new();
  let mut tokens = HashMap::new();
  let mut queries_issued = 0;

  loop {
    if queries_issued >= MAX_QUERIES_PER_LOOKUP {
      debug!("lookup for {} hit the query cap, stopping", target_id);
      break;
    }

    let k_closest_all_succeeded = {
      let mut sorted: Vec<&Candidate> = candidates.iter().collect();
      sorted.sort_by_key(|c| c.distance);
      let k = sorted.len().min(crate::dht::node::K);
      k > 0 && sorted[..k].iter().all(|c| c.status == Status::Queried)
    };
    if k_closest_all_succeeded {
      break;
    }

    let round: Vec<usize> = candidates
      .iter()
      .enumerate()
      .filter(|(_, c)| c.status == Status::Unqueried)
      .map(|(i, _)| i)
      .take(ALPHA)
      .collect();

    if round.is_empty() {
      break;
    }

    let (tx, rx) = mpsc::channel();
    for &index in &round {
      let id = candidates[index].id;
      let addr = candidates[index].addr;
      let rpc = Arc::clone(rpc);
      let query = target.query(local_id);
      let tx = tx.clone();
      thread::spawn(move || {
        let reply = match rpc.request(addr, query) {
          Ok(response) => RoundReply::Success {
            id,
            addr,
            nodes: response.nodes.into_iter().map(|n| (n.id, n.addr)).collect(),
            values: response.values,
            token: response.token,
          },
          Err(err) => {
            trace!("lookup query to {} failed: {}", addr, err);
            RoundReply::Failure { id, addr }
          }
        };
        let _ = tx.send(reply);
      });
      queries_issued += 1;
    }
    drop(tx);

    let mut discovered = Vec::new();
    for _ in 0..round.len() {
      match rx.recv() {
        Ok(RoundReply::Success {
          id,
          nodes,
          values: new_values,
          token,
          ..
        }) => {
          if let Some(candidate) = candidates.iter_mut().find(|c| c.id == id) {
            candidate.status = Status::Queried;
          }
          {
            let mut table = table.lock().unwrap();
            table.mark_responded(&id);
            if let Some(token) = &token {
              table.set_last_token_received(&id, token.clone());
            }
          }
          if let Some(token) = token {
            tokens.insert(id, token);
          }
          values.extend(new_values);
          discovered.extend(nodes);
        }
        Ok(RoundReply::Failure { id, .. }) => {
          if let Some(candidate) = candidates.iter_mut().find(|c| c.id == id) {
            candidate.status = Status::Failed;
          }
          table.lock().unwrap().mark_failed(&id);
        }
        Err(_) => break,
      }
    }

    for (id, addr) in discovered {
      if candidates.iter().any(|c| c.id == id) {
        continue;
      }
      candidates.push(Candidate {
        id,
        addr,
        distance: id.xor(&target_id),
        status: Status::Unqueried,
      });
      let node = Node::new(id, addr);
      let report = table.lock().unwrap().add(node);
      if report.outcome == AddOutcome::Added {
        debug!("lookup for {} discovered new node {}", target_id, id);
      }
      spawn_replace_or_evict_if_full(table, rpc, &report);
    }

    candidates.sort_by_key(|c| c.distance);
    candidates.truncate(CANDIDATE_POOL);
  }

  candidates.sort_by_key(|c| c.distance);
  let closest = candidates
    .into_iter()
    .filter(|c| c.status == Status::Queried)
    .take(crate::dht::node::K)
    .map(|c| (c.id, c.addr))
    .collect();

  LookupOutcome {
    closest,
    values,
    tokens,
  }
}

pub fn find_node(table: &Arc<Mutex<RoutingTable>>, rpc: &Arc<RpcEngine>, target: NodeId) -> LookupOutcome {
  run_lookup(table, rpc, Target::FindNode(target))
}

pub fn get_peers(
  table: &Arc<Mutex<RoutingTable>>,
  rpc: &Arc<RpcEngine>,
  info_hash: Infohash,
) -> LookupOutcome {
  run_lookup(table, rpc, Target::GetPeers(info_hash))
}

/// Seeds the routing table from `bootstrap_nodes` and runs a `find_node` lookup against the
/// local node's own id, which is the standard way to populate a fresh routing table. Succeeds
/// (in the sense of returning) once the table has grown past its initial single bucket, or once
/// `BOOTSTRAP_TIME_CAP` elapses, whichever comes first.
pub fn bootstrap(table: &Arc<Mutex<RoutingTable>>, rpc: &Arc<RpcEngine>, bootstrap_nodes: &[SocketAddrV4]) {
  let local_id = table.lock().unwrap().local_id();

  for &addr in bootstrap_nodes {
    match rpc.request(addr, Query::FindNode {
      id: local_id,
      target: local_id,
      want: Some(Want::V4),
    }) {
      Ok(response) => {
        if let Some(id) = response.id {
          let report = table.lock().unwrap().add(Node::new(id, addr));
          spawn_replace_or_evict_if_full(table, rpc, &report);
        }
        for node in response.nodes {
          let report = table.lock().unwrap().add(Node::new(node.id, node.addr));
          spawn_replace_or_evict_if_full(table, rpc, &report);
        }
      }
      Err(err) => debug!("bootstrap contact {} did not respond: {}", addr, err),
    }
  }

  let deadline = Instant::now() + BOOTSTRAP_TIME_CAP;
  while table.lock().unwrap().count_nodes() > 0
    && table.lock().unwrap().bucket_count() <= 1
    && Instant::now() < deadline
  {
    run_lookup(table, rpc, Target::FindNode(local_id));
  }

  if table.lock().unwrap().bucket_count() <= 1 {
    warn!("bootstrap timed out after {:?} with only one bucket", BOOTSTRAP_TIME_CAP);
  } else {
    info!("bootstrap complete, routing table now has {} buckets", table.lock().unwrap().bucket_count());
  }
}

/// Runs a `get_peers` lookup for `info_hash`, then announces this node (on `port`) to the K
/// closest responders that handed back a token. Returns the peer values discovered during the
/// `get_peers` phase.
pub fn announce(
  table: &Arc<Mutex<RoutingTable>>,
  rpc: &Arc<RpcEngine>,
  info_hash: Infohash,
  port: u16,
) -> Vec<SocketAddrV4> {
  let outcome = get_peers(table, rpc, info_hash);
  let local_id = table.lock().unwrap().local_id();

  let (tx, rx) = mpsc::channel();
  let mut sent = 0;
  for (id, addr) in &outcome.closest {
    let token = match outcome.tokens.get(id) {
      Some(token) => token.clone(),
      None => continue,
    };
    let rpc = Arc::clone(rpc);
    let id = *id;
    let addr = *addr;
    let tx = tx.clone();
    thread::spawn(move || {
      let result = rpc.request(
        addr,
        Query::AnnouncePeer {
          id: local_id,
          info_hash,
          port,
          implied_port: false,
          token,
        },
      );
      let _ = tx.send((id, addr, result));
    });
    sent += 1;
  }
  drop(tx);

  for _ in 0..sent {
    if let Ok((id, addr, result)) = rx.recv() {
      let mut table = table.lock().unwrap();
      match result {
        Ok(_) => table.mark_responded(&id),
        Err(err) => {
          debug!("announce_peer to {} failed: {}", addr, err);
          table.mark_failed(&id);
        }
      }
    }
  }

  outcome.values
}

/// Checks an `AddReport` for a contested (full) bucket and, if found, runs `replace_or_evict`
/// against it in the background. Every caller of `RoutingTable::add` that can reach a live
/// `RpcEngine` — the query handler, a lookup round, bootstrap — routes its report through this
/// so a bucket that's stashed a replacement actually gets a chance to promote it, rather than
/// waiting forever for someone to notice.
pub fn spawn_replace_or_evict_if_full(table: &Arc<Mutex<RoutingTable>>, rpc: &Arc<RpcEngine>, report: &AddReport) {
  if let Some((min, _max)) = report.contested {
    let table = Arc::clone(table);
    let rpc = Arc::clone(rpc);
    thread::spawn(move || replace_or_evict(&table, &rpc, min));
  }
}

/// Pings the live node least recently seen in the bucket that covers `contested_id`. On
/// timeout, evicts it in favor of the bucket's waiting replacement; on a response, the
/// replacement is dropped and the existing node's liveness is simply refreshed.
pub fn replace_or_evict(table: &Arc<Mutex<RoutingTable>>, rpc: &Arc<RpcEngine>, contested_id: NodeId) {
  let local_id = table.lock().unwrap().local_id();
  let (candidate_id, candidate_addr) = {
    let table = table.lock().unwrap();
    let bucket = table.bucket_containing(&contested_id);
    match bucket.least_recently_seen() {
      Some(node) => (node.id, node.addr),
      None => return,
    }
  };

  match rpc.request(candidate_addr, Query::Ping { id: local_id }) {
    Ok(_) => {
      let mut table = table.lock().unwrap();
      let bucket = table.bucket_containing_mut(&contested_id);
      if let Some(node) = bucket.find_mut(&candidate_id) {
        node.mark_responded();
      }
      bucket.drop_replacement();
    }
    Err(_) => {
      let mut table = table.lock().unwrap();
      let bucket = table.bucket_containing_mut(&contested_id);
      if let Some(replacement) = bucket.take_replacement() {
        bucket.remove(&candidate_id);
        bucket.add(replacement);
      }
    }
  }
}

/// Runs one `find_node` lookup per bucket whose `last_changed` exceeds `BUCKET_REFRESH_AFTER`,
/// targeting a random id drawn from that bucket's own range via `NodeId::random_in_range`. This
/// is how an otherwise-idle area of the table stays populated: nothing else touches a bucket that
/// neither gains a contact nor is queried against.
pub fn refresh_stale_buckets(table: &Arc<Mutex<RoutingTable>>, rpc: &Arc<RpcEngine>) {
  let stale = table.lock().unwrap().stale_buckets(BUCKET_REFRESH_AFTER);
  for (min, max) in stale {
    let target = NodeId::random_in_range(&min, &max);
    debug!("refreshing stale bucket [{}, {}) via lookup for {}", min, max, target);
    run_lookup(table, rpc, Target::FindNode(target));
  }
}

/// Spawns a background thread that calls `refresh_stale_buckets` on a fixed interval for the
/// life of the process. The interval is shorter than `BUCKET_REFRESH_AFTER` so a bucket that
/// just crossed the staleness threshold isn't left waiting for a whole extra period.
pub fn spawn_bucket_refresher(table: &Arc<Mutex<RoutingTable>>, rpc: &Arc<RpcEngine>) {
  let table = Arc::clone(table);
  let rpc = Arc::clone(rpc);
  thread::spawn(move || loop {
    thread::sleep(BUCKET_REFRESH_AFTER / 4);
    refresh_stale_buckets(&table, &rpc);
  });
}

/// Rotates the token manager's secret and drains any routing-table subscription into calls to
/// `replace_or_evict` whenever a bucket's fullness is reported by the caller's own poll loop.
/// Exposed here purely so `main.rs` has one call to make at startup; the actual rotation timer
/// lives on `TokenManager` itself.
pub fn spawn_token_rotation(tokens: &Arc<TokenManager>) {
  tokens.spawn_rotation();
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dht::transport::UdpTransport;

  fn loopback(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)
  }

  fn engine_with_table() -> (Arc<Mutex<RoutingTable>>, Arc<RpcEngine>) {
    let transport = UdpTransport::bind(loopback(0)).unwrap();
    let id = NodeId::random();
    (
      Arc::new(Mutex::new(RoutingTable::new(id))),
      RpcEngine::new(transport),
    )
  }

  #[test]
  fn find_node_against_an_empty_table_returns_immediately() {
    let (table, rpc) = engine_with_table();
    let outcome = find_node(&table, &rpc, NodeId::random());
    assert!(outcome.closest.is_empty());
  }

  #[test]
  fn refresh_stale_buckets_is_a_no_op_on_a_freshly_created_table() {
    let (table, rpc) = engine_with_table();
    // `last_changed` was just set, so nothing has crossed `BUCKET_REFRESH_AFTER` yet: this must
    // not issue any RPCs or otherwise change the table.
    let before = table.lock().unwrap().bucket_count();
    refresh_stale_buckets(&table, &rpc);
    assert_eq!(table.lock().unwrap().bucket_count(), before);
    assert_eq!(rpc.in_flight(), 0);
  }

  #[test]
  fn bootstrap_against_unreachable_nodes_does_not_hang_forever() {
    let (table, rpc) = engine_with_table();
    let unreachable = vec![loopback(1)];
    let started = Instant::now();
    bootstrap(&table, &rpc, &unreachable);
    // The single unresponsive contact fails immediately (connection refused on loopback), and
    // the table never grows past one bucket, so this returns well under the full time cap.
    assert!(started.elapsed() < BOOTSTRAP_TIME_CAP);
  }

  fn id_from_u8(byte: u8) -> NodeId {
    let mut bytes = [0u8; crate::dht::node_id::ID_LEN];
    bytes[crate::dht::node_id::ID_LEN - 1] = byte;
    NodeId::from_bytes(bytes)
  }

  /// §8 "TimeoutEvict": fill a bucket so a new insert is stashed as a replacement, then ping
  /// the least-recently-seen member with a dropped datagram (an address nothing is bound to);
  /// once that ping times out, the replacement must be promoted into the bucket.
  #[test]
  fn timeout_evict_promotes_the_replacement() {
    // Local id at the top of the space, so the bucket covering small ids never contains it and
    // reports `Full` (stashing a replacement) instead of splitting.
    let table = Arc::new(Mutex::new(RoutingTable::new(NodeId::MAX)));
    {
      let mut table = table.lock().unwrap();
      for i in 1u8..=(crate::dht::node::K as u8) {
        table.add(Node::new(id_from_u8(i), loopback(40_000 + u16::from(i))));
      }
    }

    let report = table
      .lock()
      .unwrap()
      .add(Node::new(id_from_u8(200), loopback(40_200)));
    assert_eq!(report.outcome, AddOutcome::Full);
    let (min, _max) = report.contested.expect("a full bucket reports its contested range");

    let rpc_transport = UdpTransport::bind(loopback(0)).unwrap();
    let rpc = RpcEngine::with_tuning(rpc_transport, Duration::from_millis(50), 16);

    replace_or_evict(&table, &rpc, min);

    let table = table.lock().unwrap();
    let bucket = table.bucket_containing(&min);
    assert!(
      bucket.find(&id_from_u8(1)).is_none(),
      "the least-recently-seen node should have been evicted"
    );
    assert!(
      bucket.find(&id_from_u8(200)).is_some(),
      "the waiting replacement should have been promoted"
    );
    assert!(bucket.replacement().is_none());
  }

  /// §8 "FindPeersAnnounce": two nodes sharing a bootstrap contact — A runs `get_peers` for an
  /// infohash that B already has peers for, and A's lookup must surface at least one of them.
  #[test]
  fn find_peers_announce_discovers_an_announced_peer() {
    use crate::dht::message::{Message, ResponsePayload};

    let info_hash = Infohash::from_bytes([0x42u8; crate::dht::node_id::ID_LEN]);
    let announced_peer = loopback(50_099);
    let b_id = NodeId::random();

    let b_transport = UdpTransport::bind(loopback(0)).unwrap();
    let b_addr = b_transport.local_addr().unwrap();
    let b_rpc = RpcEngine::new(b_transport);

    let responder_rpc = Arc::clone(&b_rpc);
    let responder = thread::spawn(move || loop {
      match responder_rpc.poll(Duration::from_secs(5)) {
        Some(Inbound::Query {
          transaction_id,
          query: Query::GetPeers { info_hash: queried, .. },
          from,
        }) if queried == info_hash => {
          let response = Message::response(
            transaction_id,
            ResponsePayload {
              id: Some(b_id),
              nodes: Vec::new(),
              values: vec![announced_peer],
              token: Some(b"tok".to_vec()),
            },
          );
          let _ = responder_rpc.reply(from, response);
          return;
        }
        Some(Inbound::Query { transaction_id, from, .. }) => {
          let response = Message::response(transaction_id, ResponsePayload {
            id: Some(b_id),
            ..Default::default()
          });
          let _ = responder_rpc.reply(from, response);
        }
        None => continue,
      }
    });

    let (a_table, a_rpc) = engine_with_table();
    a_table.lock().unwrap().add(Node::new(b_id, b_addr));

    let outcome = get_peers(&a_table, &a_rpc, info_hash);
    responder.join().unwrap();

    assert!(
      outcome.values.contains(&announced_peer),
      "A's get_peers lookup should have surfaced B's announced peer"
    );
  }
}
