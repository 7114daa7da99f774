use mldht::dht::message::{CompactNode, Query, ResponsePayload};
use mldht::dht::node::Node;
use mldht::dht::node_id::{Infohash, NodeId};
use mldht::dht::persistence;
use mldht::dht::routing_table::RoutingTable;
use mldht::dht::rpc::{Inbound, RpcEngine};
use mldht::dht::token::TokenManager;
use mldht::dht::transport::UdpTransport;
use mldht::dht::{task, HARDCODED_BOOTSTRAP_NODES};
use mldht::Error;

use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::{SocketAddrV4, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use structopt::StructOpt;

type Result<T, E = Error> = std::result::Result<T, E>;

const PEER_STORE_TTL: Duration = Duration::from_secs(30 * 60);
const PERSIST_INTERVAL: Duration = Duration::from_secs(60);

#[derive(StructOpt)]
#[structopt(
  name = "mldht-node",
  about = "A Kademlia DHT node compatible with the BitTorrent Mainline DHT (BEP-5)"
)]
struct Options {
  /// UDP endpoint to bind and listen on.
  #[structopt(long, default_value = "0.0.0.0:6881")]
  listen: SocketAddrV4,

  /// 40 hex-character seed for this node's id. A random id is drawn if omitted.
  #[structopt(long)]
  node_id_seed: Option<String>,

  /// Additional bootstrap contacts, as `host:port`. May be given more than once.
  #[structopt(long = "bootstrap")]
  bootstrap_nodes: Vec<String>,

  /// Skip the hardcoded public bootstrap routers and rely only on `--bootstrap` and any
  /// persisted routing table.
  #[structopt(long)]
  no_hardcoded_bootstrap: bool,

  /// How long to wait for a reply before a query is considered timed out.
  #[structopt(long, default_value = "15")]
  rpc_timeout_secs: u64,

  /// Ceiling on requests this node will have outstanding at once.
  #[structopt(long, default_value = "256")]
  max_in_flight: usize,

  /// How often the announce-token secret is rotated.
  #[structopt(long, default_value = "300")]
  token_rotation_secs: u64,

  /// File to load the routing table from at startup and periodically save it to.
  #[structopt(long, parse(from_os_str))]
  routing_table: Option<PathBuf>,
}

/// The announced-peer records this node hands back in response to `get_peers`. Not a named
/// component of the DHT core itself (that's the routing table and the task engine); this is
/// just enough bookkeeping for the serve loop below to answer queries about swarms peers have
/// announced into.
struct PeerStore {
  swarms: Mutex<HashMap<Infohash, Vec<(SocketAddrV4, Instant)>>>,
}

impl PeerStore {
  fn new() -> Self {
    PeerStore {
      swarms: Mutex::new(HashMap::new()),
    }
  }

  fn insert(&self, info_hash: Infohash, addr: SocketAddrV4) {
    let mut swarms = self.swarms.lock().unwrap();
    let peers = swarms.entry(info_hash).or_insert_with(Vec::new);
    peers.retain(|(existing, _)| *existing != addr);
    peers.push((addr, Instant::now()));
  }

  fn get(&self, info_hash: &Infohash) -> Vec<SocketAddrV4> {
    let mut swarms = self.swarms.lock().unwrap();
    if let Some(peers) = swarms.get_mut(info_hash) {
      peers.retain(|(_, seen)| seen.elapsed() < PEER_STORE_TTL);
      peers.iter().map(|(addr, _)| *addr).collect()
    } else {
      Vec::new()
    }
  }
}

fn main() {
  pretty_env_logger::init();
  let options = Options::from_args();
  if let Err(err) = run(options) {
    log::error!("{}", err);
    std::process::exit(1);
  }
}

fn local_id_from_seed(seed: &str) -> Result<NodeId> {
  let bytes = hex_decode(seed)?;
  NodeId::from_slice(&bytes)
}

fn hex_decode(text: &str) -> Result<Vec<u8>> {
  if text.len() % 2 != 0 {
    return Err(mldht::error::Config {
      reason: format!("node id seed `{}` has an odd number of hex digits", text),
    }
    .build());
  }
  (0..text.len())
    .step_by(2)
    .map(|i| {
      u8::from_str_radix(&text[i..i + 2], 16).map_err(|_| {
        mldht::error::Config {
          reason: format!("node id seed `{}` is not valid hex", text),
        }
        .build()
      })
    })
    .collect()
}

fn resolve_bootstrap_contacts(options: &Options) -> Vec<SocketAddrV4> {
  let mut hosts: Vec<&str> = Vec::new();
  if !options.no_hardcoded_bootstrap {
    hosts.extend(HARDCODED_BOOTSTRAP_NODES.iter().copied());
  }
  let extra: Vec<&str> = options.bootstrap_nodes.iter().map(String::as_str).collect();
  hosts.extend(extra);

  let mut contacts = Vec::new();
  for host in hosts {
    match host.to_socket_addrs() {
      Ok(addrs) => {
        for addr in addrs {
          if let std::net::SocketAddr::V4(addr) = addr {
            contacts.push(addr);
            break;
          }
        }
      }
      Err(err) => warn!("could not resolve bootstrap contact {}: {}", host, err),
    }
  }
  contacts
}

fn run(options: Options) -> Result<()> {
  let local_id = match &options.node_id_seed {
    Some(seed) => local_id_from_seed(seed)?,
    None => NodeId::random(),
  };

  let table = Arc::new(Mutex::new(match &options.routing_table {
    Some(path) if path.exists() => match persistence::load(path) {
      Ok(table) => {
        info!("loaded {} nodes from {}", table.count_nodes(), path.display());
        table
      }
      Err(err) => {
        warn!("failed to load routing table from {}: {}; starting fresh", path.display(), err);
        RoutingTable::new(local_id)
      }
    },
    _ => RoutingTable::new(local_id),
  }));

  let transport = UdpTransport::bind(options.listen)?;
  info!("listening on {}", transport.local_addr()?);

  let rpc = RpcEngine::with_tuning(
    transport,
    Duration::from_secs(options.rpc_timeout_secs),
    options.max_in_flight,
  );

  let tokens = TokenManager::with_rotation_period(Duration::from_secs(options.token_rotation_secs));
  tokens.spawn_rotation();

  let peer_store = Arc::new(PeerStore::new());

  if let Some(path) = options.routing_table.clone() {
    spawn_persistence_thread(Arc::clone(&table), path);
  }

  let bootstrap_contacts = resolve_bootstrap_contacts(&options);
  task::bootstrap(&table, &rpc, &bootstrap_contacts);
  task::spawn_bucket_refresher(&table, &rpc);

  serve(table, rpc, tokens, peer_store)
}

fn spawn_persistence_thread(table: Arc<Mutex<RoutingTable>>, path: PathBuf) {
  std::thread::spawn(move || loop {
    std::thread::sleep(PERSIST_INTERVAL);
    let table = table.lock().unwrap();
    if let Err(err) = persistence::save(&table, &path) {
      warn!("failed to save routing table to {}: {}", path.display(), err);
    }
  });
}

fn serve(
  table: Arc<Mutex<RoutingTable>>,
  rpc: Arc<RpcEngine>,
  tokens: Arc<TokenManager>,
  peer_store: Arc<PeerStore>,
) -> Result<()> {
  loop {
    match rpc.poll(Duration::from_secs(1)) {
      Some(Inbound::Query {
        transaction_id,
        query,
        from,
      }) => handle_query(&table, &rpc, &tokens, &peer_store, transaction_id, query, from),
      None => {}
    }
  }
}

fn handle_query(
  table: &Arc<Mutex<RoutingTable>>,
  rpc: &Arc<RpcEngine>,
  tokens: &Arc<TokenManager>,
  peer_store: &Arc<PeerStore>,
  transaction_id: Vec<u8>,
  query: Query,
  from: SocketAddrV4,
) {
  let local_id = table.lock().unwrap().local_id();

  let response = match query {
    Query::Ping { id } => {
      let report = table.lock().unwrap().add(Node::new(id, from));
      task::spawn_replace_or_evict_if_full(table, rpc, &report);
      ResponsePayload {
        id: Some(local_id),
        nodes: Vec::new(),
        values: Vec::new(),
        token: None,
      }
    }
    Query::FindNode { id, target, .. } => {
      let report = table.lock().unwrap().add(Node::new(id, from));
      task::spawn_replace_or_evict_if_full(table, rpc, &report);
      let nodes = table
        .lock()
        .unwrap()
        .get_closest(&target)
        .into_iter()
        .map(|c| CompactNode {
          id: c.node.id,
          addr: c.node.addr,
        })
        .collect();
      ResponsePayload {
        id: Some(local_id),
        nodes,
        values: Vec::new(),
        token: None,
      }
    }
    Query::GetPeers { id, info_hash, .. } => {
      let report = table.lock().unwrap().add(Node::new(id, from));
      task::spawn_replace_or_evict_if_full(table, rpc, &report);
      let token = tokens.generate(from.ip());
      let values = peer_store.get(&info_hash);
      if values.is_empty() {
        let nodes = table
          .lock()
          .unwrap()
          .get_closest(&info_hash.as_node_id())
          .into_iter()
          .map(|c| CompactNode {
            id: c.node.id,
            addr: c.node.addr,
          })
          .collect();
        ResponsePayload {
          id: Some(local_id),
          nodes,
          values: Vec::new(),
          token: Some(token),
        }
      } else {
        ResponsePayload {
          id: Some(local_id),
          nodes: Vec::new(),
          values,
          token: Some(token),
        }
      }
    }
    Query::AnnouncePeer {
      id,
      info_hash,
      port,
      implied_port,
      token,
    } => {
      let report = table.lock().unwrap().add(Node::new(id, from));
      task::spawn_replace_or_evict_if_full(table, rpc, &report);
      if !tokens.verify(from.ip(), &token) {
        let error_message = mldht::dht::message::Message::error(
          transaction_id,
          mldht::dht::message::ERROR_PROTOCOL,
          "bad token",
        );
        if let Err(err) = rpc.reply(from, error_message) {
          debug!("failed to send error reply to {}: {}", from, err);
        }
        return;
      }
      let announced_port = if implied_port { from.port() } else { port };
      peer_store.insert(info_hash, SocketAddrV4::new(*from.ip(), announced_port));
      ResponsePayload {
        id: Some(local_id),
        nodes: Vec::new(),
        values: Vec::new(),
        token: None,
      }
    }
  };

  let message = mldht::dht::message::Message::response(transaction_id, response);
  if let Err(err) = rpc.reply(from, message) {
    debug!("failed to reply to {}: {}", from, err);
  }
}
