//! Saves and loads a routing table as a single bencoded file: `{"nodes": <compact contacts>,
//! "self": <node id>}`. Not a database — one read, one write, no incremental journal.

use crate::common::*;
use crate::bencode::{self, Value};
use crate::dht::message::{self, CompactNode};
use crate::dht::node::Node;
use crate::dht::node_id::NodeId;
use crate::dht::routing_table::RoutingTable;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub fn save(table: &RoutingTable, path: &Path) -> Result<()> {
  let nodes: Vec<CompactNode> = table
    .buckets()
    .iter()
    .flat_map(|bucket| bucket.nodes())
    .map(|node| CompactNode {
      id: node.id,
      addr: node.addr,
    })
    .collect();

  let mut dict = BTreeMap::new();
  dict.insert(b"nodes".to_vec(), Value::string(message::encode_compact_nodes(&nodes)));
  dict.insert(b"self".to_vec(), Value::string(table.local_id().as_bytes().to_vec()));

  fs::write(path, Value::Dictionary(dict).encode()).context(error::PersistenceWrite {
    path: path.display().to_string(),
  })
}

/// Loads a previously saved table, inserting each contact via `add_without_notify` so reloading
/// a table at startup doesn't fire a `NodeAdded` notification per saved node.
pub fn load(path: &Path) -> Result<RoutingTable> {
  let bytes = fs::read(path).context(error::PersistenceRead {
    path: path.display().to_string(),
  })?;

  let value = bencode::decode_strict(&bytes)?;
  let dict = value.as_dict().ok_or_else(|| error::ProtocolWrongShape { field: "root" }.build())?;

  let self_id = dict
    .get(b"self".as_ref())
    .and_then(Value::as_bytes)
    .ok_or_else(|| error::ProtocolMissingField { field: "self" }.build())
    .and_then(NodeId::from_slice)?;

  let node_bytes = dict
    .get(b"nodes".as_ref())
    .and_then(Value::as_bytes)
    .ok_or_else(|| error::ProtocolMissingField { field: "nodes" }.build())?;

  let mut table = RoutingTable::new(self_id);
  for contact in message::decode_compact_nodes(node_bytes)? {
    table.add_without_notify(Node::new(contact.id, contact.addr));
  }
  Ok(table)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::Ipv4Addr;

  #[test]
  fn save_then_load_round_trips_the_table() {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("mldht-persistence-test-{}.bin", std::process::id()));

    let local_id = NodeId::random();
    let mut table = RoutingTable::new(local_id);
    for i in 1u8..=5 {
      let mut bytes = [0u8; crate::dht::node_id::ID_LEN];
      bytes[crate::dht::node_id::ID_LEN - 1] = i;
      table.add(Node::new(
        NodeId::from_bytes(bytes),
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881 + u16::from(i)),
      ));
    }

    save(&table, &path).unwrap();
    let loaded = load(&path).unwrap();

    assert_eq!(loaded.local_id(), local_id);
    assert_eq!(loaded.count_nodes(), table.count_nodes());

    let _ = fs::remove_file(&path);
  }

  #[test]
  fn loading_a_missing_file_is_an_error() {
    let path = Path::new("/nonexistent/does-not-exist.bin");
    assert!(load(path).is_err());
  }
}
