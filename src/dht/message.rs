//! KRPC message encoding and decoding.
//!
//! A KRPC message is a bencoded dictionary with a transaction id `t`, a message type `y`
//! (`q`/`r`/`e`), and a type-specific payload. This module only knows how to translate between
//! that wire shape and the typed `Message`/`Query`/`ResponsePayload` structs below; it has no
//! opinion about sockets, retries, or pending transactions.

use crate::common::*;
use crate::bencode::{self, Value};
use crate::dht::node_id::{Infohash, NodeId, ID_LEN};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::collections::BTreeMap;

pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_SERVER: i64 = 202;
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_METHOD_UNKNOWN: i64 = 204;

/// A decoded `nodes`/`nodes6` entry: a contact's id and address, compact-encoded together.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompactNode {
  pub id: NodeId,
  pub addr: SocketAddrV4,
}

/// Which address families a `find_node`/`get_peers` querier is interested in. An empty `want`
/// means "whatever address family this message arrived over", which in this IPv4-only node is
/// always `V4`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Want {
  V4,
  V6,
  Both,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Query {
  Ping {
    id: NodeId,
  },
  FindNode {
    id: NodeId,
    target: NodeId,
    want: Option<Want>,
  },
  GetPeers {
    id: NodeId,
    info_hash: Infohash,
    want: Option<Want>,
  },
  AnnouncePeer {
    id: NodeId,
    info_hash: Infohash,
    port: u16,
    implied_port: bool,
    token: Vec<u8>,
  },
}

impl Query {
  fn method_name(&self) -> &'static str {
    match self {
      Query::Ping { .. } => "ping",
      Query::FindNode { .. } => "find_node",
      Query::GetPeers { .. } => "get_peers",
      Query::AnnouncePeer { .. } => "announce_peer",
    }
  }

  fn querier_id(&self) -> NodeId {
    match self {
      Query::Ping { id }
      | Query::FindNode { id, .. }
      | Query::GetPeers { id, .. }
      | Query::AnnouncePeer { id, .. } => *id,
    }
  }
}

/// The payload of a `y = r` response. KRPC responses don't name the query they answer — a
/// caller must correlate by transaction id and already know what fields to expect.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct ResponsePayload {
  pub id: Option<NodeId>,
  pub nodes: Vec<CompactNode>,
  pub values: Vec<SocketAddrV4>,
  pub token: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KrpcError {
  pub code: i64,
  pub message: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Body {
  Query(Query),
  Response(ResponsePayload),
  Error(KrpcError),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
  pub transaction_id: Vec<u8>,
  pub body: Body,
  /// The `v` key: an opaque client version string, included on outgoing messages and ignored
  /// on incoming ones beyond logging.
  pub version: Option<Vec<u8>>,
}

impl Message {
  pub fn query(transaction_id: Vec<u8>, query: Query) -> Self {
    Message {
      transaction_id,
      body: Body::Query(query),
      version: None,
    }
  }

  pub fn response(transaction_id: Vec<u8>, response: ResponsePayload) -> Self {
    Message {
      transaction_id,
      body: Body::Response(response),
      version: None,
    }
  }

  pub fn error(transaction_id: Vec<u8>, code: i64, message: impl Into<String>) -> Self {
    Message {
      transaction_id,
      body: Body::Error(KrpcError {
        code,
        message: message.into(),
      }),
      version: None,
    }
  }

  pub fn with_version(mut self, version: Vec<u8>) -> Self {
    self.version = Some(version);
    self
  }

  pub fn encode(&self) -> Vec<u8> {
    self.to_value().encode()
  }

  /// Parses a datagram off the wire. Decoding uses `Mode::Lenient`: peers in the wild emit
  /// dictionaries with out-of-order or duplicate keys often enough that rejecting them outright
  /// would make this node needlessly fragile.
  pub fn decode(datagram: &[u8]) -> Result<Self> {
    let value = bencode::decode(datagram, bencode::Mode::Lenient)?;
    Self::from_value(&value)
  }

  fn to_value(&self) -> Value {
    let mut top = BTreeMap::new();
    top.insert(b"t".to_vec(), Value::string(self.transaction_id.clone()));
    if let Some(version) = &self.version {
      top.insert(b"v".to_vec(), Value::string(version.clone()));
    }

    match &self.body {
      Body::Query(query) => {
        top.insert(b"y".to_vec(), Value::string(b"q".to_vec()));
        top.insert(b"q".to_vec(), Value::string(query.method_name().as_bytes().to_vec()));
        top.insert(b"a".to_vec(), Value::Dictionary(encode_query_args(query)));
      }
      Body::Response(response) => {
        top.insert(b"y".to_vec(), Value::string(b"r".to_vec()));
        top.insert(b"r".to_vec(), Value::Dictionary(encode_response(response)));
      }
      Body::Error(err) => {
        top.insert(b"y".to_vec(), Value::string(b"e".to_vec()));
        top.insert(
          b"e".to_vec(),
          Value::List(vec![
            Value::integer(BigInt::from(err.code)),
            Value::string(err.message.clone().into_bytes()),
          ]),
        );
      }
    }

    Value::Dictionary(top)
  }

  fn from_value(value: &Value) -> Result<Self> {
    let top = value.as_dict().ok_or_else(|| {
      error::ProtocolWrongShape { field: "message" }.build()
    })?;

    let transaction_id = field_bytes(top, "t")?.to_vec();
    let version = top.get(b"v".as_ref()).and_then(Value::as_bytes).map(<[u8]>::to_vec);
    let y = field_bytes(top, "y")?;

    let body = match y {
      b"q" => Body::Query(decode_query(top)?),
      b"r" => Body::Response(decode_response(field_dict(top, "r")?)?),
      b"e" => Body::Error(decode_error(field_list(top, "e")?)?),
      other => {
        return error::ProtocolUnknownType {
          y: String::from_utf8_lossy(other).into_owned(),
        }
        .fail()
      }
    };

    Ok(Message {
      transaction_id,
      body,
      version,
    })
  }
}

fn field<'a>(dict: &'a BTreeMap<Vec<u8>, Value>, key: &'static str) -> Result<&'a Value> {
  dict
    .get(key.as_bytes())
    .ok_or(error::ProtocolMissingField { field: key }.build())
}

fn field_bytes<'a>(dict: &'a BTreeMap<Vec<u8>, Value>, key: &'static str) -> Result<&'a [u8]> {
  field(dict, key)?
    .as_bytes()
    .ok_or(error::ProtocolWrongShape { field: key }.build())
}

fn field_dict<'a>(
  dict: &'a BTreeMap<Vec<u8>, Value>,
  key: &'static str,
) -> Result<&'a BTreeMap<Vec<u8>, Value>> {
  field(dict, key)?
    .as_dict()
    .ok_or(error::ProtocolWrongShape { field: key }.build())
}

fn field_list<'a>(dict: &'a BTreeMap<Vec<u8>, Value>, key: &'static str) -> Result<&'a [Value]> {
  field(dict, key)?
    .as_list()
    .ok_or(error::ProtocolWrongShape { field: key }.build())
}

fn field_id(dict: &BTreeMap<Vec<u8>, Value>, key: &'static str) -> Result<NodeId> {
  NodeId::from_slice(field_bytes(dict, key)?)
}

fn field_port(dict: &BTreeMap<Vec<u8>, Value>, key: &'static str) -> Result<u16> {
  let n = field(dict, key)?
    .as_integer()
    .ok_or(error::ProtocolWrongShape { field: key }.build())?;
  n.to_u16().ok_or(error::ProtocolWrongShape { field: key }.build())
}

fn decode_want(dict: &BTreeMap<Vec<u8>, Value>) -> Option<Want> {
  let entries = dict.get(b"want".as_ref())?.as_list()?;
  let mut wants_v4 = false;
  let mut wants_v6 = false;
  for entry in entries {
    match entry.as_bytes() {
      Some(b"n4") => wants_v4 = true,
      Some(b"n6") => wants_v6 = true,
      _ => {}
    }
  }
  match (wants_v4, wants_v6) {
    (true, true) => Some(Want::Both),
    (true, false) => Some(Want::V4),
    (false, true) => Some(Want::V6),
    (false, false) => None,
  }
}

fn encode_want(args: &mut BTreeMap<Vec<u8>, Value>, want: Option<Want>) {
  let entries: Vec<Value> = match want {
    None => return,
    Some(Want::V4) => vec![Value::string(b"n4".to_vec())],
    Some(Want::V6) => vec![Value::string(b"n6".to_vec())],
    Some(Want::Both) => vec![Value::string(b"n4".to_vec()), Value::string(b"n6".to_vec())],
  };
  args.insert(b"want".to_vec(), Value::List(entries));
}

fn decode_query(top: &BTreeMap<Vec<u8>, Value>) -> Result<Query> {
  let method = field_bytes(top, "q")?.to_vec();
  let args = field_dict(top, "a")?;
  let id = field_id(args, "id")?;

  match method.as_slice() {
    b"ping" => Ok(Query::Ping { id }),
    b"find_node" => Ok(Query::FindNode {
      id,
      target: field_id(args, "target")?,
      want: decode_want(args),
    }),
    b"get_peers" => Ok(Query::GetPeers {
      id,
      info_hash: Infohash::from_bytes(*field_id(args, "info_hash")?.as_bytes()),
      want: decode_want(args),
    }),
    b"announce_peer" => {
      let implied_port = args
        .get(b"implied_port".as_ref())
        .and_then(Value::as_integer)
        .map_or(false, |n| *n != BigInt::from(0));
      let port = if implied_port {
        0
      } else {
        field_port(args, "port")?
      };
      Ok(Query::AnnouncePeer {
        id,
        info_hash: Infohash::from_bytes(*field_id(args, "info_hash")?.as_bytes()),
        port,
        implied_port,
        token: field_bytes(args, "token")?.to_vec(),
      })
    }
    _ => error::ProtocolUnknownMethod {
      method: String::from_utf8_lossy(&method).into_owned(),
    }
    .fail(),
  }
}

fn encode_query_args(query: &Query) -> BTreeMap<Vec<u8>, Value> {
  let mut args = BTreeMap::new();
  args.insert(b"id".to_vec(), Value::string(query.querier_id().as_bytes().to_vec()));

  match query {
    Query::Ping { .. } => {}
    Query::FindNode { target, want, .. } => {
      args.insert(b"target".to_vec(), Value::string(target.as_bytes().to_vec()));
      encode_want(&mut args, *want);
    }
    Query::GetPeers { info_hash, want, .. } => {
      args.insert(b"info_hash".to_vec(), Value::string(info_hash.as_bytes().to_vec()));
      encode_want(&mut args, *want);
    }
    Query::AnnouncePeer {
      info_hash,
      port,
      implied_port,
      token,
      ..
    } => {
      args.insert(b"info_hash".to_vec(), Value::string(info_hash.as_bytes().to_vec()));
      args.insert(b"port".to_vec(), Value::integer(BigInt::from(*port)));
      if *implied_port {
        args.insert(b"implied_port".to_vec(), Value::integer(BigInt::from(1)));
      }
      args.insert(b"token".to_vec(), Value::string(token.clone()));
    }
  }

  args
}

fn decode_response(dict: &BTreeMap<Vec<u8>, Value>) -> Result<ResponsePayload> {
  let id = match dict.get(b"id".as_ref()) {
    Some(value) => Some(NodeId::from_slice(
      value.as_bytes().ok_or(error::ProtocolWrongShape { field: "id" }.build())?,
    )?),
    None => None,
  };

  let nodes = match dict.get(b"nodes".as_ref()) {
    Some(value) => decode_compact_nodes(
      value.as_bytes().ok_or(error::ProtocolWrongShape { field: "nodes" }.build())?,
    )?,
    None => Vec::new(),
  };

  let values = match dict.get(b"values".as_ref()) {
    Some(value) => {
      let list = value.as_list().ok_or(error::ProtocolWrongShape { field: "values" }.build())?;
      let mut out = Vec::with_capacity(list.len());
      for entry in list {
        let bytes = entry
          .as_bytes()
          .ok_or(error::ProtocolWrongShape { field: "values" }.build())?;
        out.push(decode_compact_peer(bytes)?);
      }
      out
    }
    None => Vec::new(),
  };

  let token = dict.get(b"token".as_ref()).and_then(Value::as_bytes).map(<[u8]>::to_vec);

  Ok(ResponsePayload {
    id,
    nodes,
    values,
    token,
  })
}

fn encode_response(response: &ResponsePayload) -> BTreeMap<Vec<u8>, Value> {
  let mut dict = BTreeMap::new();
  if let Some(id) = response.id {
    dict.insert(b"id".to_vec(), Value::string(id.as_bytes().to_vec()));
  }
  if !response.nodes.is_empty() {
    dict.insert(b"nodes".to_vec(), Value::string(encode_compact_nodes(&response.nodes)));
  }
  if !response.values.is_empty() {
    let list = response
      .values
      .iter()
      .map(|addr| Value::string(encode_compact_peer(addr)))
      .collect();
    dict.insert(b"values".to_vec(), Value::List(list));
  }
  if let Some(token) = &response.token {
    dict.insert(b"token".to_vec(), Value::string(token.clone()));
  }
  dict
}

fn decode_error(list: &[Value]) -> Result<KrpcError> {
  if list.len() < 2 {
    return error::ProtocolWrongShape { field: "e" }.fail();
  }
  let code = list[0]
    .as_integer()
    .and_then(ToPrimitive::to_i64)
    .ok_or(error::ProtocolWrongShape { field: "e" }.build())?;
  let message = list[1]
    .as_bytes()
    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    .ok_or(error::ProtocolWrongShape { field: "e" }.build())?;
  Ok(KrpcError { code, message })
}

/// Compact node info: `ID_LEN` bytes of id, 4 bytes of big-endian IPv4 address, 2 bytes of
/// big-endian port, repeated back to back.
pub fn encode_compact_nodes(nodes: &[CompactNode]) -> Vec<u8> {
  let mut out = Vec::with_capacity(nodes.len() * (ID_LEN + 6));
  for node in nodes {
    out.extend_from_slice(node.id.as_bytes());
    out.extend_from_slice(&node.addr.ip().octets());
    out.extend_from_slice(&node.addr.port().to_be_bytes());
  }
  out
}

pub fn decode_compact_nodes(bytes: &[u8]) -> Result<Vec<CompactNode>> {
  const ENTRY_LEN: usize = ID_LEN + 6;
  if bytes.len() % ENTRY_LEN != 0 {
    return error::ProtocolWrongShape { field: "nodes" }.fail();
  }
  bytes
    .chunks_exact(ENTRY_LEN)
    .map(|chunk| {
      let id = NodeId::from_slice(&chunk[..ID_LEN])?;
      let ip = Ipv4Addr::new(chunk[ID_LEN], chunk[ID_LEN + 1], chunk[ID_LEN + 2], chunk[ID_LEN + 3]);
      let port = u16::from_be_bytes([chunk[ID_LEN + 4], chunk[ID_LEN + 5]]);
      Ok(CompactNode {
        id,
        addr: SocketAddrV4::new(ip, port),
      })
    })
    .collect()
}

/// Compact peer info: 4 bytes of big-endian IPv4 address, 2 bytes of big-endian port.
pub fn encode_compact_peer(addr: &SocketAddrV4) -> Vec<u8> {
  let mut out = Vec::with_capacity(6);
  out.extend_from_slice(&addr.ip().octets());
  out.extend_from_slice(&addr.port().to_be_bytes());
  out
}

pub fn decode_compact_peer(bytes: &[u8]) -> Result<SocketAddrV4> {
  if bytes.len() != 6 {
    return error::ProtocolWrongShape { field: "values" }.fail();
  }
  let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
  let port = u16::from_be_bytes([bytes[4], bytes[5]]);
  Ok(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn id(byte: u8) -> NodeId {
    let mut bytes = [0u8; ID_LEN];
    bytes[ID_LEN - 1] = byte;
    NodeId::from_bytes(bytes)
  }

  #[test]
  fn ping_query_round_trips() {
    let message = Message::query(b"aa".to_vec(), Query::Ping { id: id(1) });
    let encoded = message.encode();
    let decoded = Message::decode(&encoded).unwrap();
    assert_eq!(decoded, message);
  }

  #[test]
  fn find_node_query_round_trips_with_want() {
    let message = Message::query(
      b"aa".to_vec(),
      Query::FindNode {
        id: id(1),
        target: id(2),
        want: Some(Want::Both),
      },
    );
    let decoded = Message::decode(&message.encode()).unwrap();
    assert_eq!(decoded, message);
  }

  #[test]
  fn announce_peer_implied_port_round_trips() {
    let message = Message::query(
      b"aa".to_vec(),
      Query::AnnouncePeer {
        id: id(1),
        info_hash: Infohash::from_bytes([7u8; ID_LEN]),
        port: 0,
        implied_port: true,
        token: b"tok".to_vec(),
      },
    );
    let decoded = Message::decode(&message.encode()).unwrap();
    assert_eq!(decoded, message);
  }

  #[test]
  fn response_with_nodes_round_trips() {
    let nodes = vec![CompactNode {
      id: id(3),
      addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6881),
    }];
    let message = Message::response(
      b"aa".to_vec(),
      ResponsePayload {
        id: Some(id(1)),
        nodes,
        values: Vec::new(),
        token: Some(b"tok".to_vec()),
      },
    );
    let decoded = Message::decode(&message.encode()).unwrap();
    assert_eq!(decoded, message);
  }

  #[test]
  fn response_with_values_round_trips() {
    let values = vec![SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 51413)];
    let message = Message::response(
      b"aa".to_vec(),
      ResponsePayload {
        id: Some(id(1)),
        nodes: Vec::new(),
        values,
        token: Some(b"tok".to_vec()),
      },
    );
    let decoded = Message::decode(&message.encode()).unwrap();
    assert_eq!(decoded, message);
  }

  #[test]
  fn error_message_round_trips() {
    let message = Message::error(b"aa".to_vec(), ERROR_PROTOCOL, "malformed packet");
    let decoded = Message::decode(&message.encode()).unwrap();
    assert_eq!(decoded, message);
  }

  #[test]
  fn unknown_method_is_rejected() {
    let mut top = BTreeMap::new();
    top.insert(b"t".to_vec(), Value::string(b"aa".to_vec()));
    top.insert(b"y".to_vec(), Value::string(b"q".to_vec()));
    top.insert(b"q".to_vec(), Value::string(b"bogus".to_vec()));
    let mut args = BTreeMap::new();
    args.insert(b"id".to_vec(), Value::string(id(1).as_bytes().to_vec()));
    top.insert(b"a".to_vec(), Value::Dictionary(args));
    let encoded = Value::Dictionary(top).encode();
    assert!(Message::decode(&encoded).is_err());
  }

  #[test]
  fn missing_required_field_is_rejected() {
    let mut top = BTreeMap::new();
    top.insert(b"t".to_vec(), Value::string(b"aa".to_vec()));
    top.insert(b"y".to_vec(), Value::string(b"q".to_vec()));
    top.insert(b"q".to_vec(), Value::string(b"ping".to_vec()));
    top.insert(b"a".to_vec(), Value::Dictionary(BTreeMap::new()));
    let encoded = Value::Dictionary(top).encode();
    assert!(Message::decode(&encoded).is_err());
  }
}
