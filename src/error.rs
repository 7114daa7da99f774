use crate::common::*;

/// Error taxonomy for the DHT core.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum Error {
  #[snafu(display("bencode: unexpected end of input while decoding a {kind}"))]
  DecodeEof { kind: &'static str },

  #[snafu(display("bencode: expected {expected}, found byte {found:#04x} at offset {offset}"))]
  DecodeUnexpectedByte {
    expected: &'static str,
    found: u8,
    offset: usize,
  },

  #[snafu(display("bencode: malformed integer at offset {offset}"))]
  DecodeMalformedInteger { offset: usize },

  #[snafu(display("bencode: malformed byte string length at offset {offset}"))]
  DecodeMalformedLength { offset: usize },

  #[snafu(display(
    "bencode: dictionary keys out of order at offset {offset} (strict mode)"
  ))]
  DecodeKeysUnordered { offset: usize },

  #[snafu(display("bencode: duplicate dictionary key at offset {offset}"))]
  DecodeDuplicateKey { offset: usize },

  #[snafu(display("bencode: trailing bytes after a complete value"))]
  DecodeTrailingBytes,

  #[snafu(display("message: missing required field `{field}`"))]
  ProtocolMissingField { field: &'static str },

  #[snafu(display("message: field `{field}` had the wrong bencode shape"))]
  ProtocolWrongShape { field: &'static str },

  #[snafu(display("message: unrecognized message type `{y}`"))]
  ProtocolUnknownType { y: String },

  #[snafu(display("message: unrecognized query method `{method}`"))]
  ProtocolUnknownMethod { method: String },

  #[snafu(display("message: node id or info hash was not exactly 20 bytes"))]
  ProtocolBadIdLength,

  #[snafu(display("remote returned error {code}: {message}"))]
  Remote { code: i64, message: String },

  #[snafu(display("rpc to {addr} timed out after {elapsed:?}"))]
  Timeout {
    addr: SocketAddrV4,
    elapsed: Duration,
  },

  #[snafu(display(
    "refusing to send: {in_flight} requests already in flight (ceiling {ceiling})"
  ))]
  Busy { in_flight: usize, ceiling: usize },

  #[snafu(display("transport I/O error: {source}"))]
  Transport { source: std::io::Error },

  #[snafu(display("datagram of {len} bytes exceeds the configured cap of {cap} bytes"))]
  DatagramTooLarge { len: usize, cap: usize },

  #[snafu(display("token was not issued within the last two rotation epochs"))]
  TokenInvalid,

  #[snafu(display("failed to read routing table from {path}: {source}"))]
  PersistenceRead {
    path: String,
    source: std::io::Error,
  },

  #[snafu(display("failed to write routing table to {path}: {source}"))]
  PersistenceWrite {
    path: String,
    source: std::io::Error,
  },

  #[snafu(visibility = "pub")]
  #[snafu(display("invalid node id seed: {reason}"))]
  Config { reason: String },
}
