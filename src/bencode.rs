//! A bit-exact BEncode codec.
//!
//! BEncode recognizes four value kinds by their first byte: `i` for an arbitrary-precision signed
//! integer, `l` for a list, `d` for a dictionary, and an ASCII digit for a length-prefixed byte
//! string. This module hand-rolls the codec rather than routing it through a `serde` data model:
//! the wire contract here needs canonical dictionary key order enforced even while decoding,
//! precomputed output length, and integers outside the 64-bit range, none of which a generic
//! derive-based mapping guarantees.

use crate::common::*;
use num_bigint::BigInt;
use std::collections::BTreeMap;

/// Whether the decoder rejects or tolerates dictionaries whose keys are not in strictly
/// ascending byte-lexicographic order (and whose keys repeat).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
  Strict,
  Lenient,
}

/// A decoded (or to-be-encoded) BEncode value.
///
/// `Dictionary` is backed by a `BTreeMap`, which both keeps keys in ascending
/// byte-lexicographic order for free and collapses duplicate keys to the last-written value —
/// exactly the canonical-encode and lenient-decode behavior this type needs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Value {
  Integer(BigInt),
  ByteString(Vec<u8>),
  List(Vec<Value>),
  Dictionary(BTreeMap<Vec<u8>, Value>),
}

impl Value {
  pub fn integer(n: impl Into<BigInt>) -> Self {
    Value::Integer(n.into())
  }

  pub fn string(bytes: impl Into<Vec<u8>>) -> Self {
    Value::ByteString(bytes.into())
  }

  pub fn as_bytes(&self) -> Option<&[u8]> {
    match self {
      Value::ByteString(bytes) => Some(bytes),
      _ => None,
    }
  }

  pub fn as_integer(&self) -> Option<&BigInt> {
    match self {
      Value::Integer(n) => Some(n),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&[Value]> {
    match self {
      Value::List(values) => Some(values),
      _ => None,
    }
  }

  pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
    match self {
      Value::Dictionary(map) => Some(map),
      _ => None,
    }
  }

  /// Exact length of this value's canonical encoding, computed without allocating the encoding
  /// itself so callers can size a buffer up front.
  pub fn encoded_len(&self) -> usize {
    match self {
      Value::Integer(n) => 2 + int_digits(n).len(),
      Value::ByteString(bytes) => decimal_digits(bytes.len()) + 1 + bytes.len(),
      Value::List(values) => 2 + values.iter().map(Value::encoded_len).sum::<usize>(),
      Value::Dictionary(map) => {
        2
          + map
            .iter()
            .map(|(k, v)| decimal_digits(k.len()) + 1 + k.len() + v.encoded_len())
            .sum::<usize>()
      }
    }
  }

  /// Canonical encoding: integers without leading zeros, dictionary keys ascending.
  pub fn encode(&self) -> Vec<u8> {
    let mut buf = Vec::with_capacity(self.encoded_len());
    self.encode_into(&mut buf);
    buf
  }

  fn encode_into(&self, buf: &mut Vec<u8>) {
    match self {
      Value::Integer(n) => {
        buf.push(b'i');
        buf.extend_from_slice(int_digits(n).as_bytes());
        buf.push(b'e');
      }
      Value::ByteString(bytes) => {
        buf.extend_from_slice(bytes.len().to_string().as_bytes());
        buf.push(b':');
        buf.extend_from_slice(bytes);
      }
      Value::List(values) => {
        buf.push(b'l');
        for value in values {
          value.encode_into(buf);
        }
        buf.push(b'e');
      }
      Value::Dictionary(map) => {
        buf.push(b'd');
        for (key, value) in map {
          buf.extend_from_slice(key.len().to_string().as_bytes());
          buf.push(b':');
          buf.extend_from_slice(key);
          value.encode_into(buf);
        }
        buf.push(b'e');
      }
    }
  }
}

fn int_digits(n: &BigInt) -> String {
  n.to_str_radix(10)
}

fn decimal_digits(n: usize) -> usize {
  n.to_string().len()
}

/// Decode exactly one value from `input`, rejecting any trailing bytes, using `mode` to decide
/// whether a malformed dictionary key order is an error or is tolerated.
pub fn decode(input: &[u8], mode: Mode) -> Result<Value> {
  let mut decoder = Decoder {
    buf: input,
    pos: 0,
    mode,
  };
  let value = decoder.value()?;
  if decoder.pos != input.len() {
    return Err(Error::DecodeTrailingBytes);
  }
  Ok(value)
}

/// Convenience wrapper for `decode(input, Mode::Strict)`.
pub fn decode_strict(input: &[u8]) -> Result<Value> {
  decode(input, Mode::Strict)
}

struct Decoder<'a> {
  buf: &'a [u8],
  pos: usize,
  mode: Mode,
}

impl<'a> Decoder<'a> {
  fn peek(&self) -> Option<u8> {
    self.buf.get(self.pos).copied()
  }

  fn bump(&mut self) -> Option<u8> {
    let byte = self.peek()?;
    self.pos += 1;
    Some(byte)
  }

  fn expect(&mut self, byte: u8, expected: &'static str) -> Result<()> {
    match self.bump() {
      Some(found) if found == byte => Ok(()),
      Some(found) => error::DecodeUnexpectedByte {
        expected,
        found,
        offset: self.pos - 1,
      }
      .fail(),
      None => error::DecodeEof { kind: expected }.fail(),
    }
  }

  fn value(&mut self) -> Result<Value> {
    match self.peek() {
      Some(b'i') => self.integer(),
      Some(b'l') => self.list(),
      Some(b'd') => self.dictionary(),
      Some(b'0'..=b'9') => self.byte_string().map(Value::ByteString),
      Some(found) => error::DecodeUnexpectedByte {
        expected: "one of i/l/d/0-9",
        found,
        offset: self.pos,
      }
      .fail(),
      None => error::DecodeEof { kind: "value" }.fail(),
    }
  }

  fn integer(&mut self) -> Result<Value> {
    let start = self.pos;
    self.expect(b'i', "integer")?;
    let digits_start = self.pos;
    while self.peek().map_or(false, |b| b != b'e') {
      self.pos += 1;
    }
    if self.peek().is_none() {
      return error::DecodeEof { kind: "integer" }.fail();
    }
    let digits = &self.buf[digits_start..self.pos];
    self.pos += 1; // consume 'e'

    if validate_canonical_integer(digits).is_err() {
      return error::DecodeMalformedInteger { offset: start }.fail();
    }

    let text = match std::str::from_utf8(digits) {
      Ok(text) => text,
      Err(_) => return error::DecodeMalformedInteger { offset: start }.fail(),
    };
    let n: BigInt = match text.parse() {
      Ok(n) => n,
      Err(_) => return error::DecodeMalformedInteger { offset: start }.fail(),
    };
    Ok(Value::Integer(n))
  }

  fn byte_string(&mut self) -> Result<Vec<u8>> {
    let start = self.pos;
    let len_start = self.pos;
    while self.peek().map_or(false, |b| b != b':') {
      self.pos += 1;
    }
    if self.peek().is_none() {
      return error::DecodeEof { kind: "byte string length" }.fail();
    }
    let digits = &self.buf[len_start..self.pos];
    self.pos += 1; // consume ':'

    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
      return error::DecodeMalformedLength { offset: start }.fail();
    }
    if digits.len() > 1 && digits[0] == b'0' {
      return error::DecodeMalformedLength { offset: start }.fail();
    }
    let text = std::str::from_utf8(digits).unwrap();
    let len: usize = match text.parse() {
      Ok(len) => len,
      Err(_) => return error::DecodeMalformedLength { offset: start }.fail(),
    };

    if self.buf.len() < self.pos + len {
      return error::DecodeEof { kind: "byte string contents" }.fail();
    }
    let bytes = self.buf[self.pos..self.pos + len].to_vec();
    self.pos += len;
    Ok(bytes)
  }

  fn list(&mut self) -> Result<Value> {
    self.expect(b'l', "list")?;
    let mut values = Vec::new();
    loop {
      match self.peek() {
        Some(b'e') => {
          self.pos += 1;
          break;
        }
        Some(_) => values.push(self.value()?),
        None => return error::DecodeEof { kind: "list" }.fail(),
      }
    }
    Ok(Value::List(values))
  }

  fn dictionary(&mut self) -> Result<Value> {
    self.expect(b'd', "dictionary")?;
    let mut map = BTreeMap::new();
    let mut previous_key: Option<Vec<u8>> = None;
    loop {
      match self.peek() {
        Some(b'e') => {
          self.pos += 1;
          break;
        }
        Some(b'0'..=b'9') => {
          let key_offset = self.pos;
          let key = self.byte_string()?;
          let value = self.value()?;

          if let Some(ref previous) = previous_key {
            match key.cmp(previous) {
              Ordering::Greater => {}
              Ordering::Equal => {
                if self.mode == Mode::Strict {
                  return error::DecodeDuplicateKey { offset: key_offset }.fail();
                }
              }
              Ordering::Less => {
                if self.mode == Mode::Strict {
                  return error::DecodeKeysUnordered { offset: key_offset }.fail();
                }
              }
            }
          }
          previous_key = Some(key.clone());
          map.insert(key, value);
        }
        Some(found) => {
          return error::DecodeUnexpectedByte {
            expected: "a byte string key",
            found,
            offset: self.pos,
          }
          .fail()
        }
        None => return error::DecodeEof { kind: "dictionary" }.fail(),
      }
    }
    Ok(Value::Dictionary(map))
  }
}

fn validate_canonical_integer(digits: &[u8]) -> std::result::Result<(), ()> {
  if digits.is_empty() {
    return Err(());
  }
  let (sign, magnitude) = if digits[0] == b'-' {
    (true, &digits[1..])
  } else {
    (false, digits)
  };
  if magnitude.is_empty() || !magnitude.iter().all(u8::is_ascii_digit) {
    return Err(());
  }
  if magnitude.len() > 1 && magnitude[0] == b'0' {
    return Err(());
  }
  if sign && magnitude == b"0" {
    // "-0" is rejected in strict mode.
    return Err(());
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn dict(pairs: Vec<(&str, Value)>) -> Value {
    let mut map = BTreeMap::new();
    for (k, v) in pairs {
      map.insert(k.as_bytes().to_vec(), v);
    }
    Value::Dictionary(map)
  }

  #[test]
  fn round_trip_spec_example() {
    let value = dict(vec![
      ("a", Value::string("bee")),
      (
        "b",
        Value::List(vec![Value::integer(1), Value::integer(-2), Value::integer(0)]),
      ),
      ("c", dict(vec![])),
    ]);

    let encoded = value.encode();
    assert_eq!(encoded, b"d1:a3:bee1:bli1ei-2ei0ee1:cdee");
    assert_eq!(encoded.len(), value.encoded_len());

    let decoded = decode_strict(&encoded).unwrap();
    assert_eq!(decoded, value);
  }

  #[test]
  fn rejects_leading_zero_integer() {
    assert!(decode_strict(b"i01e").is_err());
  }

  #[test]
  fn rejects_negative_zero() {
    assert!(decode_strict(b"i-0e").is_err());
  }

  #[test]
  fn rejects_plus_sign() {
    assert!(decode_strict(b"i+1e").is_err());
  }

  #[test]
  fn rejects_leading_zero_length() {
    assert!(decode_strict(b"03:abc").is_err());
  }

  #[test]
  fn zero_length_byte_string_round_trips() {
    let value = Value::string(Vec::new());
    assert_eq!(value.encode(), b"0:");
    assert_eq!(decode_strict(b"0:").unwrap(), value);
  }

  #[test]
  fn strict_mode_rejects_unordered_keys() {
    assert!(decode_strict(b"d1:bi1e1:ai2ee").is_err());
  }

  #[test]
  fn lenient_mode_tolerates_unordered_keys() {
    let decoded = decode(b"d1:bi1e1:ai2ee", Mode::Lenient).unwrap();
    let expected = dict(vec![("a", Value::integer(2)), ("b", Value::integer(1))]);
    assert_eq!(decoded, expected);
  }

  #[test]
  fn strict_mode_rejects_duplicate_keys() {
    assert!(decode_strict(b"d1:ai1e1:ai2ee").is_err());
  }

  #[test]
  fn rejects_trailing_bytes() {
    assert!(decode_strict(b"i1eextra").is_err());
  }

  #[test]
  fn big_integer_round_trips() {
    let huge: BigInt = "123456789012345678901234567890".parse().unwrap();
    let value = Value::Integer(huge);
    let encoded = value.encode();
    assert_eq!(decode_strict(&encoded).unwrap(), value);
  }

  #[test]
  fn encoded_len_matches_nested_structures() {
    let value = Value::List(vec![
      Value::string("hello"),
      Value::integer(42),
      dict(vec![("x", Value::integer(-7))]),
    ]);
    assert_eq!(value.encode().len(), value.encoded_len());
  }
}
