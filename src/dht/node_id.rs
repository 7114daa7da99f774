//! 160-bit node identifiers and the XOR routing metric.

use crate::common::*;
use rand::RngCore;

pub const ID_LEN: usize = 20;

/// A 160-bit opaque identifier, treated as a big-endian unsigned integer for ordering and
/// arithmetic, and as raw bytes for XOR distance.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
  pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
    NodeId(bytes)
  }

  pub fn from_slice(bytes: &[u8]) -> Result<Self> {
    if bytes.len() != ID_LEN {
      return error::ProtocolBadIdLength.fail();
    }
    let mut id = [0u8; ID_LEN];
    id.copy_from_slice(bytes);
    Ok(NodeId(id))
  }

  pub const ZERO: NodeId = NodeId([0u8; ID_LEN]);
  pub const MAX: NodeId = NodeId([0xffu8; ID_LEN]);

  /// A cryptographically strong random id.
  pub fn random() -> Self {
    let mut bytes = [0u8; ID_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    NodeId(bytes)
  }

  /// A random id within the half-open range `[low, high)`, used to refresh a stale bucket by
  /// looking up a target that necessarily falls inside it.
  pub fn random_in_range(low: &NodeId, high: &NodeId) -> Self {
    let span = id_sub(&high.0, &low.0);
    if span == [0u8; ID_LEN] {
      return *low;
    }
    let mut bytes = [0u8; ID_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let offset = id_mod(&bytes, &span);
    low.add(&NodeId(offset))
  }

  pub fn as_bytes(&self) -> &[u8; ID_LEN] {
    &self.0
  }

  pub fn xor(&self, other: &NodeId) -> NodeId {
    let mut out = [0u8; ID_LEN];
    for i in 0..ID_LEN {
      out[i] = self.0[i] ^ other.0[i];
    }
    NodeId(out)
  }

  /// `self + other`, modulo 2^160 (the carry out of the top byte is simply discarded).
  pub fn add(&self, other: &NodeId) -> NodeId {
    let mut out = [0u8; ID_LEN];
    let mut carry = 0u16;
    for i in (0..ID_LEN).rev() {
      let sum = u16::from(self.0[i]) + u16::from(other.0[i]) + carry;
      out[i] = (sum & 0xff) as u8;
      carry = sum >> 8;
    }
    NodeId(out)
  }

  /// `(self + 1) / 2`-free halving used for bucket midpoints: computes `self / 2` treating
  /// `self` as a 161-bit unsigned integer (a leading zero bit, so no information above 2^160 is
  /// ever lost when this is called on a sum of two 160-bit values via `Uint161`).
  pub fn divide_by_two(&self) -> NodeId {
    let mut out = [0u8; ID_LEN];
    let mut carry = 0u8;
    for i in 0..ID_LEN {
      let cur = self.0[i];
      out[i] = (cur >> 1) | (carry << 7);
      carry = cur & 1;
    }
    NodeId(out)
  }

  /// Midpoint of the half-open interval `[low, high)`, computed as `(low + high) >> 1` on
  /// 161-bit arithmetic so the carry from `low + high` (which can overflow 160 bits when both
  /// are close to 2^160 - 1) is not lost.
  pub fn midpoint(low: &NodeId, high: &NodeId) -> NodeId {
    let sum = Uint161::from_bytes(&low.0).add(&Uint161::from_bytes(&high.0));
    NodeId::from_bytes(sum.shr1_to_id())
  }
}

impl Ord for NodeId {
  fn cmp(&self, other: &Self) -> Ordering {
    self.0.cmp(&other.0)
  }
}

impl PartialOrd for NodeId {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl fmt::Debug for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    for byte in &self.0 {
      write!(f, "{:02x}", byte)?;
    }
    Ok(())
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// A 20-byte torrent swarm identifier. Structurally identical to `NodeId`, kept as a distinct
/// type so a caller cannot accidentally compare a target id against an infohash.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Infohash([u8; ID_LEN]);

impl Infohash {
  pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
    Infohash(bytes)
  }

  pub fn from_slice(bytes: &[u8]) -> Result<Self> {
    NodeId::from_slice(bytes).map(|id| Infohash(*id.as_bytes()))
  }

  /// Computes the infohash of a torrent from the bencoded `info` dictionary, i.e. `sha1(info)`.
  pub fn from_info_dict(info_dict: &[u8]) -> Self {
    use sha1::Sha1;
    let mut hasher = Sha1::new();
    hasher.update(info_dict);
    let digest = hasher.digest().bytes();
    Infohash(digest)
  }

  pub fn as_bytes(&self) -> &[u8; ID_LEN] {
    &self.0
  }

  pub fn as_node_id(&self) -> NodeId {
    NodeId(self.0)
  }
}

impl fmt::Debug for Infohash {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    for byte in &self.0 {
      write!(f, "{:02x}", byte)?;
    }
    Ok(())
  }
}

impl fmt::Display for Infohash {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// A 161-bit unsigned integer (one bit wider than `NodeId`), used only to carry the overflow bit
/// produced while computing a bucket-split midpoint.
struct Uint161 {
  high_bit: u8,
  bytes: [u8; ID_LEN],
}

impl Uint161 {
  fn from_bytes(bytes: &[u8; ID_LEN]) -> Self {
    Uint161 {
      high_bit: 0,
      bytes: *bytes,
    }
  }

  fn add(&self, other: &Uint161) -> Uint161 {
    let mut out = [0u8; ID_LEN];
    let mut carry = 0u16;
    for i in (0..ID_LEN).rev() {
      let sum = u16::from(self.bytes[i]) + u16::from(other.bytes[i]) + carry;
      out[i] = (sum & 0xff) as u8;
      carry = sum >> 8;
    }
    Uint161 {
      high_bit: self.high_bit + other.high_bit + carry as u8,
      bytes: out,
    }
  }

  /// `self >> 1`, folding the overflow bit back in as the new most-significant bit.
  fn shr1_to_id(&self) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    let mut carry = self.high_bit & 1;
    for i in 0..ID_LEN {
      let cur = self.bytes[i];
      out[i] = (cur >> 1) | (carry << 7);
      carry = cur & 1;
    }
    out
  }
}

/// `a - b` on two 160-bit big-endian unsigned integers, assuming `a >= b`.
fn id_sub(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> [u8; ID_LEN] {
  let mut out = [0u8; ID_LEN];
  let mut borrow = 0i32;
  for i in (0..ID_LEN).rev() {
    let mut diff = i32::from(a[i]) - i32::from(b[i]) - borrow;
    if diff < 0 {
      diff += 256;
      borrow = 1;
    } else {
      borrow = 0;
    }
    out[i] = diff as u8;
  }
  out
}

/// `dividend % modulus` on two 160-bit big-endian unsigned integers, via binary long division:
/// one bit of the dividend is folded in per iteration, so this always terminates in exactly 160
/// steps regardless of the operands' magnitude (unlike repeated subtraction, which can take up
/// to `dividend / modulus` steps).
fn id_mod(dividend: &[u8; ID_LEN], modulus: &[u8; ID_LEN]) -> [u8; ID_LEN] {
  let mut remainder = [0u8; ID_LEN];
  for byte_index in 0..ID_LEN {
    for bit_index in (0..8).rev() {
      let bit = (dividend[byte_index] >> bit_index) & 1;

      // remainder <<= 1; remainder |= bit
      let mut carry = bit;
      for i in (0..ID_LEN).rev() {
        let shifted = (remainder[i] << 1) | carry;
        carry = remainder[i] >> 7;
        remainder[i] = shifted;
      }

      if remainder >= *modulus {
        remainder = id_sub(&remainder, modulus);
      }
    }
  }
  remainder
}

#[cfg(test)]
mod tests {
  use super::*;

  fn id(byte: u8) -> NodeId {
    let mut bytes = [0u8; ID_LEN];
    bytes[ID_LEN - 1] = byte;
    NodeId(bytes)
  }

  #[test]
  fn xor_is_self_inverse() {
    let a = NodeId::random();
    let b = NodeId::random();
    assert_eq!(a.xor(&b).xor(&b), a);
  }

  #[test]
  fn ordering_is_big_endian_lexicographic() {
    assert!(id(1) < id(2));
    assert!(NodeId::ZERO < NodeId::MAX);
  }

  #[test]
  fn midpoint_of_full_range_is_half() {
    let mid = NodeId::midpoint(&NodeId::ZERO, &NodeId::MAX);
    // 2^160 - 1 >> 1 == 0x7fff...ff
    let mut expected = [0xffu8; ID_LEN];
    expected[0] = 0x7f;
    assert_eq!(*mid.as_bytes(), expected);
  }

  #[test]
  fn midpoint_does_not_lose_the_overflow_carry() {
    // low = high = 2^160 - 1: low + high = 2^161 - 2, whose top bit must survive the shift.
    let mid = NodeId::midpoint(&NodeId::MAX, &NodeId::MAX);
    assert_eq!(mid, NodeId::MAX);
  }

  #[test]
  fn add_wraps_modulo_2_160() {
    let sum = NodeId::MAX.add(&id(1));
    assert_eq!(sum, NodeId::ZERO);
  }

  #[test]
  fn divide_by_two_halves_a_simple_value() {
    assert_eq!(id(4).divide_by_two(), id(2));
  }

  #[test]
  fn infohash_from_info_dict_is_deterministic() {
    let a = Infohash::from_info_dict(b"d4:name3:fooe");
    let b = Infohash::from_info_dict(b"d4:name3:fooe");
    assert_eq!(a, b);
  }
}
