//! 160-bit node identifiers and the XOR distance metric.
//!
//! All operations here are pure and thread-safe; none of them touch
//! routing-table state.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// Width of a node id in bytes (160 bits).
pub const NODE_ID_BYTES: usize = 20;

/// Number of k-buckets a routing table keyed on a [`NodeId`] maintains.
pub const NUM_BUCKETS: usize = NODE_ID_BYTES * 8;

/// An opaque 160-bit identifier used both for node identity and for DHT keys.
///
/// Equality and ordering are bytewise; the Kademlia distance metric is XOR,
/// computed via [`NodeId::xor`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_BYTES]);

impl NodeId {
    /// Wrap a raw 20-byte array.
    pub const fn from_bytes(bytes: [u8; NODE_ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Uniform random id from a CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; NODE_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive an id from a public key: SHA-256 truncated to 20 bytes.
    pub fn from_public_key(pk: &[u8]) -> Self {
        Self::hash_key(pk)
    }

    /// Hash arbitrary bytes into a 20-byte DHT key using the same scheme as
    /// [`NodeId::from_public_key`].
    pub fn hash_key(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; NODE_ID_BYTES];
        out.copy_from_slice(&digest[..NODE_ID_BYTES]);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, crate::error::DhtError> {
        let decoded = hex::decode(s)
            .map_err(|e| crate::error::DhtError::ProgrammerError(format!("invalid node id hex: {e}")))?;
        if decoded.len() != NODE_ID_BYTES {
            return Err(crate::error::DhtError::ProgrammerError(format!(
                "node id must be {NODE_ID_BYTES} bytes, got {}",
                decoded.len()
            )));
        }
        let mut out = [0u8; NODE_ID_BYTES];
        out.copy_from_slice(&decoded);
        Ok(Self(out))
    }

    /// XOR distance between two ids. Fails only on a length mismatch, which
    /// cannot happen for two [`NodeId`] values — kept as a free function
    /// below for inputs of unchecked length.
    pub fn xor(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; NODE_ID_BYTES];
        for i in 0..NODE_ID_BYTES {
            out[i] = self.0[i] ^ other.0[i];
        }
        NodeId(out)
    }

    /// Lexicographic compare of two XOR distances, as -1/0/1.
    pub fn compare_distance(d1: &NodeId, d2: &NodeId) -> i32 {
        match d1.0.cmp(&d2.0) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    /// Index of the most-significant differing bit between `local` and
    /// `target`, counted from the MSB, in `0..NUM_BUCKETS`. Returns `-1` iff
    /// `local == target`.
    pub fn bucket_index(local: &NodeId, target: &NodeId) -> i32 {
        let distance = local.xor(target);
        for (byte_idx, byte) in distance.0.iter().enumerate() {
            if *byte != 0 {
                let leading = byte.leading_zeros() as usize;
                return (byte_idx * 8 + leading) as i32;
            }
        }
        -1
    }

    /// Stable ascending sort of `contacts` by XOR distance to `target`.
    pub fn sort_by_distance<T>(contacts: &mut [T], target: &NodeId, id_of: impl Fn(&T) -> NodeId) {
        contacts.sort_by(|a, b| {
            let da = id_of(a).xor(target);
            let db = id_of(b).xor(target);
            da.0.cmp(&db.0)
        });
    }

    /// Produce an id whose first `bucket` bits equal `local`'s, bit `bucket`
    /// is flipped, and the remaining bits are random. Used to generate a
    /// refresh target that is guaranteed to fall in bucket `bucket`.
    pub fn generate_id_in_bucket(local: &NodeId, bucket: usize) -> NodeId {
        assert!(bucket < NUM_BUCKETS, "bucket index out of range");
        let mut out = local.0;
        let mut rand_tail = [0u8; NODE_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut rand_tail);

        let flip_byte = bucket / 8;
        let flip_bit = 7 - (bucket % 8);
        out[flip_byte] ^= 1 << flip_bit;

        // Randomize every bit strictly after the flipped one.
        for byte_idx in flip_byte..NODE_ID_BYTES {
            let start_bit = if byte_idx == flip_byte { flip_bit } else { 8 };
            for bit in 0..start_bit {
                let mask = 1u8 << bit;
                out[byte_idx] = (out[byte_idx] & !mask) | (rand_tail[byte_idx] & mask);
            }
        }
        NodeId(out)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self([0u8; NODE_ID_BYTES])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repeat(byte: u8) -> NodeId {
        NodeId([byte; NODE_ID_BYTES])
    }

    #[test]
    fn xor_is_self_inverse() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert_eq!(a.xor(&b).xor(&b), a);
    }

    #[test]
    fn compare_distance_is_total_order() {
        let d1 = repeat(0x01);
        let d2 = repeat(0x02);
        assert_eq!(NodeId::compare_distance(&d1, &d1), 0);
        assert_eq!(NodeId::compare_distance(&d1, &d2), -1);
        assert_eq!(NodeId::compare_distance(&d2, &d1), 1);
    }

    #[test]
    fn bucket_index_self_is_negative_one() {
        let local = repeat(0x42);
        assert_eq!(NodeId::bucket_index(&local, &local), -1);
    }

    #[test]
    fn bucket_index_matches_leading_zero_bits() {
        let local = repeat(0x00);
        let mut target_bytes = [0u8; NODE_ID_BYTES];
        target_bytes[0] = 0b0010_0000; // bit index 2 from MSB
        let target = NodeId(target_bytes);
        assert_eq!(NodeId::bucket_index(&local, &target), 2);
    }

    #[test]
    fn generate_id_in_bucket_lands_in_requested_bucket() {
        let local = NodeId::generate();
        for bucket in [0usize, 1, 7, 8, 63, 100, 159] {
            let generated = NodeId::generate_id_in_bucket(&local, bucket);
            assert_eq!(
                NodeId::bucket_index(&local, &generated),
                bucket as i32,
                "bucket {bucket}"
            );
        }
    }

    #[test]
    fn sort_by_distance_orders_ascending() {
        let local = repeat(0x00);
        let mut ids = vec![repeat(3), repeat(1), repeat(2)];
        NodeId::sort_by_distance(&mut ids, &local, |id| *id);
        assert_eq!(ids, vec![repeat(1), repeat(2), repeat(3)]);
    }

    #[test]
    fn hash_key_is_deterministic_and_truncated() {
        let a = NodeId::hash_key(b"abc");
        let b = NodeId::hash_key(b"abc");
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), NODE_ID_BYTES);
    }

    #[test]
    fn hex_round_trips() {
        let id = NodeId::generate();
        let hex = id.to_hex();
        assert_eq!(NodeId::from_hex(&hex).unwrap(), id);
    }
}
