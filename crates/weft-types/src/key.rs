//! 160-bit identifiers and the XOR distance metric.
//!
//! Node ids, data keys and RPC message ids all live in the same 160-bit
//! space. Distance between two identifiers is their bitwise XOR read as an
//! unsigned big-endian integer; because the byte arrays are big-endian,
//! plain lexicographic comparison of distances is the unsigned comparison.

use std::fmt;

use rand::RngCore;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

/// Identifier length in bytes.
pub const KEY_LEN: usize = 20;

/// Identifier length in bits.
pub const KEY_BITS: usize = KEY_LEN * 8;

/// A 160-bit identifier: a node id, a data key, or a derived sub-key.
///
/// Generated by hashing publisher-chosen input with SHA-1. The hash is
/// cryptographically weak, which is acceptable here: it is used for uniform
/// distribution over the key space, not for authentication.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Generate a fresh pseudo-random identifier: SHA-1 over 32 random bytes.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::for_content(&seed)
    }

    /// Derive the identifier for a piece of content: SHA-1 of the input.
    pub fn for_content(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Construct a key from exactly [`KEY_LEN`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != KEY_LEN {
            return None;
        }
        let mut buf = [0u8; KEY_LEN];
        buf.copy_from_slice(bytes);
        Some(Self(buf))
    }

    /// Construct a key from a fixed-size array.
    pub const fn from_array(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of this key.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// The raw bytes of this key as an owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// XOR distance between two identifiers.
    pub fn distance(&self, other: &Key) -> Distance {
        let mut out = [0u8; KEY_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// The k-bucket index of `other` relative to this key:
    /// ⌊log₂(distance)⌋, with equal keys mapping to index 0.
    pub fn bucket_index(&self, other: &Key) -> usize {
        let d = self.distance(other);
        match d.bit_length() {
            0 => 0,
            n => n - 1,
        }
    }

    /// The bit at position `i`, counting from the most significant bit.
    pub fn bit(&self, i: usize) -> bool {
        let byte = self.0[i / 8];
        let shift = 7 - (i % 8);
        (byte >> shift) & 1 == 1
    }

    /// Whether the first `len` bits of this key equal those of `prefix`.
    pub fn has_prefix(&self, prefix: &Key, len: usize) -> bool {
        for i in 0..len {
            if self.bit(i) != prefix.bit(i) {
                return false;
            }
        }
        true
    }

    /// A key whose first `prefix_len` bits are copied from `prefix` and
    /// whose remaining bits are random. Used to pick lookup targets inside
    /// a bucket's range during refresh.
    pub fn random_with_prefix(prefix: &Key, prefix_len: usize) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        let mut out = Self(bytes);
        for i in 0..prefix_len {
            out.set_bit(i, prefix.bit(i));
        }
        out
    }

    /// A copy of this key with bit `i` (counting from the most significant
    /// bit) forced to `value`.
    pub fn with_bit(&self, i: usize, value: bool) -> Self {
        let mut out = *self;
        out.set_bit(i, value);
        out
    }

    fn set_bit(&mut self, i: usize, value: bool) {
        let mask = 1u8 << (7 - (i % 8));
        if value {
            self.0[i / 8] |= mask;
        } else {
            self.0[i / 8] &= !mask;
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", hex::encode(self.0))
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyVisitor;

        impl<'de> Visitor<'de> for KeyVisitor {
            type Value = Key;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a byte string of length {KEY_LEN}")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Key, E> {
                Key::from_bytes(v).ok_or_else(|| E::invalid_length(v.len(), &self))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Key, A::Error> {
                let mut buf = [0u8; KEY_LEN];
                let mut len = 0usize;
                while let Some(byte) = seq.next_element::<u8>()? {
                    if len >= KEY_LEN {
                        return Err(de::Error::invalid_length(len + 1, &self));
                    }
                    buf[len] = byte;
                    len += 1;
                }
                if len != KEY_LEN {
                    return Err(de::Error::invalid_length(len, &self));
                }
                Ok(Key(buf))
            }
        }

        deserializer.deserialize_bytes(KeyVisitor)
    }
}

/// XOR distance between two identifiers, as an unsigned 160-bit big-endian
/// value. Lexicographic byte comparison is the unsigned comparison.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; KEY_LEN]);

impl Distance {
    /// Zero distance (the two identifiers were equal).
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Position of the highest set bit plus one; 0 for a zero distance.
    pub fn bit_length(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let leading = byte.leading_zeros() as usize;
                return KEY_BITS - (i * 8 + leading);
            }
        }
        0
    }

    /// The raw big-endian bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_length_and_uniqueness() {
        let mut seen = Vec::new();
        for _ in 0..100 {
            let key = Key::generate();
            assert_eq!(key.as_bytes().len(), KEY_LEN);
            assert!(!seen.contains(&key), "generated id not unique");
            seen.push(key);
        }
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = Key::generate();
        assert!(a.distance(&a).is_zero());
    }

    #[test]
    fn test_distance_symmetry() {
        let a = Key::generate();
        let b = Key::generate();
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn test_distance_triangle_inequality() {
        // Under XOR, d(a, c) == d(a, b) XOR d(b, c), so the XOR form of the
        // triangle inequality holds with equality.
        for _ in 0..20 {
            let a = Key::generate();
            let b = Key::generate();
            let c = Key::generate();
            let ab = a.distance(&b);
            let bc = b.distance(&c);
            let ac = a.distance(&c);
            let mut xor = [0u8; KEY_LEN];
            for i in 0..KEY_LEN {
                xor[i] = ab.as_bytes()[i] ^ bc.as_bytes()[i];
            }
            assert_eq!(ac.as_bytes(), &xor);
        }
    }

    #[test]
    fn test_bucket_index() {
        let zero = Key::from_array([0u8; KEY_LEN]);
        assert_eq!(zero.bucket_index(&zero), 0);

        let mut far = [0u8; KEY_LEN];
        far[0] = 0x80;
        assert_eq!(zero.bucket_index(&Key::from_array(far)), KEY_BITS - 1);

        let mut close = [0u8; KEY_LEN];
        close[KEY_LEN - 1] = 0x01;
        assert_eq!(zero.bucket_index(&Key::from_array(close)), 0);

        let mut mid = [0u8; KEY_LEN];
        mid[KEY_LEN - 1] = 0x02;
        assert_eq!(zero.bucket_index(&Key::from_array(mid)), 1);
    }

    #[test]
    fn test_for_content_is_deterministic() {
        let a = Key::for_content(b"hello weft");
        let b = Key::for_content(b"hello weft");
        assert_eq!(a, b);
        assert_ne!(a, Key::for_content(b"hello loom"));
    }

    #[test]
    fn test_random_with_prefix() {
        let prefix = Key::generate();
        for len in [0usize, 1, 7, 8, 13, 159] {
            let key = Key::random_with_prefix(&prefix, len);
            assert!(key.has_prefix(&prefix, len));
        }
    }

    #[test]
    fn test_distance_ordering_matches_big_endian() {
        let base = Key::from_array([0u8; KEY_LEN]);
        let mut small = [0u8; KEY_LEN];
        small[KEY_LEN - 1] = 3;
        let mut large = [0u8; KEY_LEN];
        large[0] = 1;
        assert!(base.distance(&Key::from_array(small)) < base.distance(&Key::from_array(large)));
    }
}
