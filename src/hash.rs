// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use sha1::{Digest, Sha1};
use std::io::{Read, Write};

/// Width of a [`Hash`] in bytes (SHA-1 digest size)
pub const HASH_LEN: usize = 20;

/// On-disk/on-wire encoding of [`Hash::invalid`]: a reserved all-ones
/// pattern, mirroring [`crate::id::LogId`]'s own all-ones "invalid" sentinel.
/// A hash's fixed 20-byte slot has no spare validity bit and [`Hash::zero`]
/// already claims the all-zero pattern, so invalidity has to live in the
/// digest bytes themselves.
const INVALID_SENTINEL: [u8; HASH_LEN] = [0xFF; HASH_LEN];

/// A 160-bit cryptographic digest with an explicit validity bit.
///
/// Zero is a distinct, legal digest value; "invalid" is an out-of-band sentinel
/// used to represent the absence of a hash (e.g. a `VDisk` that has no parent).
/// This mirrors the reference implementation's `LogFS_Hash`, which carries a
/// separate `isValid` flag rather than reserving a magic bit pattern.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Hash {
    raw: [u8; HASH_LEN],
    valid: bool,
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.valid {
            write!(f, "Hash({})", self.to_hex())
        } else {
            write!(f, "Hash(invalid)")
        }
    }
}

impl Default for Hash {
    /// The invalid sentinel, not the zero hash - use [`Hash::zero`] for that.
    fn default() -> Self {
        Self::invalid()
    }
}

impl Hash {
    /// The out-of-band sentinel representing "no hash".
    #[must_use]
    pub fn invalid() -> Self {
        Self {
            raw: [0; HASH_LEN],
            valid: false,
        }
    }

    /// The all-zero digest, a distinct legal value from [`Hash::invalid`].
    #[must_use]
    pub fn zero() -> Self {
        Self {
            raw: [0; HASH_LEN],
            valid: true,
        }
    }

    /// Wraps a raw 20-byte digest, marking it valid.
    #[must_use]
    pub fn from_raw(raw: [u8; HASH_LEN]) -> Self {
        Self { raw, valid: true }
    }

    /// Returns `true` if this hash is not the invalid sentinel.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Returns `true` if this hash is the all-zero digest.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.valid && self.raw == [0; HASH_LEN]
    }

    /// Returns the raw digest bytes.
    ///
    /// # Panics
    ///
    /// Panics if the hash is invalid; callers must check [`Hash::is_valid`] first,
    /// matching the reference implementation's `ASSERT(h.isValid)` guards.
    #[must_use]
    pub fn raw(&self) -> &[u8; HASH_LEN] {
        assert!(self.valid, "attempted to read raw bytes of invalid hash");
        &self.raw
    }

    /// Infallible on-disk/on-wire encoding: the raw digest if valid, or the
    /// reserved [`INVALID_SENTINEL`] if invalid. Unlike [`Hash::raw`], never
    /// panics, so it is safe to call on chain fields (`parent`/`id`/`entropy`)
    /// that are legitimately [`Hash::invalid`] — a pointer record's chain
    /// fields and a volume's genesis `parent`, for instance.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HASH_LEN] {
        if self.valid {
            self.raw
        } else {
            INVALID_SENTINEL
        }
    }

    /// Inverse of [`Hash::to_bytes`]: the [`INVALID_SENTINEL`] pattern
    /// decodes back to [`Hash::invalid`], every other pattern (including
    /// all-zero) decodes to a valid digest.
    #[must_use]
    pub fn from_bytes(raw: [u8; HASH_LEN]) -> Self {
        if raw == INVALID_SENTINEL {
            Self::invalid()
        } else {
            Self { raw, valid: true }
        }
    }

    /// Computes the SHA-1 checksum of a buffer.
    #[must_use]
    pub fn checksum(buf: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(buf);
        Self::from_raw(hasher.finalize().into())
    }

    /// Applies the one-way step `H(h)`, deriving a new hash from this one.
    ///
    /// # Panics
    ///
    /// Panics if `self` is invalid.
    #[must_use]
    pub fn apply(&self) -> Self {
        Self::checksum(self.raw())
    }

    /// XORs two hashes byte-wise.
    ///
    /// # Panics
    ///
    /// Panics if either operand is invalid.
    #[must_use]
    pub fn xor(&self, other: &Self) -> Self {
        let mut raw = [0u8; HASH_LEN];
        for i in 0..HASH_LEN {
            raw[i] = self.raw()[i] ^ other.raw()[i];
        }
        Self::from_raw(raw)
    }

    /// Derives a hash from the concatenation of two hashes: `H(a || b)`.
    #[must_use]
    pub fn combine(a: &Self, b: &Self) -> Self {
        let mut buf = Vec::with_capacity(HASH_LEN * 2);
        buf.extend_from_slice(a.raw());
        buf.extend_from_slice(b.raw());
        Self::checksum(&buf)
    }

    /// Generates a cryptographically-irrelevant random hash, for tests and entropy seeding.
    #[must_use]
    pub fn random() -> Self {
        let mut raw = [0u8; HASH_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut raw);
        Self::from_raw(raw)
    }

    /// Encodes the digest as lowercase hex. Returns `"invalid"` for the invalid sentinel.
    #[must_use]
    pub fn to_hex(&self) -> String {
        if !self.valid {
            return "invalid".into();
        }

        let mut s = String::with_capacity(HASH_LEN * 2);
        for byte in &self.raw {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }

    /// Parses a 40-character lowercase hex string into a hash.
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != HASH_LEN * 2 {
            return None;
        }

        let mut raw = [0u8; HASH_LEN];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = u8::from_str_radix(s.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(Self::from_raw(raw))
    }
}

impl Encode for Hash {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }
}

impl Decode for Hash {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut raw = [0u8; HASH_LEN];
        reader.read_exact(&mut raw)?;
        Ok(Self::from_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn invalid_is_not_valid() {
        assert!(!Hash::invalid().is_valid());
    }

    #[test]
    fn zero_is_distinct_from_invalid() {
        assert!(Hash::zero().is_valid());
        assert!(Hash::zero().is_zero());
        assert_ne!(Hash::zero(), Hash::invalid());
    }

    #[test]
    fn apply_is_deterministic_one_way_step() {
        let h = Hash::checksum(b"seed");
        assert_eq!(h.apply(), h.apply());
        assert_ne!(h, h.apply());
    }

    #[test]
    fn hex_round_trip() {
        let h = Hash::checksum(b"round trip me");
        let hex = h.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(Hash::from_hex(&hex), Some(h));
    }

    #[test]
    fn xor_is_self_inverse() {
        let a = Hash::checksum(b"a");
        let b = Hash::checksum(b"b");
        assert_eq!(Hash::xor(&Hash::xor(&a, &b), &b), a);
    }

    #[test]
    fn encode_decode_round_trip() -> crate::Result<()> {
        let h = Hash::checksum(b"on the wire");
        let bytes = h.encode_into_vec()?;
        assert_eq!(bytes.len(), HASH_LEN);

        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = Hash::decode_from(&mut cursor)?;
        assert_eq!(h, decoded);

        Ok(())
    }

    #[test]
    fn invalid_encode_decode_round_trip_stays_invalid() -> crate::Result<()> {
        let bytes = Hash::invalid().encode_into_vec()?;
        assert_eq!(bytes, vec![0xFF; HASH_LEN]);

        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = Hash::decode_from(&mut cursor)?;
        assert!(!decoded.is_valid());

        Ok(())
    }

    #[test]
    fn zero_and_invalid_remain_distinct_on_the_wire() -> crate::Result<()> {
        let zero_bytes = Hash::zero().encode_into_vec()?;
        let invalid_bytes = Hash::invalid().encode_into_vec()?;
        assert_ne!(zero_bytes, invalid_bytes);

        let decoded_zero = Hash::decode_from(&mut std::io::Cursor::new(zero_bytes))?;
        assert!(decoded_zero.is_valid());
        assert!(decoded_zero.is_zero());

        Ok(())
    }
}
