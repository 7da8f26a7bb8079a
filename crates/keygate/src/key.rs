//! Keyspace ids and the key ranges shards own.
//!
//! A keyspace id is an 8-byte big-endian value. Shard key ranges are written
//! in the usual hex form: `-80` owns every id below `0x80..`, `80-` owns the
//! rest, and `0` (or `-`) is the single shard of an unsharded keyspace.

use std::cmp::Ordering;
use std::fmt;

use anyhow::{Context, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyspaceId([u8; 8]);

impl KeyspaceId {
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw.to_be_bytes())
    }

    pub const fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Accepts exactly eight raw bytes.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = raw.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn from_hex(raw: &str) -> Result<Self> {
        let bytes = hex::decode(raw).with_context(|| format!("invalid keyspace id hex: {raw}"))?;
        Self::from_bytes(&bytes)
            .with_context(|| format!("keyspace id must be 8 bytes, got {}", bytes.len()))
    }
}

impl fmt::Display for KeyspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Half-open range `[start, end)` of keyspace ids.
///
/// Bounds are byte prefixes compared lexicographically against the 8-byte
/// id; an empty bound is open.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn full() -> Self {
        Self {
            start: Vec::new(),
            end: Vec::new(),
        }
    }

    /// Parses a shard name. `0`, `-` and the empty string all mean the full
    /// range.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "-" || raw == "0" {
            return Ok(Self::full());
        }
        let (start, end) = raw
            .split_once('-')
            .with_context(|| format!("invalid key range {raw}: expected <start>-<end>"))?;
        let start = hex::decode(start).with_context(|| format!("invalid key range start in {raw}"))?;
        let end = hex::decode(end).with_context(|| format!("invalid key range end in {raw}"))?;
        let range = Self { start, end };
        if !range.end.is_empty() && range.start_u128() >= range.end_u128() {
            anyhow::bail!("invalid key range {raw}: start must be below end");
        }
        Ok(range)
    }

    /// Builds a range from numeric bounds in the 64-bit id space; `end` of
    /// `1 << 64` is the open upper bound.
    pub fn from_bounds(start: u128, end: u128) -> Self {
        Self {
            start: bound_bytes(start),
            end: if end >= 1u128 << 64 {
                Vec::new()
            } else {
                bound_bytes(end)
            },
        }
    }

    pub fn is_full(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    pub fn contains(&self, id: &KeyspaceId) -> bool {
        let id = id.as_bytes().as_slice();
        if !self.start.is_empty() && id.cmp(self.start.as_slice()) == Ordering::Less {
            return false;
        }
        self.end.is_empty() || id.cmp(self.end.as_slice()) == Ordering::Less
    }

    pub fn start_u128(&self) -> u128 {
        u128::from(prefix_u64(&self.start))
    }

    pub fn end_u128(&self) -> u128 {
        if self.end.is_empty() {
            1u128 << 64
        } else {
            u128::from(prefix_u64(&self.end))
        }
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.start_u128() < other.end_u128() && other.start_u128() < self.end_u128()
    }

    /// True when every id in `other` is also in `self`.
    pub fn covers(&self, other: &KeyRange) -> bool {
        self.start_u128() <= other.start_u128() && other.end_u128() <= self.end_u128()
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_full() {
            return write!(f, "-");
        }
        write!(f, "{}-{}", hex::encode(&self.start), hex::encode(&self.end))
    }
}

/// Right-pads a prefix with zeros to a full 64-bit value.
fn prefix_u64(prefix: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    for (slot, byte) in bytes.iter_mut().zip(prefix.iter()) {
        *slot = *byte;
    }
    u64::from_be_bytes(bytes)
}

fn bound_bytes(value: u128) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut bytes = (value as u64).to_be_bytes().to_vec();
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_names_parse_into_ranges() {
        let low = KeyRange::parse("-80").expect("parse -80");
        let high = KeyRange::parse("80-").expect("parse 80-");
        assert!(low.contains(&KeyspaceId::from_u64(0x7fff_ffff_ffff_ffff)));
        assert!(!low.contains(&KeyspaceId::from_u64(0x8000_0000_0000_0000)));
        assert!(high.contains(&KeyspaceId::from_u64(0x8000_0000_0000_0000)));
        assert!(high.contains(&KeyspaceId::from_u64(u64::MAX)));
        assert!(KeyRange::parse("0").expect("parse 0").is_full());
        assert_eq!(low.to_string(), "-80");
        assert_eq!(high.to_string(), "80-");
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        assert!(KeyRange::parse("80-40").is_err());
        assert!(KeyRange::parse("zz-").is_err());
    }

    #[test]
    fn overlap_and_cover_use_numeric_bounds() {
        let quarter = KeyRange::parse("40-80").expect("parse");
        let low = KeyRange::parse("-80").expect("parse");
        let high = KeyRange::parse("80-").expect("parse");
        assert!(low.covers(&quarter));
        assert!(low.overlaps(&quarter));
        assert!(!high.overlaps(&quarter));
        assert_eq!(KeyRange::from_bounds(0x40 << 56, 0x80 << 56), quarter);
        assert_eq!(KeyRange::from_bounds(0x80 << 56, 1 << 64), high);
    }

    #[test]
    fn keyspace_id_hex_round_trip() {
        let id = KeyspaceId::from_u64(0x166b_40b4_4aba_4bd6);
        assert_eq!(id.to_string(), "166b40b44aba4bd6");
        assert_eq!(KeyspaceId::from_hex("166b40b44aba4bd6").expect("hex"), id);
        assert!(KeyspaceId::from_hex("0102").is_err());
    }
}
