//! Core event types: identifiers, aggregate references, and the event record.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use base64::prelude::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::Value;

/// Errors from parsing identifiers out of external representations.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("Invalid id length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Invalid base64 encoding: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

/// Per-process entropy baked into every generated [`EventId`].
fn process_entropy() -> &'static [u8; 5] {
    static ENTROPY: OnceLock<[u8; 5]> = OnceLock::new();
    ENTROPY.get_or_init(rand::random)
}

/// 96-bit event identifier with a time-sortable prefix.
///
/// Layout: 4-byte big-endian unix seconds, 5 bytes of per-process entropy,
/// 3-byte big-endian counter. Byte order equals generation order within a
/// process for ids minted in the same second, and is monotonic-ish across
/// processes. Round-trips losslessly through bytes, hex, and base64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId([u8; 12]);

impl EventId {
    /// Generate a fresh id stamped with the current second.
    pub fn generate() -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let count = COUNTER.fetch_add(1, Ordering::Relaxed);

        let seconds = Utc::now().timestamp() as u32;
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..9].copy_from_slice(process_entropy());
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        let bytes: [u8; 12] = bytes.try_into().map_err(|_| IdError::InvalidLength {
            expected: 12,
            actual: bytes.len(),
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        Self::from_bytes(&hex::decode(s)?)
    }

    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, IdError> {
        Self::from_bytes(&BASE64_STANDARD.decode(s)?)
    }

    /// Unix seconds encoded in the id prefix.
    pub fn timestamp_secs(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// 13-byte aggregate identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateId([u8; 13]);

impl AggregateId {
    pub fn new(bytes: [u8; 13]) -> Self {
        Self(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        let bytes: [u8; 13] = bytes.try_into().map_err(|_| IdError::InvalidLength {
            expected: 13,
            actual: bytes.len(),
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 13] {
        &self.0
    }

    /// Base64 rendering, used as the aggregate cache key.
    pub fn to_base64(&self) -> String {
        BASE64_STANDARD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, IdError> {
        Self::from_bytes(&BASE64_STANDARD.decode(s)?)
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A (aggregate id, version) pair.
///
/// Versions are strictly monotonic per aggregate, starting at 1 with no gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRef {
    pub id: AggregateId,
    pub version: u32,
}

impl AggregateRef {
    pub fn new(id: AggregateId, version: u32) -> Self {
        Self { id, version }
    }
}

/// Event metadata. The partition key, when present, lives at `"__ctx"`.
pub type Meta = BTreeMap<String, Value>;

/// Metadata key carrying the partition key across the stream and broker.
pub const CTX_META_KEY: &str = "__ctx";

/// An immutable fact appended to an aggregate's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: u32,
    pub aggregate: AggregateRef,
    pub body: Option<Value>,
    pub meta: Meta,
    pub timestamp: DateTime<Utc>,
}

/// A cached fold of events `1..=aggregate.version`.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub aggregate: AggregateRef,
    pub state: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_round_trips_through_bytes_hex_base64() {
        let id = EventId::generate();

        assert_eq!(EventId::from_bytes(id.as_bytes()).unwrap(), id);
        assert_eq!(EventId::from_hex(&id.to_hex()).unwrap(), id);
        assert_eq!(EventId::from_base64(&id.to_base64()).unwrap(), id);
    }

    #[test]
    fn event_id_generation_is_unique_and_sorted_within_a_second() {
        let a = EventId::generate();
        let b = EventId::generate();

        assert_ne!(a, b);
        if a.timestamp_secs() == b.timestamp_secs() {
            assert!(a < b, "ids minted in the same second must sort by counter");
        }
    }

    #[test]
    fn event_id_prefix_is_the_generation_second() {
        let before = Utc::now().timestamp() as u32;
        let id = EventId::generate();
        let after = Utc::now().timestamp() as u32;

        assert!(id.timestamp_secs() >= before && id.timestamp_secs() <= after);
    }

    #[test]
    fn event_id_rejects_wrong_length() {
        let err = EventId::from_bytes(&[0u8; 5]).unwrap_err();
        assert!(matches!(
            err,
            IdError::InvalidLength {
                expected: 12,
                actual: 5
            }
        ));
    }

    #[test]
    fn aggregate_id_round_trips_through_base64() {
        let id = AggregateId::new([7u8; 13]);
        assert_eq!(AggregateId::from_base64(&id.to_base64()).unwrap(), id);
    }

    #[test]
    fn aggregate_id_rejects_wrong_length() {
        assert!(AggregateId::from_bytes(&[0u8; 16]).is_err());
    }
}
