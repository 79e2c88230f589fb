//! Wire encoding for events.
//!
//! Events travel between the store boundary, the stream, and the broker as a
//! framed binary message with a fixed field layout. Body and metadata are
//! carried as canonical JSON bytes (see [`value`]); raw-mode consumers read
//! the frame header without touching them.
//!
//! The wire timestamp is seconds precision. Stores keep millisecond instants,
//! so a round trip through the stream truncates sub-second information;
//! callers that need milliseconds encode them in body or meta.

mod value;

pub use value::Value;

use chrono::{DateTime, Utc};
use prost::Message;

use crate::event::{AggregateId, AggregateRef, Event, EventId, Meta, CTX_META_KEY};

/// Errors from encoding or decoding the wire frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Frame decode error: {0}")]
    Frame(#[from] prost::DecodeError),

    #[error("Invalid body/meta encoding: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Invalid identifier: {0}")]
    Id(#[from] crate::event::IdError),

    #[error("Invalid timestamp: {0}")]
    Timestamp(i64),
}

/// The framed event layout.
#[derive(Clone, PartialEq, Message)]
pub struct WireEvent {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub event_type: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub aggregate_id: Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub aggregate_version: u32,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub body: Option<Vec<u8>>,
    #[prost(bytes = "vec", tag = "6")]
    pub meta: Vec<u8>,
    /// Unix seconds. Sub-second precision is lost on the wire.
    #[prost(uint32, tag = "7")]
    pub timestamp: u32,
}

/// Encode an event into frame bytes.
pub fn encode_event(event: &Event) -> Result<Vec<u8>, CodecError> {
    let body = match &event.body {
        Some(value) => Some(serde_json::to_vec(value)?),
        None => None,
    };
    let frame = WireEvent {
        id: event.id.as_bytes().to_vec(),
        event_type: event.event_type,
        aggregate_id: event.aggregate.id.as_bytes().to_vec(),
        aggregate_version: event.aggregate.version,
        body,
        meta: serde_json::to_vec(&event.meta)?,
        timestamp: event.timestamp.timestamp() as u32,
    };
    Ok(frame.encode_to_vec())
}

/// Decode frame bytes into an event.
pub fn decode_event(payload: &[u8]) -> Result<Event, CodecError> {
    let frame = WireEvent::decode(payload)?;

    let body = match &frame.body {
        Some(bytes) => Some(serde_json::from_slice(bytes)?),
        None => None,
    };
    let meta: Meta = serde_json::from_slice(&frame.meta)?;
    let timestamp = DateTime::<Utc>::from_timestamp(frame.timestamp as i64, 0)
        .ok_or(CodecError::Timestamp(frame.timestamp as i64))?;

    Ok(Event {
        id: EventId::from_bytes(&frame.id)?,
        event_type: frame.event_type,
        aggregate: AggregateRef {
            id: AggregateId::from_bytes(&frame.aggregate_id)?,
            version: frame.aggregate_version,
        },
        body,
        meta,
        timestamp,
    })
}

/// Read only the frame header of an encoded event.
///
/// The broker routes on the event type without decoding body or meta; this
/// decodes the prost frame (cheap) and leaves the payload fields as bytes.
pub fn peek_frame(payload: &[u8]) -> Result<WireEvent, CodecError> {
    Ok(WireEvent::decode(payload)?)
}

/// Partition key for an event: the canonical bytes of `meta["__ctx"]`.
///
/// Events carrying equal `__ctx` values map to equal keys and therefore land
/// on the same partition in arrival order. Absent `__ctx`, there is no key.
pub fn partition_key(meta: &Meta) -> Option<Vec<u8>> {
    meta.get(CTX_META_KEY)
        .and_then(|ctx| serde_json::to_vec(ctx).ok())
}
