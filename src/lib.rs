//! Arque - event-sourcing runtime.
//!
//! Persists domain state as an ordered, immutable log of events per
//! aggregate, reconstructs state on demand, serializes concurrent writers
//! through optimistic version control, emits events onto a pub/sub stream,
//! and runs projections that consume the resulting stream with at-least-once
//! delivery and per-projection idempotent checkpointing.
//!
//! | Component | Role |
//! |-----------|------|
//! | [`AggregateFactory`] / [`Aggregate`] | Command -> event processing, replay, snapshots, conflict retry |
//! | [`Store`] | Append-only event log, snapshots, checkpoints, finality |
//! | [`EventBus`] | Ordered per-key transport over named streams |
//! | [`StreamRegistry`] | Event-type -> subscriber-stream routing table |
//! | [`Broker`] | Fan-out from the `main` ingress stream to subscriber streams |
//! | [`Projection`] | Checkpointed at-least-once consumer |
//!
//! Construct the adapters first, then projections (whose `start` registers
//! their streams), then start the broker. Aggregates publish every persisted
//! batch to the `main` stream; the broker duplicates each event onto the
//! streams whose registered type set contains the event's type.

pub mod aggregate;
pub mod broker;
pub mod bus;
pub mod codec;
pub mod config;
pub mod event;
pub mod projection;
pub mod routing;
pub mod storage;
pub mod utils;

pub use aggregate::{
    Aggregate, AggregateDefinition, AggregateError, AggregateFactory, AggregateOptions, Command,
    CommandContext, DomainError, EventDraft, LoadOptions, ProcessOptions,
};
pub use broker::Broker;
pub use bus::{
    init_bus, EventBus, EventHandler, Incoming, RawBatch, RawEvent, SendBatch, SubscribeMode,
    SubscribeOptions, Subscriber, MAIN_STREAM,
};
pub use codec::Value;
pub use config::Config;
pub use event::{AggregateId, AggregateRef, Event, EventId, Meta, Snapshot, CTX_META_KEY};
pub use projection::{Projection, ProjectionError, ProjectionHandler, ProjectionOptions};
pub use routing::{init_registry, StreamRegistration, StreamRegistry};
pub use storage::{init_store, AggregateQuery, EventQuery, NewEvents, StorageError, Store};
