//! Event persistence: append-only log, snapshots, projection checkpoints,
//! and aggregate finalization.
//!
//! Implementations:
//! - [`MemoryStore`]: in-memory storage for tests and embedded use
//! - [`MongoStore`]: MongoDB storage

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tracing::info;

use crate::config::{Config, StorageType};
use crate::event::{AggregateId, AggregateRef, Event, Snapshot};

pub mod memory;
pub mod mongodb;

pub use memory::MemoryStore;
pub use mongodb::MongoStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// A restartable, lazily-produced sequence of events.
///
/// Ordered by `(aggregate_id asc, aggregate_version asc)`. Calling the
/// producing method again yields the same events; the stream is not a live
/// cursor tied to later appends.
pub type EventStream = BoxStream<'static, Result<Event>>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Another writer appended at or past the claimed version.
    #[error("Version conflict: aggregate={id}, version={version}")]
    VersionConflict { id: AggregateId, version: u32 },

    /// The aggregate is frozen; no further events may be appended.
    #[error("Aggregate finalized: {0}")]
    AggregateFinalized(AggregateId),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization/deadlock/write-conflict classes, retried internally.
    #[error("Transient persistence error: {0}")]
    Transient(String),

    #[error("MongoDB error: {0}")]
    Mongo(#[from] ::mongodb::error::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),
}

impl StorageError {
    /// Whether the error belongs to the internally-retried transient class.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// A batch of new events to append.
///
/// `aggregate.version` is the version the first new event will occupy; the
/// caller asserts the log currently ends at `aggregate.version - 1`.
#[derive(Debug, Clone)]
pub struct NewEvents {
    pub aggregate: AggregateRef,
    pub timestamp: DateTime<Utc>,
    pub events: Vec<Event>,
}

/// Selector for event listing and snapshot lookup.
///
/// `version` is the highest version the caller already knows; results are
/// strictly past it. `None` means "from the beginning" (version 0).
#[derive(Debug, Clone, Copy)]
pub struct AggregateQuery {
    pub id: AggregateId,
    pub version: Option<u32>,
}

impl AggregateQuery {
    pub fn new(id: AggregateId, version: u32) -> Self {
        Self {
            id,
            version: Some(version),
        }
    }

    pub(crate) fn floor(&self) -> u32 {
        self.version.unwrap_or(0)
    }
}

/// Filter for [`Store::list_events`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EventQuery {
    pub aggregate: Option<AggregateQuery>,
    pub event_type: Option<u32>,
}

/// Interface for event persistence.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append a batch of events for an aggregate.
    ///
    /// The entire batch is durable or none of it is. Fails with
    /// [`StorageError::AggregateFinalized`] on a frozen aggregate and
    /// [`StorageError::VersionConflict`] when another writer has appended at
    /// or past the claimed version. Transient persistence errors are retried
    /// internally with the store backoff.
    async fn save_events(&self, batch: NewEvents) -> Result<()>;

    /// List events strictly after the query's version, in
    /// `(aggregate_id asc, aggregate_version asc)` order.
    async fn list_events(&self, query: EventQuery) -> Result<EventStream>;

    /// The snapshot with the greatest version strictly greater than the
    /// query's version, or `None`.
    async fn find_latest_snapshot(&self, query: &AggregateQuery) -> Result<Option<Snapshot>>;

    /// Upsert a snapshot keyed by `(aggregate_id, aggregate_version)`.
    ///
    /// At most one snapshot write is in flight per adapter instance.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// Upsert the checkpoint at `(projection, aggregate_id)`, overwriting the
    /// version unconditionally.
    async fn save_projection_checkpoint(
        &self,
        projection: &str,
        aggregate: AggregateRef,
    ) -> Result<()>;

    /// Whether the event at `aggregate.version` should be processed: `true`
    /// when no checkpoint exists at a version `>=` the passed version.
    async fn check_projection_checkpoint(
        &self,
        projection: &str,
        aggregate: AggregateRef,
    ) -> Result<bool>;

    /// Atomically freeze the aggregate and mark its events final. Idempotent.
    async fn finalize_aggregate(&self, id: AggregateId) -> Result<()>;
}

/// Validate the [`Store::save_events`] preconditions.
pub(crate) fn validate_new_events(batch: &NewEvents) -> Result<()> {
    if batch.aggregate.version < 1 {
        return Err(StorageError::InvalidArgument(
            "aggregate version must be >= 1".to_string(),
        ));
    }
    if batch.events.is_empty() {
        return Err(StorageError::InvalidArgument(
            "event batch must be non-empty".to_string(),
        ));
    }
    for (i, event) in batch.events.iter().enumerate() {
        let expected = batch.aggregate.version + i as u32;
        if event.aggregate.id != batch.aggregate.id || event.aggregate.version != expected {
            return Err(StorageError::InvalidArgument(format!(
                "event {i} does not occupy version {expected}"
            )));
        }
    }
    Ok(())
}

/// Initialize storage based on configuration.
pub async fn init_store(
    config: &Config,
) -> std::result::Result<Arc<dyn Store>, Box<dyn std::error::Error + Send + Sync>> {
    match config.storage.storage_type {
        StorageType::Memory => {
            info!("Storage: memory");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageType::Mongodb => {
            info!(
                uri = %config.storage.mongodb.uri,
                database = %config.storage.mongodb.database,
                "Storage: mongodb"
            );
            let client = ::mongodb::Client::with_uri_str(&config.storage.mongodb.uri).await?;
            let store = MongoStore::new(&client, &config.storage.mongodb.database).await?;
            Ok(Arc::new(store))
        }
    }
}
