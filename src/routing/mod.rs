//! Stream routing: which subscriber streams are interested in which event
//! types.
//!
//! Projections register their stream and the set of event types they handle;
//! the broker reverse-looks-up registrations by event type when fanning out
//! from the ingress stream.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::{Config, StorageType};

pub mod memory;
pub mod mongodb;

pub use memory::MemoryStreamRegistry;
pub use mongodb::MongoStreamRegistry;

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("MongoDB error: {0}")]
    Mongo(#[from] ::mongodb::error::Error),

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),
}

/// A subscriber stream's declared event-type interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRegistration {
    /// Subscriber topic name.
    pub id: String,
    /// Event types routed to this stream.
    pub events: Vec<u32>,
    pub timestamp: DateTime<Utc>,
}

impl StreamRegistration {
    pub fn new(id: impl Into<String>, events: Vec<u32>) -> Self {
        Self {
            id: id.into(),
            events,
            timestamp: Utc::now(),
        }
    }
}

/// Interface for stream-interest registration and reverse lookup.
#[async_trait]
pub trait StreamRegistry: Send + Sync {
    /// Upsert a registration keyed by its stream id.
    async fn save_stream(&self, registration: StreamRegistration) -> Result<()>;

    /// Every registered stream whose event set contains `event_type`.
    async fn find_streams(&self, event_type: u32) -> Result<Vec<String>>;
}

/// Initialize a stream registry based on configuration.
pub async fn init_registry(
    config: &Config,
) -> std::result::Result<Arc<dyn StreamRegistry>, Box<dyn std::error::Error + Send + Sync>> {
    match config.storage.storage_type {
        StorageType::Memory => {
            info!("Stream registry: memory");
            Ok(Arc::new(MemoryStreamRegistry::new()))
        }
        StorageType::Mongodb => {
            info!(
                uri = %config.storage.mongodb.uri,
                database = %config.storage.mongodb.database,
                "Stream registry: mongodb"
            );
            let client = ::mongodb::Client::with_uri_str(&config.storage.mongodb.uri).await?;
            let registry = MongoStreamRegistry::new(
                &client,
                &config.storage.mongodb.database,
                config.cache.max_entries,
                config.cache.ttl(),
            )
            .await?;
            Ok(Arc::new(registry))
        }
    }
}
