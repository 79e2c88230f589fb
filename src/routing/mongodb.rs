//! MongoDB StreamRegistry implementation.
//!
//! Registrations live in the `streams` collection; the multikey index on
//! `events` serves the reverse lookup. Lookups are cached in a bounded TTL
//! map. There is no cache invalidation on `save_stream`: a new registration
//! may take up to the cache TTL to become visible to a running broker.
//! Empty lookups are not cached, so a first registration for a type is
//! picked up on the next miss.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::UpdateOptions;
use mongodb::{Client, Collection, IndexModel};
use tokio::sync::RwLock;
use tracing::debug;

use super::{Result, StreamRegistration, StreamRegistry};

const STREAMS_COLLECTION: &str = "streams";

struct CacheEntry {
    streams: Vec<String>,
    inserted: Instant,
}

/// MongoDB-backed registry with a bounded TTL lookup cache.
pub struct MongoStreamRegistry {
    streams: Collection<Document>,
    cache: RwLock<HashMap<u32, CacheEntry>>,
    cache_max: usize,
    cache_ttl: Duration,
}

impl MongoStreamRegistry {
    /// Create a new MongoDB stream registry.
    pub async fn new(
        client: &Client,
        database_name: &str,
        cache_max: usize,
        cache_ttl: Duration,
    ) -> Result<Self> {
        let streams = client.database(database_name).collection(STREAMS_COLLECTION);

        let registry = Self {
            streams,
            cache: RwLock::new(HashMap::new()),
            cache_max,
            cache_ttl,
        };
        registry.init().await?;

        Ok(registry)
    }

    /// Initialize indexes. The `events` index is multikey: one entry per
    /// array element, serving the array-contains lookup.
    async fn init(&self) -> Result<()> {
        let index = IndexModel::builder().keys(doc! { "events": 1 }).build();
        self.streams.create_index(index).await?;
        Ok(())
    }

    async fn cached(&self, event_type: u32) -> Option<Vec<String>> {
        let cache = self.cache.read().await;
        cache.get(&event_type).and_then(|entry| {
            (entry.inserted.elapsed() < self.cache_ttl).then(|| entry.streams.clone())
        })
    }

    async fn insert_cache(&self, event_type: u32, streams: Vec<String>) {
        let mut cache = self.cache.write().await;
        // Expired entries first, then the oldest live one if still over cap.
        let ttl = self.cache_ttl;
        cache.retain(|_, entry| entry.inserted.elapsed() < ttl);
        if cache.len() >= self.cache_max {
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(key, _)| *key)
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            event_type,
            CacheEntry {
                streams,
                inserted: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl StreamRegistry for MongoStreamRegistry {
    async fn save_stream(&self, registration: StreamRegistration) -> Result<()> {
        let events: Vec<Bson> = registration
            .events
            .iter()
            .map(|&event_type| Bson::Int64(event_type as i64))
            .collect();

        let update = doc! {
            "$set": {
                "events": events,
                "timestamp": mongodb::bson::DateTime::from_millis(
                    registration.timestamp.timestamp_millis(),
                ),
            }
        };

        self.streams
            .update_one(doc! { "_id": &registration.id }, update)
            .with_options(UpdateOptions::builder().upsert(true).build())
            .await?;

        Ok(())
    }

    async fn find_streams(&self, event_type: u32) -> Result<Vec<String>> {
        if let Some(streams) = self.cached(event_type).await {
            return Ok(streams);
        }

        let mut cursor = self
            .streams
            .find(doc! { "events": event_type as i64 })
            .await?;

        let mut streams = Vec::new();
        while cursor.advance().await? {
            let doc = cursor.deserialize_current()?;
            if let Some(Bson::String(id)) = doc.get("_id") {
                streams.push(id.clone());
            }
        }
        streams.sort();

        // No negative caching: an empty result stays a cache miss so newly
        // registered streams are seen on the next lookup.
        if !streams.is_empty() {
            self.insert_cache(event_type, streams.clone()).await;
        } else {
            debug!(event_type, "No streams registered for event type");
        }

        Ok(streams)
    }
}
