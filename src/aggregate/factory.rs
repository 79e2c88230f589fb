//! Bounded cache of live aggregates.
//!
//! Keyed by the base64 aggregate id. Entries hold the in-flight construction
//! so simultaneous loads of one id share a single reload; a failed
//! construction evicts the entry and the next caller retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use super::{Aggregate, AggregateDefinition, AggregateError, Result, SnapshotWriter};
use crate::bus::EventBus;
use crate::config::AggregateConfig;
use crate::event::AggregateId;
use crate::storage::Store;

/// Options for [`AggregateFactory::load`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Return the cached instance without reloading it first.
    pub no_reload: bool,
}

struct CacheEntry<S> {
    cell: Arc<OnceCell<Arc<Aggregate<S>>>>,
    last_access: Instant,
}

/// Factory and bounded in-memory cache of live aggregates.
pub struct AggregateFactory<S> {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    definition: Arc<AggregateDefinition<S>>,
    snapshots: Arc<SnapshotWriter>,
    cache_max: usize,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry<S>>>,
}

impl<S> AggregateFactory<S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a factory with the default cache bounds.
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        definition: AggregateDefinition<S>,
    ) -> Self {
        Self::with_config(store, bus, definition, &AggregateConfig::default())
    }

    /// Create a factory with configured cache bounds.
    pub fn with_config(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        definition: AggregateDefinition<S>,
        config: &AggregateConfig,
    ) -> Self {
        let snapshots = Arc::new(SnapshotWriter::new(store.clone()));
        Self {
            store,
            bus,
            definition: Arc::new(definition),
            snapshots,
            cache_max: config.cache_max,
            cache_ttl: config.cache_ttl(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Load an aggregate by id.
    ///
    /// Returns the cached instance (reloading it first unless suppressed) or
    /// constructs one, memoizing the in-flight construction so simultaneous
    /// loads of the same id share it.
    pub async fn load(&self, id: AggregateId, options: LoadOptions) -> Result<Arc<Aggregate<S>>> {
        let key = id.to_base64();

        let cell = {
            let mut cache = self.cache.lock().await;
            let ttl = self.cache_ttl;
            cache.retain(|_, entry| entry.last_access.elapsed() < ttl);

            let entry = cache.entry(key.clone()).or_insert_with(|| CacheEntry {
                cell: Arc::new(OnceCell::new()),
                last_access: Instant::now(),
            });
            entry.last_access = Instant::now();
            let cell = entry.cell.clone();

            if cache.len() > self.cache_max {
                let oldest = cache
                    .iter()
                    .filter(|(cached_key, _)| **cached_key != key)
                    .min_by_key(|(_, entry)| entry.last_access)
                    .map(|(cached_key, _)| cached_key.clone());
                if let Some(oldest) = oldest {
                    debug!(evicted = %oldest, "Aggregate cache over capacity");
                    cache.remove(&oldest);
                }
            }

            cell
        };

        let mut constructed = false;
        let result = cell
            .get_or_try_init(|| async {
                constructed = true;
                let aggregate = Arc::new(Aggregate::new(
                    id,
                    self.store.clone(),
                    self.bus.clone(),
                    self.definition.clone(),
                    self.snapshots.clone(),
                ));
                aggregate.reload().await?;
                Ok::<_, AggregateError>(aggregate)
            })
            .await;

        let aggregate = match result {
            Ok(aggregate) => aggregate.clone(),
            Err(error) => {
                // Evict so the next caller retries the construction.
                let mut cache = self.cache.lock().await;
                if let Some(entry) = cache.get(&key) {
                    if Arc::ptr_eq(&entry.cell, &cell) {
                        cache.remove(&key);
                    }
                }
                return Err(error);
            }
        };

        if !constructed && !options.no_reload {
            aggregate.reload().await?;
        }

        Ok(aggregate)
    }

    /// Number of cached aggregates.
    pub async fn cached_count(&self) -> usize {
        self.cache.lock().await.len()
    }
}
