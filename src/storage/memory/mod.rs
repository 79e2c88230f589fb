//! In-memory Store implementation.
//!
//! Backs tests and embedded single-process deployments. Exposes call
//! counters and failure-injection knobs so orchestration tests can assert
//! store traffic and simulate concurrent writers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock};

use crate::event::{AggregateId, AggregateRef, Event, Snapshot};
use crate::storage::{
    validate_new_events, AggregateQuery, EventQuery, EventStream, NewEvents, Result, Store,
    StorageError,
};

#[derive(Debug, Clone, Copy, Default)]
struct AggregateRecord {
    version: u32,
    finalized: bool,
}

#[derive(Default)]
struct Inner {
    aggregates: HashMap<AggregateId, AggregateRecord>,
    // Keyed by (aggregate_id, version): iteration order is the listing order.
    events: BTreeMap<(AggregateId, u32), Event>,
    snapshots: BTreeMap<(AggregateId, u32), Snapshot>,
    checkpoints: HashMap<(String, AggregateId), u32>,
    // Competing event injected at the next save, simulating a writer that won
    // the race: the save fails with a version conflict and the competing
    // event becomes visible to subsequent listings.
    conflict_on_next_save: Option<Event>,
    fail_on_save: bool,
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    // At most one snapshot write in flight per adapter instance.
    snapshot_gate: Mutex<()>,
    save_events_calls: AtomicUsize,
    list_events_calls: AtomicUsize,
    save_snapshot_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `save_events` fail with a version conflict, as if
    /// `competing` had been appended by another writer in between.
    pub async fn set_conflict_on_next_save(&self, competing: Event) {
        self.inner.write().await.conflict_on_next_save = Some(competing);
    }

    /// Make every `save_events` fail with a transient error.
    pub async fn set_fail_on_save(&self, fail: bool) {
        self.inner.write().await.fail_on_save = fail;
    }

    pub fn save_events_calls(&self) -> usize {
        self.save_events_calls.load(Ordering::SeqCst)
    }

    pub fn list_events_calls(&self) -> usize {
        self.list_events_calls.load(Ordering::SeqCst)
    }

    pub fn save_snapshot_calls(&self) -> usize {
        self.save_snapshot_calls.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.save_events_calls.store(0, Ordering::SeqCst);
        self.list_events_calls.store(0, Ordering::SeqCst);
        self.save_snapshot_calls.store(0, Ordering::SeqCst);
    }

    /// All stored events for an aggregate, in version order.
    pub async fn events_for(&self, id: AggregateId) -> Vec<Event> {
        let inner = self.inner.read().await;
        inner
            .events
            .range((id, 0)..=(id, u32::MAX))
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// All stored snapshots for an aggregate, in version order.
    pub async fn snapshots_for(&self, id: AggregateId) -> Vec<Snapshot> {
        let inner = self.inner.read().await;
        inner
            .snapshots
            .range((id, 0)..=(id, u32::MAX))
            .map(|(_, snapshot)| snapshot.clone())
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_events(&self, batch: NewEvents) -> Result<()> {
        self.save_events_calls.fetch_add(1, Ordering::SeqCst);
        validate_new_events(&batch)?;

        let mut inner = self.inner.write().await;

        if inner.fail_on_save {
            return Err(StorageError::Transient("injected failure".to_string()));
        }

        if let Some(competing) = inner.conflict_on_next_save.take() {
            let record = inner.aggregates.entry(competing.aggregate.id).or_default();
            record.version = competing.aggregate.version;
            inner
                .events
                .insert((competing.aggregate.id, competing.aggregate.version), competing);
            return Err(StorageError::VersionConflict {
                id: batch.aggregate.id,
                version: batch.aggregate.version,
            });
        }

        let record = inner
            .aggregates
            .get(&batch.aggregate.id)
            .copied()
            .unwrap_or_default();
        if record.finalized {
            return Err(StorageError::AggregateFinalized(batch.aggregate.id));
        }
        if record.version >= batch.aggregate.version {
            return Err(StorageError::VersionConflict {
                id: batch.aggregate.id,
                version: batch.aggregate.version,
            });
        }
        if batch.aggregate.version != record.version + 1 {
            return Err(StorageError::InvalidArgument(format!(
                "batch claims version {} but log ends at {}",
                batch.aggregate.version, record.version
            )));
        }

        let last_version = batch.aggregate.version + batch.events.len() as u32 - 1;
        for event in batch.events {
            inner
                .events
                .insert((event.aggregate.id, event.aggregate.version), event);
        }
        let record = inner.aggregates.entry(batch.aggregate.id).or_default();
        record.version = last_version;

        Ok(())
    }

    async fn list_events(&self, query: EventQuery) -> Result<EventStream> {
        self.list_events_calls.fetch_add(1, Ordering::SeqCst);

        let inner = self.inner.read().await;
        let events: Vec<Event> = match query.aggregate {
            Some(selector) => inner
                .events
                .range((selector.id, selector.floor().saturating_add(1))..=(selector.id, u32::MAX))
                .map(|(_, event)| event.clone())
                .collect(),
            None => inner.events.values().cloned().collect(),
        };
        drop(inner);

        let event_type = query.event_type;
        let filtered = events
            .into_iter()
            .filter(move |event| event_type.map_or(true, |t| event.event_type == t))
            .map(Ok);

        Ok(futures::stream::iter(filtered).boxed())
    }

    async fn find_latest_snapshot(&self, query: &AggregateQuery) -> Result<Option<Snapshot>> {
        let inner = self.inner.read().await;
        Ok(inner
            .snapshots
            .range((query.id, query.floor().saturating_add(1))..=(query.id, u32::MAX))
            .next_back()
            .map(|(_, snapshot)| snapshot.clone()))
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let _gate = self.snapshot_gate.lock().await;
        self.save_snapshot_calls.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.inner.write().await;
        inner.snapshots.insert(
            (snapshot.aggregate.id, snapshot.aggregate.version),
            snapshot,
        );
        Ok(())
    }

    async fn save_projection_checkpoint(
        &self,
        projection: &str,
        aggregate: AggregateRef,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .checkpoints
            .insert((projection.to_string(), aggregate.id), aggregate.version);
        Ok(())
    }

    async fn check_projection_checkpoint(
        &self,
        projection: &str,
        aggregate: AggregateRef,
    ) -> Result<bool> {
        let inner = self.inner.read().await;
        let processed = inner
            .checkpoints
            .get(&(projection.to_string(), aggregate.id));
        Ok(!processed.is_some_and(|&version| version >= aggregate.version))
    }

    async fn finalize_aggregate(&self, id: AggregateId) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.aggregates.entry(id).or_default().finalized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
