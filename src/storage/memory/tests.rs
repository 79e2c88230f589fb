use super::*;
use crate::codec::Value;
use crate::event::EventId;
use chrono::Utc;
use futures::TryStreamExt;

fn aggregate_id(seed: u8) -> AggregateId {
    AggregateId::new([seed; 13])
}

fn make_event(id: AggregateId, version: u32, event_type: u32) -> Event {
    Event {
        id: EventId::generate(),
        event_type,
        aggregate: AggregateRef::new(id, version),
        body: Some(Value::Int(version as i64)),
        meta: Default::default(),
        timestamp: Utc::now(),
    }
}

fn make_batch(id: AggregateId, first_version: u32, count: u32) -> NewEvents {
    let events = (0..count)
        .map(|i| make_event(id, first_version + i, 1))
        .collect();
    NewEvents {
        aggregate: AggregateRef::new(id, first_version),
        timestamp: Utc::now(),
        events,
    }
}

async fn collect(store: &MemoryStore, query: EventQuery) -> Vec<Event> {
    store
        .list_events(query)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap()
}

#[tokio::test]
async fn append_then_list_in_version_order() {
    let store = MemoryStore::new();
    let id = aggregate_id(1);

    store.save_events(make_batch(id, 1, 3)).await.unwrap();

    let events = collect(
        &store,
        EventQuery {
            aggregate: Some(AggregateQuery { id, version: None }),
            event_type: None,
        },
    )
    .await;

    let versions: Vec<u32> = events.iter().map(|e| e.aggregate.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
}

#[tokio::test]
async fn listing_lower_bound_is_exclusive() {
    let store = MemoryStore::new();
    let id = aggregate_id(2);
    store.save_events(make_batch(id, 1, 5)).await.unwrap();

    let events = collect(
        &store,
        EventQuery {
            aggregate: Some(AggregateQuery::new(id, 3)),
            event_type: None,
        },
    )
    .await;

    let versions: Vec<u32> = events.iter().map(|e| e.aggregate.version).collect();
    assert_eq!(versions, vec![4, 5]);
}

#[tokio::test]
async fn listing_is_restartable() {
    let store = MemoryStore::new();
    let id = aggregate_id(3);
    store.save_events(make_batch(id, 1, 2)).await.unwrap();

    let query = EventQuery {
        aggregate: Some(AggregateQuery { id, version: None }),
        event_type: None,
    };
    let first = collect(&store, query).await;
    let second = collect(&store, query).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn listing_filters_by_event_type() {
    let store = MemoryStore::new();
    let id = aggregate_id(4);
    let events = vec![make_event(id, 1, 10), make_event(id, 2, 20)];
    store
        .save_events(NewEvents {
            aggregate: AggregateRef::new(id, 1),
            timestamp: Utc::now(),
            events,
        })
        .await
        .unwrap();

    let filtered = collect(
        &store,
        EventQuery {
            aggregate: Some(AggregateQuery { id, version: None }),
            event_type: Some(20),
        },
    )
    .await;
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].event_type, 20);
}

#[tokio::test]
async fn stale_version_claim_conflicts() {
    let store = MemoryStore::new();
    let id = aggregate_id(5);
    store.save_events(make_batch(id, 1, 3)).await.unwrap();

    // Claims version 2, but the log already ends at 3.
    let err = store.save_events(make_batch(id, 2, 1)).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::VersionConflict { version: 2, .. }
    ));
}

#[tokio::test]
async fn version_gap_is_rejected() {
    let store = MemoryStore::new();
    let id = aggregate_id(6);
    store.save_events(make_batch(id, 1, 1)).await.unwrap();

    let err = store.save_events(make_batch(id, 5, 1)).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidArgument(_)));
}

#[tokio::test]
async fn save_preconditions_are_enforced() {
    let store = MemoryStore::new();
    let id = aggregate_id(7);

    let err = store.save_events(make_batch(id, 0, 1)).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidArgument(_)));

    let err = store
        .save_events(NewEvents {
            aggregate: AggregateRef::new(id, 1),
            timestamp: Utc::now(),
            events: vec![],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidArgument(_)));
}

#[tokio::test]
async fn finalized_aggregates_reject_appends() {
    let store = MemoryStore::new();
    let id = aggregate_id(8);
    store.save_events(make_batch(id, 1, 1)).await.unwrap();

    store.finalize_aggregate(id).await.unwrap();
    // Idempotent.
    store.finalize_aggregate(id).await.unwrap();

    let err = store.save_events(make_batch(id, 2, 1)).await.unwrap_err();
    assert!(matches!(err, StorageError::AggregateFinalized(_)));
}

#[tokio::test]
async fn snapshot_lookup_is_strictly_greater() {
    let store = MemoryStore::new();
    let id = aggregate_id(9);

    for version in [10, 20] {
        store
            .save_snapshot(Snapshot {
                aggregate: AggregateRef::new(id, version),
                state: vec![version as u8],
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
    }

    let found = store
        .find_latest_snapshot(&AggregateQuery::new(id, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.aggregate.version, 20);

    // A caller already at version 20 does not advance.
    let none = store
        .find_latest_snapshot(&AggregateQuery::new(id, 20))
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn checkpoint_semantics_gate_duplicates() {
    let store = MemoryStore::new();
    let id = aggregate_id(10);
    let fresh = AggregateRef::new(id, 3);

    // No checkpoint yet: process.
    assert!(store
        .check_projection_checkpoint("proj", fresh)
        .await
        .unwrap());

    store
        .save_projection_checkpoint("proj", fresh)
        .await
        .unwrap();

    // Redelivery of the same or an older version: skip.
    assert!(!store
        .check_projection_checkpoint("proj", fresh)
        .await
        .unwrap());
    assert!(!store
        .check_projection_checkpoint("proj", AggregateRef::new(id, 2))
        .await
        .unwrap());

    // The next version processes; other projections are independent.
    assert!(store
        .check_projection_checkpoint("proj", AggregateRef::new(id, 4))
        .await
        .unwrap());
    assert!(store
        .check_projection_checkpoint("other", fresh)
        .await
        .unwrap());
}

#[tokio::test]
async fn injected_conflict_reveals_competing_event() {
    let store = MemoryStore::new();
    let id = aggregate_id(11);
    store.save_events(make_batch(id, 1, 4)).await.unwrap();

    store
        .set_conflict_on_next_save(make_event(id, 5, 1))
        .await;

    let err = store.save_events(make_batch(id, 5, 1)).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::VersionConflict { version: 5, .. }
    ));

    // The competing writer's event is now visible, and the next append lands
    // at version 6.
    let events = store.events_for(id).await;
    assert_eq!(events.last().unwrap().aggregate.version, 5);
    store.save_events(make_batch(id, 6, 1)).await.unwrap();
}
