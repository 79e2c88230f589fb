//! MongoDB storage integration tests.
//!
//! Run with: cargo test --test storage_mongodb -- --ignored --nocapture
//!
//! Requires: MONGODB_URI env var or a MongoDB replica set on localhost:27017
//! (transactions need a replica set).

use std::collections::BTreeMap;

use arque::storage::{AggregateQuery, EventQuery, MongoStore, NewEvents};
use arque::{AggregateId, AggregateRef, Event, EventId, Snapshot, StorageError, Store, Value};
use chrono::Utc;
use futures::TryStreamExt;

fn mongodb_uri() -> String {
    std::env::var("MONGODB_URI").unwrap_or_else(|_| "mongodb://localhost:27017".to_string())
}

fn mongodb_database() -> String {
    std::env::var("MONGODB_DATABASE").unwrap_or_else(|_| "arque_test".to_string())
}

async fn connect() -> MongoStore {
    let client = mongodb::Client::with_uri_str(&mongodb_uri())
        .await
        .expect("Failed to connect to MongoDB");
    MongoStore::new(&client, &mongodb_database())
        .await
        .expect("Failed to create store")
}

/// Clean up test data.
async fn cleanup(db_name: &str) {
    let client = mongodb::Client::with_uri_str(&mongodb_uri())
        .await
        .expect("Failed to connect to MongoDB");
    let db = client.database(db_name);
    for collection in ["events", "aggregates", "snapshots", "projection_checkpoints"] {
        let _ = db
            .collection::<mongodb::bson::Document>(collection)
            .drop()
            .await;
    }
}

fn fresh_id() -> AggregateId {
    // Unique per test run so reruns against a dirty database stay isolated.
    let mut bytes = [0u8; 13];
    bytes[..12].copy_from_slice(EventId::generate().as_bytes());
    AggregateId::new(bytes)
}

fn make_event(id: AggregateId, version: u32, event_type: u32) -> Event {
    let mut body = BTreeMap::new();
    body.insert("version".to_string(), Value::Int(version as i64));
    Event {
        id: EventId::generate(),
        event_type,
        aggregate: AggregateRef::new(id, version),
        body: Some(Value::Map(body)),
        meta: Default::default(),
        timestamp: Utc::now(),
    }
}

fn make_batch(id: AggregateId, first_version: u32, count: u32) -> NewEvents {
    NewEvents {
        aggregate: AggregateRef::new(id, first_version),
        timestamp: Utc::now(),
        events: (0..count)
            .map(|i| make_event(id, first_version + i, 7))
            .collect(),
    }
}

#[tokio::test]
#[ignore = "requires running MongoDB replica set"]
async fn mongodb_append_list_round_trip() {
    let store = connect().await;
    let id = fresh_id();

    store.save_events(make_batch(id, 1, 3)).await.unwrap();

    let events: Vec<Event> = store
        .list_events(EventQuery {
            aggregate: Some(AggregateQuery { id, version: None }),
            event_type: None,
        })
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let versions: Vec<u32> = events.iter().map(|e| e.aggregate.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(events[0].event_type, 7);

    cleanup(&mongodb_database()).await;
}

#[tokio::test]
#[ignore = "requires running MongoDB replica set"]
async fn mongodb_stale_append_conflicts() {
    let store = connect().await;
    let id = fresh_id();

    store.save_events(make_batch(id, 1, 2)).await.unwrap();

    let err = store.save_events(make_batch(id, 2, 1)).await.unwrap_err();
    assert!(matches!(err, StorageError::VersionConflict { .. }));

    cleanup(&mongodb_database()).await;
}

#[tokio::test]
#[ignore = "requires running MongoDB replica set"]
async fn mongodb_finalized_aggregates_reject_appends() {
    let store = connect().await;
    let id = fresh_id();

    store.save_events(make_batch(id, 1, 1)).await.unwrap();
    store.finalize_aggregate(id).await.unwrap();
    store.finalize_aggregate(id).await.unwrap();

    let err = store.save_events(make_batch(id, 2, 1)).await.unwrap_err();
    assert!(matches!(err, StorageError::AggregateFinalized(_)));

    cleanup(&mongodb_database()).await;
}

#[tokio::test]
#[ignore = "requires running MongoDB replica set"]
async fn mongodb_snapshot_lookup_advances() {
    let store = connect().await;
    let id = fresh_id();

    for version in [10u32, 20] {
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
        .expect("snapshot should exist");
    assert_eq!(found.aggregate.version, 20);
    assert_eq!(found.state, vec![20]);

    assert!(store
        .find_latest_snapshot(&AggregateQuery::new(id, 20))
        .await
        .unwrap()
        .is_none());

    cleanup(&mongodb_database()).await;
}

#[tokio::test]
#[ignore = "requires running MongoDB replica set"]
async fn mongodb_checkpoints_gate_duplicates() {
    let store = connect().await;
    let id = fresh_id();
    let aggregate = AggregateRef::new(id, 3);

    assert!(store
        .check_projection_checkpoint("proj", aggregate)
        .await
        .unwrap());

    store
        .save_projection_checkpoint("proj", aggregate)
        .await
        .unwrap();

    assert!(!store
        .check_projection_checkpoint("proj", aggregate)
        .await
        .unwrap());
    assert!(store
        .check_projection_checkpoint("proj", AggregateRef::new(id, 4))
        .await
        .unwrap());

    cleanup(&mongodb_database()).await;
}
