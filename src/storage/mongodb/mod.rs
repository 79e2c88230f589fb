//! MongoDB Store implementation.
//!
//! Collections: `events`, `aggregates`, `snapshots`, `projection_checkpoints`.
//! Batch appends and finalization run in multi-document transactions, so the
//! deployment must be a replica set. The unique `(aggregate_id,
//! aggregate_version)` index is the optimistic-concurrency backstop:
//! duplicate-key failures surface as version conflicts.

use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{doc, Binary, Bson, Document};
use mongodb::options::{FindOptions, IndexOptions, UpdateOptions};
use mongodb::{Client, ClientSession, Collection, IndexModel};
use tokio::sync::Mutex;

use crate::event::{AggregateId, AggregateRef, Event, EventId, Snapshot};
use crate::storage::{
    validate_new_events, AggregateQuery, EventQuery, EventStream, NewEvents, Result, Store,
    StorageError,
};
use crate::utils::retry::{run_with_retry, store_backoff, RetryOutcome, RetryableOperation};

const EVENTS_COLLECTION: &str = "events";
const AGGREGATES_COLLECTION: &str = "aggregates";
const SNAPSHOTS_COLLECTION: &str = "snapshots";
const CHECKPOINTS_COLLECTION: &str = "projection_checkpoints";

/// MongoDB write-conflict server error code.
const WRITE_CONFLICT: i32 = 112;

/// MongoDB implementation of [`Store`].
pub struct MongoStore {
    client: Client,
    events: Collection<Document>,
    aggregates: Collection<Document>,
    snapshots: Collection<Document>,
    checkpoints: Collection<Document>,
    // At most one snapshot write in flight per adapter instance.
    snapshot_gate: Mutex<()>,
}

fn bin(bytes: &[u8]) -> Binary {
    Binary {
        subtype: BinarySubtype::Generic,
        bytes: bytes.to_vec(),
    }
}

impl MongoStore {
    /// Create a new MongoDB store and initialize its indexes.
    pub async fn new(client: &Client, database_name: &str) -> Result<Self> {
        let database = client.database(database_name);
        let store = Self {
            client: client.clone(),
            events: database.collection(EVENTS_COLLECTION),
            aggregates: database.collection(AGGREGATES_COLLECTION),
            snapshots: database.collection(SNAPSHOTS_COLLECTION),
            checkpoints: database.collection(CHECKPOINTS_COLLECTION),
            snapshot_gate: Mutex::new(()),
        };
        store.init().await?;
        Ok(store)
    }

    /// Initialize indexes.
    async fn init(&self) -> Result<()> {
        // Unique compound index: the per-aggregate version uniqueness invariant.
        let index = IndexModel::builder()
            .keys(doc! { "aggregate_id": 1, "aggregate_version": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.events.create_index(index).await?;

        let aggregate_index = IndexModel::builder().keys(doc! { "aggregate_id": 1 }).build();
        self.events.create_index(aggregate_index).await?;

        let type_index = IndexModel::builder()
            .keys(doc! { "type": 1, "timestamp": -1 })
            .build();
        self.events.create_index(type_index).await?;

        let snapshot_index = IndexModel::builder()
            .keys(doc! { "aggregate_id": 1, "aggregate_version": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.snapshots.create_index(snapshot_index).await?;

        let checkpoint_index = IndexModel::builder()
            .keys(doc! { "projection": 1, "aggregate_id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.checkpoints.create_index(checkpoint_index).await?;

        Ok(())
    }

    async fn save_events_txn(&self, batch: &NewEvents) -> Result<()> {
        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;

        let result = self.save_events_in_session(batch, &mut session).await;
        match result {
            Ok(()) => {
                session.commit_transaction().await?;
                Ok(())
            }
            Err(err) => {
                let _ = session.abort_transaction().await;
                Err(err)
            }
        }
    }

    async fn save_events_in_session(
        &self,
        batch: &NewEvents,
        session: &mut ClientSession,
    ) -> Result<()> {
        let id_bin = bin(batch.aggregate.id.as_bytes());

        let record = self
            .aggregates
            .find_one(doc! { "_id": &id_bin })
            .session(&mut *session)
            .await?;

        let current_version = match &record {
            Some(doc) => {
                if doc.get_bool("final").unwrap_or(false) {
                    return Err(StorageError::AggregateFinalized(batch.aggregate.id));
                }
                doc.get_i64("version").unwrap_or(0) as u32
            }
            None => 0,
        };

        if current_version >= batch.aggregate.version {
            return Err(StorageError::VersionConflict {
                id: batch.aggregate.id,
                version: batch.aggregate.version,
            });
        }
        if batch.aggregate.version != current_version + 1 {
            return Err(StorageError::InvalidArgument(format!(
                "batch claims version {} but log ends at {}",
                batch.aggregate.version, current_version
            )));
        }

        let docs = batch
            .events
            .iter()
            .map(event_to_doc)
            .collect::<Result<Vec<_>>>()?;
        self.events
            .insert_many(docs)
            .session(&mut *session)
            .await
            .map_err(|e| classify_write_error(e, batch.aggregate))?;

        let last_version = batch.aggregate.version + batch.events.len() as u32 - 1;
        let update = doc! {
            "$set": {
                "version": last_version as i64,
                "timestamp": mongodb::bson::DateTime::from_millis(batch.timestamp.timestamp_millis()),
            },
            "$setOnInsert": { "final": false },
        };
        self.aggregates
            .update_one(doc! { "_id": &id_bin }, update)
            .with_options(UpdateOptions::builder().upsert(true).build())
            .session(&mut *session)
            .await
            .map_err(|e| classify_write_error(e, batch.aggregate))?;

        Ok(())
    }
}

/// State for a retryable event append.
struct SaveEventsOperation<'a> {
    store: &'a MongoStore,
    batch: &'a NewEvents,
}

#[async_trait]
impl RetryableOperation for SaveEventsOperation<'_> {
    type Success = ();
    type Failure = StorageError;

    fn name(&self) -> &str {
        "mongo_save_events"
    }

    async fn try_execute(&mut self) -> RetryOutcome<(), StorageError> {
        match self.store.save_events_txn(self.batch).await {
            Ok(()) => RetryOutcome::Success(()),
            Err(err) if err.is_transient() => RetryOutcome::Retryable(err),
            Err(err) => RetryOutcome::Fatal(err),
        }
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn save_events(&self, batch: NewEvents) -> Result<()> {
        validate_new_events(&batch)?;

        let operation = SaveEventsOperation {
            store: self,
            batch: &batch,
        };
        run_with_retry(operation, store_backoff()).await
    }

    async fn list_events(&self, query: EventQuery) -> Result<EventStream> {
        let mut filter = Document::new();
        if let Some(selector) = query.aggregate {
            filter.insert("aggregate_id", bin(selector.id.as_bytes()));
            filter.insert(
                "aggregate_version",
                doc! { "$gt": selector.floor() as i64 },
            );
        }
        if let Some(event_type) = query.event_type {
            filter.insert("type", event_type as i64);
        }

        let options = FindOptions::builder()
            .sort(doc! { "aggregate_id": 1, "aggregate_version": 1 })
            .build();

        // The cursor is consumed lazily: rows decode as the caller pulls them,
        // never buffered wholesale.
        let cursor = self.events.find(filter).with_options(options).await?;
        let stream = cursor.map(|row| {
            row.map_err(StorageError::from)
                .and_then(|doc| event_from_doc(&doc))
        });

        Ok(stream.boxed())
    }

    async fn find_latest_snapshot(&self, query: &AggregateQuery) -> Result<Option<Snapshot>> {
        let filter = doc! {
            "aggregate_id": bin(query.id.as_bytes()),
            "aggregate_version": { "$gt": query.floor() as i64 },
        };
        let options = FindOptions::builder()
            .sort(doc! { "aggregate_version": -1 })
            .limit(1)
            .build();

        let mut cursor = self.snapshots.find(filter).with_options(options).await?;
        if cursor.advance().await? {
            let doc = cursor.deserialize_current()?;
            Ok(Some(snapshot_from_doc(&doc)?))
        } else {
            Ok(None)
        }
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let _gate = self.snapshot_gate.lock().await;

        let filter = doc! {
            "aggregate_id": bin(snapshot.aggregate.id.as_bytes()),
            "aggregate_version": snapshot.aggregate.version as i64,
        };
        let update = doc! {
            "$set": {
                "state": bin(&snapshot.state),
                "timestamp": mongodb::bson::DateTime::from_millis(snapshot.timestamp.timestamp_millis()),
            }
        };
        self.snapshots
            .update_one(filter, update)
            .with_options(UpdateOptions::builder().upsert(true).build())
            .await?;

        Ok(())
    }

    async fn save_projection_checkpoint(
        &self,
        projection: &str,
        aggregate: AggregateRef,
    ) -> Result<()> {
        let filter = doc! {
            "projection": projection,
            "aggregate_id": bin(aggregate.id.as_bytes()),
        };
        let update = doc! {
            "$set": {
                "aggregate_version": aggregate.version as i64,
                "timestamp": mongodb::bson::DateTime::now(),
            }
        };
        self.checkpoints
            .update_one(filter, update)
            .with_options(UpdateOptions::builder().upsert(true).build())
            .await?;

        Ok(())
    }

    async fn check_projection_checkpoint(
        &self,
        projection: &str,
        aggregate: AggregateRef,
    ) -> Result<bool> {
        let filter = doc! {
            "projection": projection,
            "aggregate_id": bin(aggregate.id.as_bytes()),
            "aggregate_version": { "$gte": aggregate.version as i64 },
        };
        let covered = self.checkpoints.find_one(filter).await?;
        Ok(covered.is_none())
    }

    async fn finalize_aggregate(&self, id: AggregateId) -> Result<()> {
        let id_bin = bin(id.as_bytes());

        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;

        let outcome: Result<()> = async {
            self.aggregates
                .update_one(
                    doc! { "_id": &id_bin },
                    doc! {
                        "$set": { "final": true },
                        "$setOnInsert": { "version": 0_i64, "timestamp": mongodb::bson::DateTime::now() },
                    },
                )
                .with_options(UpdateOptions::builder().upsert(true).build())
                .session(&mut session)
                .await?;

            self.events
                .update_many(
                    doc! { "aggregate_id": &id_bin },
                    doc! { "$set": { "final": true } },
                )
                .session(&mut session)
                .await?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                session.commit_transaction().await?;
                Ok(())
            }
            Err(err) => {
                let _ = session.abort_transaction().await;
                Err(err)
            }
        }
    }
}

/// Map driver write failures onto the storage taxonomy.
///
/// Duplicate key on the unique `(aggregate_id, aggregate_version)` index is a
/// concurrent-writer race; write conflicts and transient transaction labels
/// are retried internally.
fn classify_write_error(err: mongodb::error::Error, aggregate: AggregateRef) -> StorageError {
    use mongodb::error::{ErrorKind, WriteFailure};

    if err.contains_label("TransientTransactionError") {
        return StorageError::Transient(err.to_string());
    }

    match &*err.kind {
        ErrorKind::Write(WriteFailure::WriteError(write_err)) => match write_err.code {
            11000 => StorageError::VersionConflict {
                id: aggregate.id,
                version: aggregate.version,
            },
            WRITE_CONFLICT => StorageError::Transient(err.to_string()),
            _ => StorageError::Mongo(err),
        },
        ErrorKind::InsertMany(insert_err) => {
            let codes: Vec<i32> = insert_err
                .write_errors
                .as_ref()
                .map(|errs| errs.iter().map(|e| e.code).collect())
                .unwrap_or_default();
            if codes.contains(&11000) {
                StorageError::VersionConflict {
                    id: aggregate.id,
                    version: aggregate.version,
                }
            } else if codes.contains(&WRITE_CONFLICT) {
                StorageError::Transient(err.to_string())
            } else {
                StorageError::Mongo(err)
            }
        }
        ErrorKind::Command(command_err) if command_err.code == WRITE_CONFLICT => {
            StorageError::Transient(err.to_string())
        }
        _ => StorageError::Mongo(err),
    }
}

fn event_to_doc(event: &Event) -> Result<Document> {
    let body = match &event.body {
        Some(value) => Bson::Binary(bin(&serde_json::to_vec(value).map_err(|e| {
            StorageError::Codec(crate::codec::CodecError::Payload(e))
        })?)),
        None => Bson::Null,
    };
    let meta = serde_json::to_vec(&event.meta)
        .map_err(|e| StorageError::Codec(crate::codec::CodecError::Payload(e)))?;

    Ok(doc! {
        "id": bin(event.id.as_bytes()),
        "type": event.event_type as i64,
        "aggregate_id": bin(event.aggregate.id.as_bytes()),
        "aggregate_version": event.aggregate.version as i64,
        "body": body,
        "meta": bin(&meta),
        "timestamp": mongodb::bson::DateTime::from_millis(event.timestamp.timestamp_millis()),
        "final": false,
    })
}

fn event_from_doc(doc: &Document) -> Result<Event> {
    let invalid = |field: &str| StorageError::InvalidArgument(format!("event document missing {field}"));

    let id = EventId::from_bytes(doc.get_binary_generic("id").map_err(|_| invalid("id"))?)
        .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
    let aggregate_id = AggregateId::from_bytes(
        doc.get_binary_generic("aggregate_id")
            .map_err(|_| invalid("aggregate_id"))?,
    )
    .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;

    let body = match doc.get("body") {
        Some(Bson::Binary(binary)) => Some(
            serde_json::from_slice(&binary.bytes)
                .map_err(|e| StorageError::Codec(crate::codec::CodecError::Payload(e)))?,
        ),
        _ => None,
    };
    let meta = serde_json::from_slice(
        &doc.get_binary_generic("meta")
            .map_err(|_| invalid("meta"))?
            .to_vec(),
    )
    .map_err(|e| StorageError::Codec(crate::codec::CodecError::Payload(e)))?;

    let millis = doc
        .get_datetime("timestamp")
        .map_err(|_| invalid("timestamp"))?
        .timestamp_millis();
    let timestamp = chrono::DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::InvalidArgument(format!("invalid timestamp: {millis}")))?;

    Ok(Event {
        id,
        event_type: doc.get_i64("type").map_err(|_| invalid("type"))? as u32,
        aggregate: AggregateRef {
            id: aggregate_id,
            version: doc
                .get_i64("aggregate_version")
                .map_err(|_| invalid("aggregate_version"))? as u32,
        },
        body,
        meta,
        timestamp,
    })
}

fn snapshot_from_doc(doc: &Document) -> Result<Snapshot> {
    let invalid =
        |field: &str| StorageError::InvalidArgument(format!("snapshot document missing {field}"));

    let aggregate_id = AggregateId::from_bytes(
        doc.get_binary_generic("aggregate_id")
            .map_err(|_| invalid("aggregate_id"))?,
    )
    .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
    let version = doc
        .get_i64("aggregate_version")
        .map_err(|_| invalid("aggregate_version"))? as u32;
    let state = doc
        .get_binary_generic("state")
        .map_err(|_| invalid("state"))?
        .to_vec();
    let millis = doc
        .get_datetime("timestamp")
        .map_err(|_| invalid("timestamp"))?
        .timestamp_millis();
    let timestamp = chrono::DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::InvalidArgument(format!("invalid timestamp: {millis}")))?;

    Ok(Snapshot {
        aggregate: AggregateRef {
            id: aggregate_id,
            version,
        },
        state,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use chrono::Utc;

    #[test]
    fn event_documents_round_trip() {
        let mut meta = crate::event::Meta::new();
        meta.insert("__ctx".to_string(), Value::String("ctx".into()));
        let event = Event {
            id: EventId::generate(),
            event_type: 9,
            aggregate: AggregateRef::new(AggregateId::new([2u8; 13]), 3),
            body: Some(Value::Int(42)),
            meta,
            timestamp: Utc::now(),
        };

        let doc = event_to_doc(&event).unwrap();
        let decoded = event_from_doc(&doc).unwrap();

        assert_eq!(decoded.id, event.id);
        assert_eq!(decoded.event_type, event.event_type);
        assert_eq!(decoded.aggregate, event.aggregate);
        assert_eq!(decoded.body, event.body);
        assert_eq!(decoded.meta, event.meta);
        assert_eq!(
            decoded.timestamp.timestamp_millis(),
            event.timestamp.timestamp_millis()
        );
    }

    #[test]
    fn null_bodies_survive_the_document_round_trip() {
        let event = Event {
            id: EventId::generate(),
            event_type: 1,
            aggregate: AggregateRef::new(AggregateId::new([1u8; 13]), 1),
            body: None,
            meta: Default::default(),
            timestamp: Utc::now(),
        };

        let doc = event_to_doc(&event).unwrap();
        assert_eq!(doc.get("body"), Some(&Bson::Null));
        assert_eq!(event_from_doc(&doc).unwrap().body, None);
    }
}
