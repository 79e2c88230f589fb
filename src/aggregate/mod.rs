//! Aggregate engine: command processing, event replay, snapshotting, and
//! optimistic concurrency with bounded retry.
//!
//! An [`Aggregate`] owns a versioned event sequence and a derived state.
//! Commands run a registered handler against the current state to produce
//! events; events persist through the store and publish to the `main`
//! ingress stream. Version conflicts reload and retry under the process
//! backoff; domain errors surface unchanged.

pub mod factory;

pub use factory::{AggregateFactory, LoadOptions};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use backon::ExponentialBuilder;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::bus::{BusError, EventBus, SendBatch, MAIN_STREAM};
use crate::codec::Value;
use crate::event::{AggregateId, AggregateRef, Event, EventId, Meta, Snapshot};
use crate::storage::{AggregateQuery, EventQuery, NewEvents, Store, StorageError};
use crate::utils::retry::{process_backoff, run_with_retry, RetryOutcome, RetryableOperation};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, AggregateError>;

/// An error raised by a command handler's domain logic.
///
/// Domain errors are the caller's own semantics: the engine never retries
/// them and surfaces them unchanged.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct DomainError {
    pub message: String,
}

impl DomainError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for DomainError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for DomainError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

/// Errors that can occur during command processing.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("No command handler registered for type {0}")]
    CommandHandlerMissing(u32),

    #[error("Command rejected: {0}")]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("State codec error: {0}")]
    State(#[from] serde_json::Error),
}

impl AggregateError {
    fn is_version_conflict(&self) -> bool {
        matches!(
            self,
            AggregateError::Storage(StorageError::VersionConflict { .. })
        )
    }
}

/// A command submitted to an aggregate.
#[derive(Debug, Clone)]
pub struct Command {
    pub command_type: u32,
    pub body: Option<Value>,
}

impl Command {
    pub fn new(command_type: u32) -> Self {
        Self {
            command_type,
            body: None,
        }
    }

    pub fn with_body(command_type: u32, body: Value) -> Self {
        Self {
            command_type,
            body: Some(body),
        }
    }
}

/// An event descriptor returned by a command handler.
///
/// The engine assigns the id, version, and batch timestamp.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: u32,
    pub body: Option<Value>,
    pub meta: Option<Meta>,
}

impl EventDraft {
    pub fn new(event_type: u32) -> Self {
        Self {
            event_type,
            body: None,
            meta: None,
        }
    }

    pub fn with_body(event_type: u32, body: Value) -> Self {
        Self {
            event_type,
            body: Some(body),
            meta: None,
        }
    }
}

/// Read-only context handed to a command handler.
#[derive(Debug, Clone)]
pub struct CommandContext<S> {
    pub aggregate: AggregateRef,
    pub state: S,
    pub timestamp: DateTime<Utc>,
    pub meta: Option<Meta>,
}

/// Result of a command handler: produced events or a domain rejection.
pub type DomainResult = std::result::Result<Vec<EventDraft>, DomainError>;

/// A registered command handler.
pub type CommandHandler<S> =
    Arc<dyn Fn(CommandContext<S>, Command) -> BoxFuture<'static, DomainResult> + Send + Sync>;

/// A registered event handler: folds one event into the state.
pub type EventApplier<S> = Arc<dyn Fn(S, &Event) -> S + Send + Sync>;

/// Snapshot policy and state codec options.
#[derive(Clone)]
pub struct AggregateOptions<S> {
    /// Snapshot every N versions. 0 disables snapshotting.
    pub snapshot_interval: u32,
    /// Overrides the interval check when set.
    pub should_take_snapshot: Option<Arc<dyn Fn(&S, u32) -> bool + Send + Sync>>,
    /// Custom state serializer (default: canonical JSON).
    pub serialize_state:
        Option<Arc<dyn Fn(&S) -> std::result::Result<Vec<u8>, serde_json::Error> + Send + Sync>>,
    /// Custom state deserializer (default: canonical JSON).
    pub deserialize_state:
        Option<Arc<dyn Fn(&[u8]) -> std::result::Result<S, serde_json::Error> + Send + Sync>>,
    /// Backoff for version-conflict retries.
    pub retry: ExponentialBuilder,
}

impl<S> Default for AggregateOptions<S> {
    fn default() -> Self {
        Self {
            snapshot_interval: 20,
            should_take_snapshot: None,
            serialize_state: None,
            deserialize_state: None,
            retry: process_backoff(),
        }
    }
}

/// An aggregate's handler registries, zero state, and options.
///
/// Handlers are keyed by numeric type code; values close over whatever
/// collaborators they need.
pub struct AggregateDefinition<S> {
    initial_state: S,
    command_handlers: HashMap<u32, CommandHandler<S>>,
    event_handlers: HashMap<u32, EventApplier<S>>,
    options: AggregateOptions<S>,
}

impl<S> AggregateDefinition<S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(initial_state: S) -> Self {
        Self {
            initial_state,
            command_handlers: HashMap::new(),
            event_handlers: HashMap::new(),
            options: AggregateOptions::default(),
        }
    }

    /// Register a command handler for a command type.
    pub fn command<F, Fut>(mut self, command_type: u32, handler: F) -> Self
    where
        F: Fn(CommandContext<S>, Command) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = DomainResult> + Send + 'static,
    {
        self.command_handlers.insert(
            command_type,
            Arc::new(move |context, command| Box::pin(handler(context, command))),
        );
        self
    }

    /// Register an event handler for an event type.
    pub fn event<F>(mut self, event_type: u32, applier: F) -> Self
    where
        F: Fn(S, &Event) -> S + Send + Sync + 'static,
    {
        self.event_handlers.insert(event_type, Arc::new(applier));
        self
    }

    pub fn with_options(mut self, options: AggregateOptions<S>) -> Self {
        self.options = options;
        self
    }

    pub fn with_snapshot_interval(mut self, snapshot_interval: u32) -> Self {
        self.options.snapshot_interval = snapshot_interval;
        self
    }

    fn serialize_state(&self, state: &S) -> std::result::Result<Vec<u8>, serde_json::Error> {
        match &self.options.serialize_state {
            Some(serialize) => serialize(state),
            None => serde_json::to_vec(state),
        }
    }

    fn deserialize_state(&self, bytes: &[u8]) -> std::result::Result<S, serde_json::Error> {
        match &self.options.deserialize_state {
            Some(deserialize) => deserialize(bytes),
            None => serde_json::from_slice(bytes),
        }
    }
}

/// Per-call processing options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOptions {
    /// Skip the reload that normally precedes the first attempt.
    pub no_reload: bool,
    /// Override the definition's snapshot interval for this call.
    pub snapshot_interval: Option<u32>,
}

/// Fire-and-forget snapshot writes, drained by one worker per factory.
///
/// Snapshotting never gates a command's success: failures log and move on.
pub(crate) struct SnapshotWriter {
    tx: mpsc::UnboundedSender<Snapshot>,
}

impl SnapshotWriter {
    pub(crate) fn new(store: Arc<dyn Store>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Snapshot>();
        tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                if let Err(error) = store.save_snapshot(snapshot).await {
                    warn!(error = %error, "Snapshot write failed");
                }
            }
        });
        Self { tx }
    }

    fn enqueue(&self, snapshot: Snapshot) {
        // The worker only stops once every sender is gone.
        let _ = self.tx.send(snapshot);
    }
}

struct AggregateState<S> {
    version: u32,
    state: S,
}

/// A live aggregate: versioned state plus its handler registries.
///
/// Reloads and commands serialize on one internal lock, so concurrent calls
/// on the same instance perform a bounded number of store accesses and always
/// converge on the latest version.
pub struct Aggregate<S> {
    id: AggregateId,
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    definition: Arc<AggregateDefinition<S>>,
    snapshots: Arc<SnapshotWriter>,
    inner: Mutex<AggregateState<S>>,
}

impl<S> Aggregate<S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(
        id: AggregateId,
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        definition: Arc<AggregateDefinition<S>>,
        snapshots: Arc<SnapshotWriter>,
    ) -> Self {
        let initial = definition.initial_state.clone();
        Self {
            id,
            store,
            bus,
            definition,
            snapshots,
            inner: Mutex::new(AggregateState {
                version: 0,
                state: initial,
            }),
        }
    }

    pub fn id(&self) -> AggregateId {
        self.id
    }

    /// Version of the most recently applied event.
    pub async fn version(&self) -> u32 {
        self.inner.lock().await.version
    }

    /// A clone of the current state.
    pub async fn state(&self) -> S {
        self.inner.lock().await.state.clone()
    }

    /// Advance to the latest persisted version: pick up a snapshot that is
    /// ahead of the in-memory state, then replay the trailing events.
    pub async fn reload(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.reload_locked(&mut inner).await
    }

    async fn reload_locked(&self, inner: &mut AggregateState<S>) -> Result<()> {
        let snapshot = self
            .store
            .find_latest_snapshot(&AggregateQuery::new(self.id, inner.version))
            .await?;
        if let Some(snapshot) = snapshot {
            inner.state = self.definition.deserialize_state(&snapshot.state)?;
            inner.version = snapshot.aggregate.version;
        }

        let mut events = self
            .store
            .list_events(EventQuery {
                aggregate: Some(AggregateQuery::new(self.id, inner.version)),
                event_type: None,
            })
            .await?;
        while let Some(event) = events.try_next().await? {
            self.apply(inner, &event);
        }

        Ok(())
    }

    /// Fold one event into the state. Events without a registered handler
    /// still advance the version: replay tolerates foreign types.
    fn apply(&self, inner: &mut AggregateState<S>, event: &Event) {
        if let Some(applier) = self.definition.event_handlers.get(&event.event_type) {
            inner.state = applier(inner.state.clone(), event);
        }
        inner.version = event.aggregate.version;
    }

    /// Process a command: run its handler, persist the produced events,
    /// publish them to the ingress stream, and apply the snapshot policy.
    ///
    /// Version conflicts reload and retry up to the configured attempt
    /// budget; domain errors and exhausted retries surface to the caller.
    #[tracing::instrument(name = "aggregate.process", skip_all, fields(aggregate = %self.id, command_type = command.command_type))]
    pub async fn process(
        &self,
        command: Command,
        meta: Option<Meta>,
        options: ProcessOptions,
    ) -> Result<Vec<Event>> {
        let operation = ProcessOperation {
            aggregate: self,
            command,
            meta,
            options,
            reload_before_attempt: !options.no_reload,
        };
        run_with_retry(operation, self.definition.options.retry.clone()).await
    }

    /// Freeze the aggregate: no further events may be appended.
    pub async fn finalize(&self) -> Result<()> {
        self.store.finalize_aggregate(self.id).await?;
        Ok(())
    }

    async fn attempt(
        &self,
        command: &Command,
        meta: &Option<Meta>,
        options: &ProcessOptions,
        reload_first: bool,
    ) -> Result<Vec<Event>> {
        let mut inner = self.inner.lock().await;
        if reload_first {
            self.reload_locked(&mut inner).await?;
        }

        let handler = self
            .definition
            .command_handlers
            .get(&command.command_type)
            .ok_or(AggregateError::CommandHandlerMissing(command.command_type))?
            .clone();

        let timestamp = Utc::now();
        let context = CommandContext {
            aggregate: AggregateRef::new(self.id, inner.version),
            state: inner.state.clone(),
            timestamp,
            meta: meta.clone(),
        };

        let drafts = handler(context, command.clone()).await?;
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let base_version = inner.version + 1;
        let events: Vec<Event> = drafts
            .into_iter()
            .enumerate()
            .map(|(i, draft)| {
                let mut merged = meta.clone().unwrap_or_default();
                if let Some(draft_meta) = draft.meta {
                    merged.extend(draft_meta);
                }
                Event {
                    id: EventId::generate(),
                    event_type: draft.event_type,
                    aggregate: AggregateRef::new(self.id, base_version + i as u32),
                    body: draft.body,
                    meta: merged,
                    timestamp,
                }
            })
            .collect();

        self.store
            .save_events(NewEvents {
                aggregate: AggregateRef::new(self.id, base_version),
                timestamp,
                events: events.clone(),
            })
            .await?;

        // Persisted: advance in-memory state exactly as replay would.
        for event in &events {
            self.apply(&mut inner, event);
        }
        let version = inner.version;
        let state = inner.state.clone();
        drop(inner);

        self.bus
            .send_events(vec![SendBatch {
                stream: MAIN_STREAM.to_string(),
                events: events.clone(),
            }])
            .await?;

        if self.should_take_snapshot(&state, version, options) {
            let state_bytes = self.definition.serialize_state(&state)?;
            self.snapshots.enqueue(Snapshot {
                aggregate: AggregateRef::new(self.id, version),
                state: state_bytes,
                timestamp,
            });
        }

        Ok(events)
    }

    fn should_take_snapshot(&self, state: &S, version: u32, options: &ProcessOptions) -> bool {
        if let Some(should) = &self.definition.options.should_take_snapshot {
            return should(state, version);
        }
        let interval = options
            .snapshot_interval
            .unwrap_or(self.definition.options.snapshot_interval);
        interval > 0 && version % interval == 0
    }
}

/// State for a retryable command execution.
struct ProcessOperation<'a, S> {
    aggregate: &'a Aggregate<S>,
    command: Command,
    meta: Option<Meta>,
    options: ProcessOptions,
    reload_before_attempt: bool,
}

#[async_trait]
impl<S> RetryableOperation for ProcessOperation<'_, S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Success = Vec<Event>;
    type Failure = AggregateError;

    fn name(&self) -> &str {
        "aggregate_process"
    }

    async fn try_execute(&mut self) -> RetryOutcome<Vec<Event>, AggregateError> {
        let reload_first = self.reload_before_attempt;
        self.reload_before_attempt = false;

        match self
            .aggregate
            .attempt(&self.command, &self.meta, &self.options, reload_first)
            .await
        {
            Ok(events) => RetryOutcome::Success(events),
            Err(error) if error.is_version_conflict() => RetryOutcome::Retryable(error),
            Err(error) => RetryOutcome::Fatal(error),
        }
    }

    async fn prepare_for_retry(&mut self, _failure: &AggregateError) -> Result<()> {
        // Pick up the competing writer's events before the next attempt.
        self.aggregate.reload().await
    }
}

#[cfg(test)]
mod tests;
