//! Projection runtime: a supervised consumer applying event handlers under
//! per-(projection, aggregate) idempotent checkpointing.
//!
//! The transport delivers at least once; the checkpoint gate turns that into
//! exactly-once effects per (projection, aggregate) provided handlers are
//! idempotent with respect to state at the corresponding checkpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bus::{BusError, EventBus, EventHandler, Incoming, SubscribeOptions, Subscriber};
use crate::event::Event;
use crate::routing::{RegistryError, StreamRegistration, StreamRegistry};
use crate::storage::{Store, StorageError};

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Errors that can occur in the projection runtime.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("Handler failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<&str> for ProjectionError {
    fn from(message: &str) -> Self {
        ProjectionError::Handler(message.to_string())
    }
}

impl From<String> for ProjectionError {
    fn from(message: String) -> Self {
        ProjectionError::Handler(message)
    }
}

type HandlerFn<S> =
    Arc<dyn Fn(Arc<S>, Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One event-type handler of a projection.
pub struct ProjectionHandler<S> {
    event_type: u32,
    handler: HandlerFn<S>,
}

impl<S> ProjectionHandler<S>
where
    S: Send + Sync + 'static,
{
    pub fn new<F, Fut>(event_type: u32, handler: F) -> Self
    where
        F: Fn(Arc<S>, Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            event_type,
            handler: Arc::new(move |state, event| Box::pin(handler(state, event))),
        }
    }
}

/// Options for a projection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectionOptions {
    /// Skip registering with the stream registry on start. The broker will
    /// not route events to this projection unless something else registers
    /// its stream.
    pub disable_save_stream: bool,
}

/// A subscribed consumer applying handlers with checkpointing.
pub struct Projection<S> {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    registry: Arc<dyn StreamRegistry>,
    handlers: Arc<HashMap<u32, HandlerFn<S>>>,
    projection_id: String,
    state: Arc<S>,
    options: ProjectionOptions,
    last_event_at: Arc<RwLock<Instant>>,
    subscriber: Mutex<Option<Subscriber>>,
}

impl<S> Projection<S>
where
    S: Send + Sync + 'static,
{
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        registry: Arc<dyn StreamRegistry>,
        handlers: Vec<ProjectionHandler<S>>,
        projection_id: impl Into<String>,
        state: S,
        options: ProjectionOptions,
    ) -> Self {
        let handlers: HashMap<u32, HandlerFn<S>> = handlers
            .into_iter()
            .map(|handler| (handler.event_type, handler.handler))
            .collect();

        Self {
            store,
            bus,
            registry,
            handlers: Arc::new(handlers),
            projection_id: projection_id.into(),
            state: Arc::new(state),
            options,
            last_event_at: Arc::new(RwLock::new(Instant::now())),
            subscriber: Mutex::new(None),
        }
    }

    pub fn projection_id(&self) -> &str {
        &self.projection_id
    }

    /// Shared handler context.
    pub fn state(&self) -> Arc<S> {
        self.state.clone()
    }

    /// Register interest and subscribe to this projection's stream.
    pub async fn start(&self) -> Result<()> {
        if !self.options.disable_save_stream {
            let mut events: Vec<u32> = self.handlers.keys().copied().collect();
            events.sort_unstable();
            self.registry
                .save_stream(StreamRegistration::new(self.projection_id.clone(), events))
                .await?;
        }

        let handler = Arc::new(OnEvent {
            store: self.store.clone(),
            handlers: self.handlers.clone(),
            projection_id: self.projection_id.clone(),
            state: self.state.clone(),
            last_event_at: self.last_event_at.clone(),
        });

        let subscriber = self
            .bus
            .subscribe(&self.projection_id, handler, SubscribeOptions::default())
            .await?;
        *self.subscriber.lock().await = Some(subscriber);
        *self.last_event_at.write().await = Instant::now();

        info!(projection = %self.projection_id, "Projection started");
        Ok(())
    }

    /// Block until no event has arrived for `duration`, polling every 500ms.
    pub async fn wait_until_settled(&self, duration: Duration) {
        let poll = Duration::from_millis(500).min(duration);
        loop {
            let quiet = self.last_event_at.read().await.elapsed();
            if quiet >= duration {
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Unsubscribe gracefully: the in-flight handler completes and its
    /// checkpoint saves before the consumer disconnects.
    pub async fn stop(&self) {
        if let Some(subscriber) = self.subscriber.lock().await.take() {
            subscriber.stop().await;
        }
        info!(projection = %self.projection_id, "Projection stopped");
    }
}

struct OnEvent<S> {
    store: Arc<dyn Store>,
    handlers: Arc<HashMap<u32, HandlerFn<S>>>,
    projection_id: String,
    state: Arc<S>,
    last_event_at: Arc<RwLock<Instant>>,
}

impl<S> EventHandler for OnEvent<S>
where
    S: Send + Sync + 'static,
{
    fn handle(&self, incoming: Incoming) -> BoxFuture<'static, crate::bus::Result<()>> {
        let store = self.store.clone();
        let handlers = self.handlers.clone();
        let projection_id = self.projection_id.clone();
        let state = self.state.clone();
        let last_event_at = self.last_event_at.clone();

        Box::pin(async move {
            let event = match incoming {
                Incoming::Decoded(event) => *event,
                Incoming::Raw(_) => {
                    return Err(BusError::Handler(
                        "projection requires a decoded subscription".to_string(),
                    ));
                }
            };

            *last_event_at.write().await = Instant::now();

            let Some(handler) = handlers.get(&event.event_type) else {
                warn!(
                    projection = %projection_id,
                    event_type = event.event_type,
                    "No handler for routed event type, dropping"
                );
                return Ok(());
            };

            let should_process = store
                .check_projection_checkpoint(&projection_id, event.aggregate)
                .await
                .map_err(|e| BusError::Handler(e.to_string()))?;
            if !should_process {
                debug!(
                    projection = %projection_id,
                    aggregate = %event.aggregate.id,
                    version = event.aggregate.version,
                    "Checkpoint already covers this version, skipping duplicate"
                );
                return Ok(());
            }

            let aggregate = event.aggregate;
            handler(state, event)
                .await
                .map_err(|e| BusError::Handler(e.to_string()))?;

            store
                .save_projection_checkpoint(&projection_id, aggregate)
                .await
                .map_err(|e| BusError::Handler(e.to_string()))?;

            Ok(())
        })
    }
}
