//! Event transport: ordered per-key publish/subscribe over named streams.
//!
//! This module contains:
//! - `EventBus` trait: publishing and subscriber creation
//! - `EventHandler` trait: message processing with retry
//! - `Subscriber`: handle for graceful shutdown
//! - Implementations: Channel (in-process), Kafka

use std::sync::Arc;

use async_trait::async_trait;
use backon::ExponentialBuilder;
use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::codec;
use crate::config::{Config, MessagingType};
use crate::event::Event;
use crate::utils::retry::{run_with_retry, subscriber_backoff, RetryOutcome, RetryableOperation};

pub mod channel;
#[cfg(feature = "kafka")]
pub mod kafka;

pub use channel::{ChannelConfig, ChannelEventBus};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaConfig, KafkaEventBus};

/// The single ingress stream every aggregate publishes to.
pub const MAIN_STREAM: &str = "main";

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Decode failed: {0}")]
    Decode(#[from] codec::CodecError),

    #[error("Handler failed: {0}")]
    Handler(String),
}

/// Build the topic name for a stream.
pub fn topic_for_stream(prefix: &str, stream: &str) -> String {
    format!("{prefix}.{stream}")
}

/// An encoded event as carried on the wire.
///
/// `event_type` and `key` are lifted out of the frame so the broker can route
/// and re-publish without decoding body or metadata.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub event_type: u32,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl RawEvent {
    /// Encode a decoded event into its wire form.
    pub fn from_event(event: &Event) -> std::result::Result<Self, codec::CodecError> {
        Ok(Self {
            event_type: event.event_type,
            key: codec::partition_key(&event.meta),
            payload: codec::encode_event(event)?,
        })
    }
}

/// A batch of decoded events headed for one stream.
#[derive(Debug, Clone)]
pub struct SendBatch {
    pub stream: String,
    pub events: Vec<Event>,
}

/// A batch of already-encoded events headed for one stream.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub stream: String,
    pub events: Vec<RawEvent>,
}

/// A message as delivered to an [`EventHandler`].
#[derive(Debug, Clone)]
pub enum Incoming {
    Decoded(Box<Event>),
    Raw(RawEvent),
}

/// Handler for processing messages from the bus.
pub trait EventHandler: Send + Sync {
    /// Process one message. Errors trigger redelivery per the subscription's
    /// retry policy.
    fn handle(&self, incoming: Incoming) -> BoxFuture<'static, Result<()>>;
}

/// Whether a subscription decodes messages before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscribeMode {
    /// Decode the frame and payload; the handler receives [`Incoming::Decoded`].
    #[default]
    Decoded,
    /// Deliver the frame untouched; the handler receives [`Incoming::Raw`].
    Raw,
}

/// Restricts which handler errors are retried. `None` retries everything.
pub type RetryClassifier = Arc<dyn Fn(&BusError) -> bool + Send + Sync>;

/// Options for [`EventBus::subscribe`].
#[derive(Clone)]
pub struct SubscribeOptions {
    pub mode: SubscribeMode,
    pub backoff: ExponentialBuilder,
    pub retry_if: Option<RetryClassifier>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            mode: SubscribeMode::Decoded,
            backoff: subscriber_backoff(),
            retry_if: None,
        }
    }
}

impl SubscribeOptions {
    pub fn raw() -> Self {
        Self {
            mode: SubscribeMode::Raw,
            ..Self::default()
        }
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle does not stop the consumer; call [`Subscriber::stop`]
/// for a graceful shutdown that lets the in-flight handler finish.
pub struct Subscriber {
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    pub(crate) fn new(shutdown: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Disconnect gracefully, finishing any in-flight handler.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

/// Interface for event delivery.
///
/// Publishing has durable-write semantics: the producer is idempotent, so
/// retries within one producer epoch do not duplicate. Cross-epoch duplicates
/// remain possible; projections stay idempotent via checkpoints.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Encode and publish each batch to its stream's topic.
    ///
    /// The partition key is the canonical encoding of `meta["__ctx"]` when
    /// present; events with equal keys land on one partition in order.
    async fn send_events(&self, batches: Vec<SendBatch>) -> Result<()>;

    /// Publish already-encoded frames, preserving each frame's key.
    async fn send_raw(&self, batches: Vec<RawBatch>) -> Result<()>;

    /// Create a consumer-group subscription on a stream.
    ///
    /// All subscribers of the same stream form one group and share
    /// partitions. Per-partition delivery is in order.
    async fn subscribe(
        &self,
        stream: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Subscriber>;
}

/// State for one handler dispatch with retry.
struct DispatchOperation {
    handler: Arc<dyn EventHandler>,
    incoming: Incoming,
    retry_if: Option<RetryClassifier>,
}

#[async_trait]
impl RetryableOperation for DispatchOperation {
    type Success = ();
    type Failure = BusError;

    fn name(&self) -> &str {
        "bus_dispatch"
    }

    async fn try_execute(&mut self) -> RetryOutcome<(), BusError> {
        match self.handler.handle(self.incoming.clone()).await {
            Ok(()) => RetryOutcome::Success(()),
            Err(err) => {
                let retryable = match &self.retry_if {
                    Some(classifier) => classifier(&err),
                    None => true,
                };
                if retryable {
                    RetryOutcome::Retryable(err)
                } else {
                    RetryOutcome::Fatal(err)
                }
            }
        }
    }
}

/// Dispatch one message to a handler under the subscription's retry policy.
pub(crate) async fn dispatch_with_retry(
    handler: Arc<dyn EventHandler>,
    incoming: Incoming,
    options: &SubscribeOptions,
) -> Result<()> {
    let operation = DispatchOperation {
        handler,
        incoming,
        retry_if: options.retry_if.clone(),
    };
    run_with_retry(operation, options.backoff.clone()).await
}

/// Build the [`Incoming`] for a received frame per the subscription mode.
pub(crate) fn incoming_from_payload(
    payload: &[u8],
    key: Option<&[u8]>,
    mode: SubscribeMode,
) -> Result<Incoming> {
    match mode {
        SubscribeMode::Decoded => Ok(Incoming::Decoded(Box::new(codec::decode_event(payload)?))),
        SubscribeMode::Raw => {
            let frame = codec::peek_frame(payload)?;
            Ok(Incoming::Raw(RawEvent {
                event_type: frame.event_type,
                key: key.map(<[u8]>::to_vec),
                payload: payload.to_vec(),
            }))
        }
    }
}

/// Initialize an event bus based on configuration.
pub async fn init_bus(
    config: &Config,
) -> std::result::Result<Arc<dyn EventBus>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging.messaging_type {
        MessagingType::Channel => {
            info!(messaging_type = "channel", "Event bus initialized");
            Ok(Arc::new(ChannelEventBus::new(ChannelConfig {
                topic_prefix: config.messaging.topic_prefix.clone(),
            })))
        }
        MessagingType::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let kafka_config = KafkaConfig::from_messaging(&config.messaging);
                let bus = KafkaEventBus::new(kafka_config)?;
                info!(messaging_type = "kafka", "Event bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "kafka"))]
            {
                Err("Kafka support requires the 'kafka' feature. Rebuild with --features kafka"
                    .into())
            }
        }
    }
}
