//! In-memory channel-based event bus.
//!
//! Uses one tokio broadcast channel per topic for pub/sub within a single
//! process. Ideal for tests and embedded deployments without external
//! dependencies. A topic's channel is FIFO and each subscriber consumes it
//! sequentially, so per-key ordering holds for every key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, error, info, warn};

use super::{
    dispatch_with_retry, incoming_from_payload, topic_for_stream, EventBus, EventHandler,
    RawBatch, RawEvent, Result, SendBatch, SubscribeOptions, Subscriber,
};

/// Channel capacity per topic.
const CHANNEL_CAPACITY: usize = 1024;

/// Configuration for the channel event bus.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Topic prefix (default: "arque").
    pub topic_prefix: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "arque".to_string(),
        }
    }
}

/// In-memory event bus backed by per-topic broadcast channels.
pub struct ChannelEventBus {
    config: ChannelConfig,
    topics: RwLock<HashMap<String, broadcast::Sender<Arc<RawEvent>>>>,
}

impl ChannelEventBus {
    pub fn new(config: ChannelConfig) -> Self {
        info!(topic_prefix = %config.topic_prefix, "Channel event bus initialized");
        Self {
            config,
            topics: RwLock::new(HashMap::new()),
        }
    }

    async fn sender_for(&self, topic: &str) -> broadcast::Sender<Arc<RawEvent>> {
        {
            let topics = self.topics.read().await;
            if let Some(sender) = topics.get(topic) {
                return sender.clone();
            }
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    async fn publish_raw(&self, stream: &str, events: Vec<RawEvent>) -> Result<()> {
        let topic = topic_for_stream(&self.config.topic_prefix, stream);
        let sender = self.sender_for(&topic).await;

        for event in events {
            // No receivers yet is not an error: the topic simply has no
            // subscribers at this instant.
            match sender.send(Arc::new(event)) {
                Ok(receiver_count) => {
                    debug!(topic = %topic, receivers = receiver_count, "Published event");
                }
                Err(_) => {
                    debug!(topic = %topic, "Published event with no receivers");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventBus for ChannelEventBus {
    #[tracing::instrument(name = "bus.send", skip_all)]
    async fn send_events(&self, batches: Vec<SendBatch>) -> Result<()> {
        for batch in batches {
            let events = batch
                .events
                .iter()
                .map(RawEvent::from_event)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            self.publish_raw(&batch.stream, events).await?;
        }
        Ok(())
    }

    #[tracing::instrument(name = "bus.send_raw", skip_all)]
    async fn send_raw(&self, batches: Vec<RawBatch>) -> Result<()> {
        for batch in batches {
            self.publish_raw(&batch.stream, batch.events).await?;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        stream: &str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<Subscriber> {
        let topic = topic_for_stream(&self.config.topic_prefix, stream);
        let mut receiver = self.sender_for(&topic).await.subscribe();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!(topic = %topic, "Channel subscriber stopping");
                        break;
                    }
                    received = receiver.recv() => match received {
                        Ok(raw) => {
                            let incoming = match incoming_from_payload(
                                &raw.payload,
                                raw.key.as_deref(),
                                options.mode,
                            ) {
                                Ok(incoming) => incoming,
                                Err(err) => {
                                    error!(topic = %topic, error = %err, "Failed to decode message");
                                    continue;
                                }
                            };

                            if let Err(err) =
                                dispatch_with_retry(handler.clone(), incoming, &options).await
                            {
                                // The in-process transport has no redelivery
                                // past the retry budget; the message is lost.
                                error!(topic = %topic, error = %err, "Handler failed, dropping message");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "Channel subscriber lagged, skipped messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!(topic = %topic, "Channel closed, stopping subscriber");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Subscriber::new(shutdown_tx, task))
    }
}
