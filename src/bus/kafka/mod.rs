//! Kafka event bus implementation.
//!
//! Topic naming: `{topic_prefix}.{stream}`. Message key: the event's
//! partition key (canonical `__ctx` bytes), so events sharing a key stay on
//! one partition in order. Each subscription is a consumer group named after
//! its topic; running multiple instances of a consumer spreads partitions
//! across them while preserving per-partition order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{
    dispatch_with_retry, incoming_from_payload, topic_for_stream, EventBus, EventHandler,
    BusError, RawBatch, RawEvent, Result, SendBatch, SubscribeOptions, Subscriber,
};
use crate::config::MessagingConfig;

/// Configuration for Kafka connection.
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Topic prefix for streams (default: "arque").
    pub topic_prefix: String,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            topic_prefix: "arque".to_string(),
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }

    /// Build a Kafka config from the messaging section.
    pub fn from_messaging(config: &MessagingConfig) -> Self {
        Self {
            bootstrap_servers: config.kafka.bootstrap_servers.clone(),
            topic_prefix: config.topic_prefix.clone(),
            sasl_username: config.kafka.sasl_username.clone(),
            sasl_password: config.kafka.sasl_password.clone(),
            sasl_mechanism: config.kafka.sasl_mechanism.clone(),
            security_protocol: config.kafka.security_protocol.clone(),
            ssl_ca_location: config.kafka.ssl_ca_location.clone(),
        }
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// Set topic prefix.
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Build a ClientConfig for producers.
    ///
    /// Idempotence is mandatory: publish retries within one producer epoch
    /// must not duplicate.
    fn build_producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("message.timeout.ms", "5000");
        config.set("acks", "all");
        config.set("enable.idempotence", "true");

        self.apply_security_config(&mut config);
        config
    }

    /// Build a ClientConfig for a consumer group.
    fn build_consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", "earliest");
        config.set("group.id", group_id);

        self.apply_security_config(&mut config);
        config
    }

    /// Apply security settings to a ClientConfig.
    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }

        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }

        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }

        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }

        if let Some(ref ca_location) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
    }
}

/// Kafka event bus.
pub struct KafkaEventBus {
    producer: FutureProducer,
    config: KafkaConfig,
}

impl KafkaEventBus {
    /// Create a new Kafka event bus.
    pub fn new(config: KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka producer: {e}")))?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            topic_prefix = %config.topic_prefix,
            "Connected to Kafka"
        );

        Ok(Self { producer, config })
    }

    async fn publish_raw(&self, stream: &str, events: Vec<RawEvent>) -> Result<()> {
        let topic = topic_for_stream(&self.config.topic_prefix, stream);

        for event in events {
            let mut record: FutureRecord<'_, Vec<u8>, Vec<u8>> =
                FutureRecord::to(&topic).payload(&event.payload);
            if let Some(ref key) = event.key {
                record = record.key(key);
            }

            self.producer
                .send(record, Duration::from_secs(5))
                .await
                .map_err(|(e, _)| BusError::Publish(format!("Failed to publish: {e}")))?;

            debug!(topic = %topic, event_type = event.event_type, "Published event");
        }

        Ok(())
    }
}

#[async_trait]
impl EventBus for KafkaEventBus {
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

        // Consumer group id = topic name: all subscribers of one stream form
        // one group and share its partitions.
        let consumer: StreamConsumer = self
            .config
            .build_consumer_config(&topic)
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka consumer: {e}")))?;

        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| BusError::Subscribe(format!("Failed to subscribe to {topic}: {e}")))?;

        info!(topic = %topic, "Subscribed to Kafka topic");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!(topic = %topic, "Kafka subscriber stopping");
                        break;
                    }
                    received = consumer.recv() => match received {
                        Ok(message) => message,
                        Err(e) => {
                            error!(topic = %topic, error = %e, "Kafka consumer error");
                            continue;
                        }
                    },
                };

                let payload = match message.payload() {
                    Some(payload) => payload,
                    None => {
                        warn!(topic = %topic, "Received message with no payload");
                        let _ = consumer
                            .commit_message(&message, rdkafka::consumer::CommitMode::Async);
                        continue;
                    }
                };

                let incoming =
                    match incoming_from_payload(payload, message.key(), options.mode) {
                        Ok(incoming) => incoming,
                        Err(e) => {
                            error!(topic = %topic, error = %e, "Failed to decode message");
                            // Commit to avoid reprocessing malformed messages.
                            let _ = consumer
                                .commit_message(&message, rdkafka::consumer::CommitMode::Async);
                            continue;
                        }
                    };

                match dispatch_with_retry(handler.clone(), incoming, &options).await {
                    Ok(()) => {
                        if let Err(e) = consumer
                            .commit_message(&message, rdkafka::consumer::CommitMode::Async)
                        {
                            error!(topic = %topic, error = %e, "Failed to commit offset");
                        }
                    }
                    Err(e) => {
                        // Leave the offset uncommitted and rewind: the failed
                        // message stays at the head of its partition, blocking
                        // progress there until it succeeds.
                        error!(
                            topic = %topic,
                            partition = message.partition(),
                            offset = message.offset(),
                            error = %e,
                            "Handler exhausted retries, rewinding partition"
                        );
                        let mut assignment = TopicPartitionList::new();
                        let _ = assignment.add_partition_offset(
                            message.topic(),
                            message.partition(),
                            Offset::Offset(message.offset()),
                        );
                        if let Err(seek_err) =
                            consumer.seek_partitions(assignment, Duration::from_secs(5))
                        {
                            error!(topic = %topic, error = %seek_err, "Failed to rewind partition");
                        }
                    }
                }
            }
        });

        Ok(Subscriber::new(shutdown_tx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_config_is_idempotent() {
        let config = KafkaConfig::new("localhost:9092");
        let producer = config.build_producer_config();

        assert_eq!(producer.get("enable.idempotence"), Some("true"));
        assert_eq!(producer.get("acks"), Some("all"));
    }

    #[test]
    fn consumer_config_uses_manual_commit() {
        let config = KafkaConfig::new("localhost:9092");
        let consumer = config.build_consumer_config("arque.main");

        assert_eq!(consumer.get("enable.auto.commit"), Some("false"));
        assert_eq!(consumer.get("group.id"), Some("arque.main"));
    }

    #[test]
    fn sasl_settings_flow_into_client_config() {
        let config = KafkaConfig::new("broker:9092").with_sasl("user", "pass", "PLAIN");
        let producer = config.build_producer_config();

        assert_eq!(producer.get("sasl.username"), Some("user"));
        assert_eq!(producer.get("security.protocol"), Some("SASL_SSL"));
    }

    #[test]
    fn topic_names_follow_the_prefix() {
        let config = KafkaConfig::new("broker:9092").with_topic_prefix("custom");
        assert_eq!(
            topic_for_stream(&config.topic_prefix, "main"),
            "custom.main"
        );
    }
}
