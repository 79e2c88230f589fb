//! Runtime configuration.
//!
//! Aggregates configuration for storage, messaging, and caches into a single
//! `Config` struct that can be loaded from YAML files or environment
//! variables.

use std::time::Duration;

use serde::Deserialize;

/// Main runtime configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Messaging configuration.
    pub messaging: MessagingConfig,
    /// Stream-registry lookup cache.
    pub cache: CacheConfig,
    /// Aggregate engine defaults.
    pub aggregate: AggregateConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in the current directory (if it exists)
    /// 2. File specified by the `ARQUE_CONFIG` environment variable (if set)
    /// 3. Environment variables with an `ARQUE_` prefix
    pub fn load() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false))
            .add_source(File::new("config.yaml", FileFormat::Yaml).required(false));

        if let Ok(config_path) = std::env::var("ARQUE_CONFIG") {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("ARQUE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

/// Storage type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// In-memory storage (single process only).
    #[default]
    Memory,
    /// MongoDB storage.
    Mongodb,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// MongoDB-specific configuration.
    pub mongodb: MongoConfig,
}

/// MongoDB connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    /// Connection URI.
    pub uri: String,
    /// Database name.
    pub database: String,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: "arque".to_string(),
        }
    }
}

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-memory channel (single process only).
    #[default]
    Channel,
    /// Kafka messaging.
    Kafka,
}

/// Messaging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// Topic prefix for streams.
    pub topic_prefix: String,
    /// Kafka-specific configuration.
    pub kafka: KafkaSettings,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            messaging_type: MessagingType::Channel,
            topic_prefix: "arque".to_string(),
            kafka: KafkaSettings::default(),
        }
    }
}

/// Kafka-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaSettings {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
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

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }
}

/// Bounded TTL cache settings for stream-registry lookups.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached entries.
    pub max_entries: usize,
    /// Entry lifetime in seconds.
    pub ttl_secs: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 2046,
            ttl_secs: 600,
        }
    }
}

/// Aggregate engine defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    /// Maximum cached live aggregates.
    pub cache_max: usize,
    /// Cached aggregate lifetime in seconds.
    pub cache_ttl_secs: u64,
    /// Snapshot every N versions (0 disables snapshotting).
    pub snapshot_interval: u32,
}

impl AggregateConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            cache_max: 2046,
            cache_ttl_secs: 48 * 60 * 60,
            snapshot_interval: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.storage.storage_type, StorageType::Memory);
        assert_eq!(config.messaging.messaging_type, MessagingType::Channel);
        assert_eq!(config.messaging.topic_prefix, "arque");
        assert_eq!(config.cache.max_entries, 2046);
        assert_eq!(config.aggregate.snapshot_interval, 20);
        assert_eq!(config.aggregate.cache_ttl(), Duration::from_secs(172_800));
    }

    #[test]
    fn config_for_test_matches_defaults() {
        let config = Config::for_test();
        assert_eq!(config.storage.mongodb.database, "arque");
        assert_eq!(config.messaging.kafka.bootstrap_servers, "localhost:9092");
    }
}
