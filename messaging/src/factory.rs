//! Driver selection and configuration loading.
//!
//! The configuration document carries a `messaging` section naming a driver
//! and its options:
//!
//! ```yaml
//! messaging:
//!   driver: kafka
//!   options:
//!     brokers: ["localhost:9092"]
//!     consumer:
//!       group_id: ocr-workers
//! ```

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use messaging_topics::{Payload, TopicRegistry};
use serde::{Deserialize, Deserializer};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ConsumerSettings, DriverOptions, ProducerSettings};
use crate::consumer::Consumer;
use crate::error::{MessagingError, Result};
use crate::memory::MemoryBroker;
use crate::producer::Publisher;

#[cfg(feature = "kafka")]
use crate::config::BrokerConfig;
#[cfg(feature = "kafka")]
use crate::kafka::{KafkaConsumer, KafkaProducer};

/// Where the configuration document is read from when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/messaging/config.yaml";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "MESSAGING_CONFIG";

/// Messaging backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Kafka,
    /// The factory's in-process broker.
    Memory,
}

impl Driver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Driver::Kafka => "kafka",
            Driver::Memory => "memory",
        }
    }
}

impl FromStr for Driver {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kafka" => Ok(Driver::Kafka),
            "memory" => Ok(Driver::Memory),
            _ => Err(MessagingError::UnsupportedDriver(s.to_string())),
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `messaging` section of the configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct FactoryConfig {
    #[serde(default)]
    pub driver: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub options: DriverOptions,
}

impl FactoryConfig {
    pub fn new(driver: impl Into<String>, options: DriverOptions) -> Self {
        Self {
            driver: driver.into(),
            options,
        }
    }

    pub fn driver(&self) -> Result<Driver> {
        self.driver.parse()
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<DriverOptions, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<DriverOptions>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Deserialize)]
struct RootDocument {
    messaging: Option<FactoryConfig>,
}

/// Reads the messaging configuration.
///
/// Without a path, reads `$MESSAGING_CONFIG` or [`DEFAULT_CONFIG_PATH`].
pub fn load_config(path: Option<&Path>) -> Result<FactoryConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
    };
    info!("Loading messaging configuration from {}", path.display());

    let document = std::fs::read_to_string(&path)?;
    parse_config(&document)
}

/// Parses the messaging configuration from a YAML document.
pub fn parse_config(document: &str) -> Result<FactoryConfig> {
    let root: RootDocument = serde_yaml::from_str(document)?;
    let config = root
        .messaging
        .ok_or_else(|| MessagingError::Config("messaging section is required".to_string()))?;

    if config.driver.trim().is_empty() {
        return Err(MessagingError::Config(
            "messaging.driver is required".to_string(),
        ));
    }
    Ok(config)
}

/// Builds publishers and consumers for the configured driver.
///
/// Holds the topic registry shared by every instance it creates and the
/// in-process broker used by the `memory` driver.
pub struct MessagingFactory {
    registry: Arc<TopicRegistry>,
    memory: MemoryBroker,
}

impl MessagingFactory {
    pub fn new(registry: Arc<TopicRegistry>) -> Self {
        Self {
            registry,
            memory: MemoryBroker::new(),
        }
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    /// The broker behind the `memory` driver.
    pub fn memory_broker(&self) -> &MemoryBroker {
        &self.memory
    }

    /// Creates a publisher for `T` on the configured driver.
    ///
    /// # Errors
    ///
    /// Configuration, connection and registry errors surface here, never
    /// from `open`.
    pub fn publisher<T: Payload>(
        &self,
        config: &FactoryConfig,
        cancel: &CancellationToken,
    ) -> Result<Publisher<T>> {
        match config.driver()? {
            Driver::Memory => {
                let settings = ProducerSettings::from_options(&config.options)?;
                Publisher::new(self.memory.producer(), &self.registry, &settings, cancel)
            }
            #[cfg(feature = "kafka")]
            Driver::Kafka => {
                let broker = BrokerConfig::from_options(&config.options)?;
                let transport = KafkaProducer::new(&broker)?;
                Publisher::new(transport, &self.registry, &broker.producer, cancel)
            }
            #[cfg(not(feature = "kafka"))]
            Driver::Kafka => Err(kafka_disabled()),
        }
    }

    /// Creates a consumer for `T` on the configured driver.
    ///
    /// # Errors
    ///
    /// Configuration, connection and registry errors surface here; subscribe
    /// errors surface from `open`.
    pub fn consumer<T: Payload>(
        &self,
        config: &FactoryConfig,
        cancel: &CancellationToken,
    ) -> Result<Consumer<T>> {
        match config.driver()? {
            Driver::Memory => {
                let settings = ConsumerSettings::from_options(&config.options)?;
                Consumer::new(self.memory.consumer(&settings), &self.registry, &settings, cancel)
            }
            #[cfg(feature = "kafka")]
            Driver::Kafka => {
                let broker = BrokerConfig::from_options(&config.options)?;
                let transport = KafkaConsumer::new(&broker)?;
                Consumer::new(transport, &self.registry, &broker.consumer, cancel)
            }
            #[cfg(not(feature = "kafka"))]
            Driver::Kafka => Err(kafka_disabled()),
        }
    }
}

#[cfg(not(feature = "kafka"))]
fn kafka_disabled() -> MessagingError {
    MessagingError::UnsupportedDriver("kafka (built without the `kafka` feature)".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::io::Write;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct FileUpload {
        path: String,
    }

    fn factory() -> MessagingFactory {
        let registry = TopicRegistry::new();
        registry.register::<FileUpload>("file.upload").unwrap();
        MessagingFactory::new(Arc::new(registry))
    }

    #[test]
    fn test_driver_parse() {
        assert_eq!(" Kafka ".parse::<Driver>().unwrap(), Driver::Kafka);
        assert_eq!("memory".parse::<Driver>().unwrap(), Driver::Memory);
        assert!(matches!(
            "nats".parse::<Driver>(),
            Err(MessagingError::UnsupportedDriver(ref d)) if d == "nats"
        ));
    }

    #[test]
    fn test_parse_config() {
        let config = parse_config(
            r#"
messaging:
  driver: kafka
  options:
    brokers: ["kafka:9092"]
    producer:
      linger_ms: 5
"#,
        )
        .unwrap();

        assert_eq!(config.driver().unwrap(), Driver::Kafka);
        assert!(config.options.contains_key("brokers"));
        assert_eq!(
            ProducerSettings::from_options(&config.options).unwrap().linger_ms,
            5
        );
    }

    #[test]
    fn test_parse_config_null_options() {
        let config = parse_config("messaging:\n  driver: memory\n  options:\n").unwrap();
        assert!(config.options.is_empty());
    }

    #[test]
    fn test_parse_config_requires_section_and_driver() {
        assert!(matches!(
            parse_config("storage:\n  driver: s3\n"),
            Err(MessagingError::Config(_))
        ));
        assert!(matches!(
            parse_config("messaging:\n  options: {}\n"),
            Err(MessagingError::Config(ref msg)) if msg.contains("driver")
        ));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "messaging:\n  driver: memory").unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.driver().unwrap(), Driver::Memory);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Some(Path::new("/nonexistent/messaging.yaml")));
        assert!(matches!(result, Err(MessagingError::Io(_))));
    }

    #[tokio::test]
    async fn test_unsupported_driver() {
        let factory = factory();
        let config = FactoryConfig::new("rabbitmq", DriverOptions::new());
        let cancel = CancellationToken::new();

        assert!(matches!(
            factory.publisher::<FileUpload>(&config, &cancel),
            Err(MessagingError::UnsupportedDriver(_))
        ));
        assert!(matches!(
            factory.consumer::<FileUpload>(&config, &cancel),
            Err(MessagingError::UnsupportedDriver(_))
        ));
    }

    #[tokio::test]
    async fn test_unregistered_type_fails_at_construction() {
        #[derive(Debug, Default, Serialize, Deserialize)]
        struct Unregistered {}

        let factory = factory();
        let config = FactoryConfig::new("memory", DriverOptions::new());
        let result = factory.publisher::<Unregistered>(&config, &CancellationToken::new());
        assert!(matches!(result, Err(MessagingError::Registry(_))));
    }

    #[cfg(feature = "kafka")]
    #[tokio::test]
    async fn test_kafka_driver_requires_brokers() {
        let factory = factory();
        let config = FactoryConfig::new("kafka", DriverOptions::new());
        let result = factory.consumer::<FileUpload>(&config, &CancellationToken::new());
        assert!(matches!(result, Err(MessagingError::Config(_))));
    }

    #[tokio::test]
    async fn test_memory_driver_end_to_end() {
        let factory = factory();
        let config = parse_config(
            "messaging:\n  driver: memory\n  options:\n    consumer:\n      group_id: g\n",
        )
        .unwrap();
        let cancel = CancellationToken::new();

        let mut publisher = factory.publisher::<FileUpload>(&config, &cancel).unwrap();
        let outbox = publisher.open().unwrap();
        outbox
            .send(crate::Message::new(FileUpload {
                path: "a.pdf".to_string(),
            }))
            .await
            .unwrap();
        publisher.close().await.unwrap();
        assert_eq!(factory.memory_broker().len("file.upload"), 1);

        let mut consumer = factory.consumer::<FileUpload>(&config, &cancel).unwrap();
        let mut inbox = consumer.open().unwrap();
        let message = inbox.recv().await.unwrap();
        assert_eq!(message.value.path, "a.pdf");
        message.ack().unwrap();
        consumer.close().await.unwrap();

        assert_eq!(factory.memory_broker().committed("g", "file.upload"), Some(1));
    }
}
