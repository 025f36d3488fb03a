//! Typed publish/subscribe messaging.
//!
//! This crate moves strongly typed messages between application code and a
//! byte-oriented broker, built on `tokio` with `rdkafka` as the Kafka client.
//!
//! # Features
//!
//! - Payload types bound to wire topic names through a [`TopicRegistry`]
//! - [`Publisher`] with a channel-based send path and background delivery reports
//! - [`Consumer`] delivering [`Message`]s with per-record acknowledgment
//! - JSON serialization/deserialization
//! - Bad records are logged and skipped without stopping the stream
//! - Graceful shutdown with a bounded flush
//! - Driver selection (`kafka` or the in-process `memory` broker) from a YAML document
//! - Integrated tracing
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use messaging::{load_config, register_topics, MessagingFactory};
//! use serde::{Deserialize, Serialize};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct FileUpload {
//!     path: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = register_topics![FileUpload => "file.upload"]?;
//!     let factory = MessagingFactory::new(Arc::new(registry));
//!     let config = load_config(None)?;
//!     let shutdown = CancellationToken::new();
//!
//!     let mut consumer = factory.consumer::<FileUpload>(&config, &shutdown)?;
//!     let mut inbox = consumer.open()?;
//!     while let Some(message) = inbox.recv().await {
//!         println!("uploaded: {}", message.value.path);
//!         message.ack()?;
//!     }
//!     consumer.close().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod consumer;
mod error;
mod factory;
#[cfg(feature = "kafka")]
mod kafka;
mod memory;
mod message;
mod producer;
mod transport;

pub use config::{
    BrokerConfig, ConsumerSettings, DriverOptions, OffsetReset, ProducerSettings, SecurityConfig,
    DEFAULT_FLUSH_TIMEOUT, DEFAULT_POLL_TIMEOUT,
};
pub use consumer::Consumer;
pub use error::{MessagingError, Result};
pub use factory::{
    load_config, parse_config, Driver, FactoryConfig, MessagingFactory, CONFIG_PATH_ENV,
    DEFAULT_CONFIG_PATH,
};
#[cfg(feature = "kafka")]
pub use kafka::{client_config, ClientRole, KafkaConsumer, KafkaProducer};
pub use memory::{MemoryBroker, MemoryConsumer, MemoryProducer};
pub use message::{CommitToken, Message};
pub use producer::Publisher;
pub use transport::{
    ConsumerTransport, DeliveryFuture, OutboundRecord, ProducerTransport, RawRecord,
};

/// Re-export the registry types for convenience
pub use messaging_topics::{register_topics, Payload, RegistryError, Topic, TopicRegistry};
