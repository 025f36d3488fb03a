//! Kafka transports built on `rdkafka`.

use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::message::{Header, Headers, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::{Offset, TopicPartitionList};
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::error::{MessagingError, Result};
use crate::message::CommitToken;
use crate::transport::{
    ConsumerTransport, DeliveryFuture, OutboundRecord, ProducerTransport, RawRecord,
};

/// Which kind of client a configuration is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Producer,
    Consumer,
}

/// Translates a resolved configuration into librdkafka properties.
///
/// Tuning options are only set when configured so the client keeps its own
/// defaults otherwise. Consumers never auto-commit: progress only advances
/// through acknowledgments.
pub fn client_config(config: &BrokerConfig, role: ClientRole) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);

    let security = &config.security;
    if let Some(protocol) = &security.protocol {
        client.set("security.protocol", protocol);
    }
    if let Some(mechanism) = &security.mechanism {
        client.set("sasl.mechanism", mechanism);
        if let Some(username) = &security.username {
            client.set("sasl.username", username);
        }
        if let Some(password) = &security.password {
            client.set("sasl.password", password.expose_secret());
        }
    }

    match role {
        ClientRole::Producer => {
            let producer = &config.producer;
            if let Some(ack) = &producer.ack {
                client.set("acks", ack);
            }
            if producer.retries > 0 {
                client.set("retries", producer.retries.to_string());
            }
            if producer.linger_ms > 0 {
                client.set("linger.ms", producer.linger_ms.to_string());
            }
            if let Some(batch_size) = producer.batch_size.filter(|size| *size > 0) {
                client.set("batch.num.messages", batch_size.to_string());
            }
        }
        ClientRole::Consumer => {
            let consumer = &config.consumer;
            if let Some(group_id) = &consumer.group_id {
                client.set("group.id", group_id);
            }
            if let Some(reset) = consumer.auto_offset_reset {
                client.set("auto.offset.reset", reset.as_str());
            }
            client
                .set("enable.auto.commit", "false")
                .set("enable.partition.eof", "false");
        }
    }

    client
}

/// Producer transport over an rdkafka `FutureProducer`.
pub struct KafkaProducer {
    inner: FutureProducer,
}

impl KafkaProducer {
    /// Creates the producer client.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Connection`] if the client cannot be created.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        info!(
            "Creating Kafka producer with brokers: {}",
            config.bootstrap_servers
        );

        let inner: FutureProducer = client_config(config, ClientRole::Producer)
            .create()
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        Ok(Self { inner })
    }
}

impl ProducerTransport for KafkaProducer {
    fn enqueue(&self, record: OutboundRecord) -> Result<DeliveryFuture> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (name, value) in &record.headers {
            headers = headers.insert(Header {
                key: name,
                value: Some(value.as_str()),
            });
        }

        let mut future_record = FutureRecord::<str, [u8]>::to(&record.topic)
            .payload(record.payload.as_slice())
            .headers(headers);
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }

        let delivery = self
            .inner
            .send_result(future_record)
            .map_err(|(e, _)| MessagingError::Transport(e.to_string()))?;

        debug!(
            "Enqueued message for topic '{}' ({} bytes)",
            record.topic,
            record.payload.len()
        );

        let topic = record.topic;
        Ok(async move {
            match delivery.await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err((e, _))) => Err(MessagingError::Transport(format!(
                    "delivery to topic '{}' failed: {}",
                    topic, e
                ))),
                Err(_) => Err(MessagingError::Transport(format!(
                    "delivery to topic '{}' was cancelled",
                    topic
                ))),
            }
        }
        .boxed())
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        self.inner.flush(timeout)?;
        Ok(())
    }
}

/// Consumer transport over an rdkafka `StreamConsumer`.
pub struct KafkaConsumer {
    inner: StreamConsumer,
}

impl KafkaConsumer {
    /// Creates the consumer client.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Connection`] if the client cannot be created.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        info!(
            "Creating Kafka consumer with brokers: {}, group: {}",
            config.bootstrap_servers,
            config.consumer.group_id.as_deref().unwrap_or("<none>")
        );

        let inner: StreamConsumer = client_config(config, ClientRole::Consumer)
            .create()
            .map_err(|e| MessagingError::Connection(e.to_string()))?;

        Ok(Self { inner })
    }
}

#[async_trait]
impl ConsumerTransport for KafkaConsumer {
    fn subscribe(&self, topic: &str) -> Result<()> {
        info!("Subscribing to topic: {}", topic);
        self.inner
            .subscribe(&[topic])
            .map_err(|e| MessagingError::Connection(format!("failed to subscribe: {}", e)))
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<RawRecord>> {
        let message = match tokio::time::timeout(timeout, self.inner.recv()).await {
            Err(_) => return Ok(None),
            Ok(received) => received?,
        };

        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| {
                        (
                            header.key.to_string(),
                            header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(RawRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            headers,
        }))
    }

    /// Queues the commit with librdkafka and returns without waiting for the
    /// group coordinator. A commit the broker later rejects is not reported
    /// here; the record may then be redelivered after a restart.
    fn commit(&self, token: &CommitToken) -> Result<()> {
        let mut partitions = TopicPartitionList::new();
        partitions
            .add_partition_offset(&token.topic, token.partition, Offset::Offset(token.offset + 1))
            .map_err(|e| MessagingError::Commit(e.to_string()))?;

        self.inner
            .commit(&partitions, CommitMode::Async)
            .map_err(|e| MessagingError::Commit(e.to_string()))
    }

    fn close(&self) -> Result<()> {
        self.inner.unsubscribe();
        Ok(())
    }
}
