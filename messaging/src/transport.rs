//! Broker transport seams.
//!
//! The publisher and consumer pumps only talk to the broker through these
//! traits, so the same lifecycle runs over rdkafka or the in-process broker.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::message::CommitToken;

/// A record as fetched from the broker, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RawRecord {
    /// Position of this record, used to commit progress past it.
    pub fn commit_token(&self) -> CommitToken {
        CommitToken {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// An encoded record ready to hand to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

/// Resolves once the broker reports the outcome of a previously enqueued record.
pub type DeliveryFuture = BoxFuture<'static, Result<()>>;

/// Consuming side of a broker client.
#[async_trait]
pub trait ConsumerTransport: Send + Sync {
    /// Subscribes to a single topic.
    fn subscribe(&self, topic: &str) -> Result<()>;

    /// Fetches the next record, waiting at most `timeout`.
    ///
    /// `Ok(None)` means the timeout elapsed with nothing to read. Any error
    /// is a transport failure.
    async fn poll(&self, timeout: Duration) -> Result<Option<RawRecord>>;

    /// Commits progress past the record identified by `token`.
    fn commit(&self, token: &CommitToken) -> Result<()>;

    /// Leaves the subscription. The client itself is released on drop.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Producing side of a broker client.
pub trait ProducerTransport: Send + Sync {
    /// Hands a record to the client without waiting for delivery.
    fn enqueue(&self, record: OutboundRecord) -> Result<DeliveryFuture>;

    /// Blocks until every enqueued record is delivered or `timeout` elapses.
    fn flush(&self, timeout: Duration) -> Result<()>;
}
