//! In-process broker.
//!
//! One partition per topic, with committed offsets tracked per consumer group.
//! Backs the `memory` driver and runs the full publish/consume lifecycle
//! without a cluster.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Notify;
use tracing::debug;

use crate::config::{ConsumerSettings, OffsetReset};
use crate::error::{MessagingError, Result};
use crate::message::CommitToken;
use crate::transport::{
    ConsumerTransport, DeliveryFuture, OutboundRecord, ProducerTransport, RawRecord,
};

#[derive(Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    headers: Vec<(String, Vec<u8>)>,
}

#[derive(Default)]
struct Log {
    topics: HashMap<String, Vec<StoredRecord>>,
    /// (group, topic) -> next offset to read.
    committed: HashMap<(String, String), i64>,
    poll_failure: Option<String>,
}

#[derive(Default)]
struct BrokerState {
    log: Mutex<Log>,
    appended: Notify,
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> MutexGuard<'_, Log> {
        self.inner.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, topic: &str, record: StoredRecord) -> i64 {
        let offset = {
            let mut log = self.log();
            let records = log.topics.entry(topic.to_string()).or_default();
            records.push(record);
            records.len() as i64 - 1
        };
        self.inner.appended.notify_waiters();
        offset
    }

    /// Creates a producer client.
    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
        }
    }

    /// Creates a consumer client. Without an offset reset policy the
    /// consumer starts from the earliest record.
    pub fn consumer(&self, settings: &ConsumerSettings) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            group_id: settings.group_id.clone(),
            reset: settings.auto_offset_reset.unwrap_or(OffsetReset::Earliest),
            cursor: Arc::new(Mutex::new(Cursor::default())),
        }
    }

    /// Appends raw bytes to a topic, bypassing any codec. Returns the offset.
    pub fn publish_raw(&self, topic: &str, key: Option<&str>, payload: impl Into<Vec<u8>>) -> i64 {
        self.append(
            topic,
            StoredRecord {
                key: key.map(|k| k.as_bytes().to_vec()),
                payload: Some(payload.into()),
                headers: Vec::new(),
            },
        )
    }

    /// Number of records stored on a topic.
    pub fn len(&self, topic: &str) -> usize {
        self.log().topics.get(topic).map_or(0, Vec::len)
    }

    /// Next offset the group will read on the topic, if it has committed.
    pub fn committed(&self, group_id: &str, topic: &str) -> Option<i64> {
        self.log()
            .committed
            .get(&(group_id.to_string(), topic.to_string()))
            .copied()
    }

    /// Makes every subsequent poll fail with a transport error.
    pub fn fail_polls(&self, reason: impl Into<String>) {
        self.log().poll_failure = Some(reason.into());
        self.inner.appended.notify_waiters();
    }
}

/// Producer client of a [`MemoryBroker`]. Delivery succeeds on enqueue.
pub struct MemoryProducer {
    broker: MemoryBroker,
}

impl ProducerTransport for MemoryProducer {
    fn enqueue(&self, record: OutboundRecord) -> Result<DeliveryFuture> {
        let offset = self.broker.append(
            &record.topic,
            StoredRecord {
                key: record.key.map(String::into_bytes),
                payload: Some(record.payload),
                headers: record
                    .headers
                    .into_iter()
                    .map(|(name, value)| (name, value.into_bytes()))
                    .collect(),
            },
        );
        debug!("Stored record on topic '{}' at offset {}", record.topic, offset);
        Ok(futures::future::ready(Ok(())).boxed())
    }

    fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Cursor {
    topic: Option<String>,
    position: Option<i64>,
    fetched: usize,
}

/// Consumer client of a [`MemoryBroker`].
///
/// Clones share the same cursor, which lets a caller observe how far a
/// consumer it handed off has read.
#[derive(Clone)]
pub struct MemoryConsumer {
    broker: MemoryBroker,
    group_id: Option<String>,
    reset: OffsetReset,
    cursor: Arc<Mutex<Cursor>>,
}

impl MemoryConsumer {
    fn cursor(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of records fetched from the broker so far.
    pub fn fetched(&self) -> usize {
        self.cursor().fetched
    }

    fn next_record(&self) -> Result<Option<RawRecord>> {
        let log = self.broker.log();
        if let Some(reason) = &log.poll_failure {
            return Err(MessagingError::Transport(reason.clone()));
        }

        let mut cursor = self.cursor();
        let topic = cursor
            .topic
            .clone()
            .ok_or_else(|| MessagingError::Transport("consumer is not subscribed".to_string()))?;
        let records = log.topics.get(&topic).map(Vec::as_slice).unwrap_or_default();

        let position = match cursor.position {
            Some(position) => position,
            None => {
                let committed = self
                    .group_id
                    .as_ref()
                    .and_then(|group| log.committed.get(&(group.clone(), topic.clone())))
                    .copied();
                let start = match (committed, self.reset) {
                    (Some(offset), _) => offset,
                    (None, OffsetReset::Earliest) => 0,
                    (None, OffsetReset::Latest) => records.len() as i64,
                    (None, OffsetReset::None) => {
                        return Err(MessagingError::Transport(format!(
                            "no committed offset for topic '{}'",
                            topic
                        )))
                    }
                };
                cursor.position = Some(start);
                start
            }
        };

        let Some(stored) = usize::try_from(position).ok().and_then(|i| records.get(i)) else {
            return Ok(None);
        };
        let stored = stored.clone();
        cursor.position = Some(position + 1);
        cursor.fetched += 1;

        Ok(Some(RawRecord {
            topic,
            partition: 0,
            offset: position,
            key: stored.key,
            payload: stored.payload,
            headers: stored.headers,
        }))
    }
}

#[async_trait]
impl ConsumerTransport for MemoryConsumer {
    fn subscribe(&self, topic: &str) -> Result<()> {
        let mut cursor = self.cursor();
        if cursor.topic.as_deref() != Some(topic) {
            cursor.topic = Some(topic.to_string());
            cursor.position = None;
        }
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<RawRecord>> {
        let appended = self.broker.inner.appended.notified();
        tokio::pin!(appended);
        // Register before checking so an append in between is not missed.
        appended.as_mut().enable();

        if let Some(record) = self.next_record()? {
            return Ok(Some(record));
        }
        if tokio::time::timeout(timeout, appended).await.is_err() {
            return Ok(None);
        }
        self.next_record()
    }

    fn commit(&self, token: &CommitToken) -> Result<()> {
        let group = self
            .group_id
            .clone()
            .ok_or_else(|| MessagingError::Commit("no consumer group configured".to_string()))?;
        self.broker
            .log()
            .committed
            .insert((group, token.topic.clone()), token.offset + 1);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.cursor().topic = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(group: &str) -> ConsumerSettings {
        ConsumerSettings {
            group_id: Some(group.to_string()),
            ..ConsumerSettings::default()
        }
    }

    #[tokio::test]
    async fn test_poll_times_out_on_empty_topic() {
        let broker = MemoryBroker::new();
        let consumer = broker.consumer(&settings("g"));
        consumer.subscribe("t").unwrap();

        let polled = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert!(polled.is_none());
    }

    #[tokio::test]
    async fn test_poll_wakes_on_append() {
        let broker = MemoryBroker::new();
        let consumer = broker.consumer(&settings("g"));
        consumer.subscribe("t").unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish_raw("t", Some("a"), b"1".to_vec());
        });

        let record = consumer.poll(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(record.offset, 0);
        assert_eq!(record.key.as_deref(), Some(&b"a"[..]));
    }

    #[tokio::test]
    async fn test_commit_resumes_group() {
        let broker = MemoryBroker::new();
        broker.publish_raw("t", None, b"0".to_vec());
        broker.publish_raw("t", None, b"1".to_vec());

        let first = broker.consumer(&settings("g"));
        first.subscribe("t").unwrap();
        let record = first.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        first.commit(&record.commit_token()).unwrap();
        assert_eq!(broker.committed("g", "t"), Some(1));

        let second = broker.consumer(&settings("g"));
        second.subscribe("t").unwrap();
        let record = second.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(record.offset, 1);
    }

    #[tokio::test]
    async fn test_latest_skips_existing_records() {
        let broker = MemoryBroker::new();
        broker.publish_raw("t", None, b"old".to_vec());

        let consumer = broker.consumer(&ConsumerSettings {
            auto_offset_reset: Some(OffsetReset::Latest),
            ..settings("g")
        });
        consumer.subscribe("t").unwrap();
        assert!(consumer.poll(Duration::from_millis(10)).await.unwrap().is_none());

        broker.publish_raw("t", None, b"new".to_vec());
        let record = consumer.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(record.payload.as_deref(), Some(&b"new"[..]));
    }

    #[tokio::test]
    async fn test_commit_without_group_fails() {
        let broker = MemoryBroker::new();
        let consumer = broker.consumer(&ConsumerSettings::default());
        let token = CommitToken {
            topic: "t".to_string(),
            partition: 0,
            offset: 0,
        };
        assert!(matches!(consumer.commit(&token), Err(MessagingError::Commit(_))));
    }

    #[tokio::test]
    async fn test_failed_polls_surface_transport_error() {
        let broker = MemoryBroker::new();
        let consumer = broker.consumer(&settings("g"));
        consumer.subscribe("t").unwrap();
        broker.fail_polls("broker went away");

        let err = consumer.poll(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, MessagingError::Transport(ref msg) if msg == "broker went away"));
    }

    #[test]
    fn test_producer_enqueue_appends() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        let record = OutboundRecord {
            topic: "t".to_string(),
            key: Some("k".to_string()),
            payload: b"{}".to_vec(),
            headers: HashMap::from([("h".to_string(), "v".to_string())]),
        };

        let _delivery = producer.enqueue(record).unwrap();
        assert_eq!(broker.len("t"), 1);
        assert!(producer.flush(Duration::from_millis(1)).is_ok());
    }
}
