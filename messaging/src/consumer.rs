//! Typed consumer.
//!
//! A single polling task pulls raw records, decodes them into the payload
//! type registered for the topic and delivers [`Message`]s on the channel
//! returned by [`Consumer::open`]. Records are processed strictly in order,
//! so per-partition ordering from the broker is preserved. When the channel
//! is full the polling task waits, which in turn holds back offset progress.
//!
//! Decode failures skip the offending record. Any non-timeout poll error
//! ends the stream: the channel closes and the consumer is done.

use std::sync::Arc;
use std::time::Duration;

use messaging_topics::{Payload, Topic, TopicRegistry};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConsumerSettings;
use crate::error::{MessagingError, Result};
use crate::message::{CommitToken, Message};
use crate::transport::ConsumerTransport;

/// Consumes messages of type `T` from the topic registered for `T`.
///
/// # Example
///
/// ```no_run
/// use messaging::{register_topics, ConsumerSettings, Consumer, MemoryBroker};
/// use serde::{Deserialize, Serialize};
/// use tokio_util::sync::CancellationToken;
///
/// #[derive(Debug, Default, Serialize, Deserialize)]
/// struct UserCreated {
///     user_id: String,
/// }
///
/// # async fn example() -> messaging::Result<()> {
/// let registry = register_topics![UserCreated => "user.created"]?;
/// let broker = MemoryBroker::new();
/// let settings = ConsumerSettings {
///     group_id: Some("user-service".to_string()),
///     ..ConsumerSettings::default()
/// };
///
/// let mut consumer = Consumer::<UserCreated>::new(
///     broker.consumer(&settings),
///     &registry,
///     &settings,
///     &CancellationToken::new(),
/// )?;
/// let mut inbox = consumer.open()?;
/// while let Some(message) = inbox.recv().await {
///     println!("user created: {}", message.value.user_id);
///     message.ack()?;
/// }
/// consumer.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Consumer<T: Payload> {
    transport: Arc<dyn ConsumerTransport>,
    topic: Topic<T>,
    buffer: usize,
    poll_timeout: Duration,
    cancel: CancellationToken,
    opened: bool,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl<T: Payload> Consumer<T> {
    /// Creates a consumer over a broker transport.
    ///
    /// The topic is resolved from the registry now; the instance stops when
    /// either [`close`](Self::close) is called or `parent` is cancelled.
    ///
    /// # Arguments
    ///
    /// * `transport` - Broker client to poll records from (e.g., `KafkaConsumer`)
    /// * `registry` - Registry `T` is bound in
    /// * `settings` - Channel capacity and poll timeout
    /// * `parent` - Cancelling it stops this consumer too
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Registry`] if `T` has no registered topic.
    pub fn new(
        transport: impl ConsumerTransport + 'static,
        registry: &TopicRegistry,
        settings: &ConsumerSettings,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let topic = registry.topic::<T>()?;
        info!("Creating consumer for topic '{}'", topic.name());

        Ok(Self {
            transport: Arc::new(transport),
            topic,
            buffer: settings.buffer_size,
            poll_timeout: settings.poll_timeout,
            cancel: parent.child_token(),
            opened: false,
            task: None,
            closed: false,
        })
    }

    /// The wire name of the topic this consumer reads.
    pub fn topic(&self) -> &str {
        self.topic.name()
    }

    /// Subscribes to the topic and starts the polling task.
    ///
    /// The returned channel closes when the consumer is closed, cancelled, or
    /// hits a fatal transport error.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::AlreadyOpen`] on a second call, or the
    /// transport's subscribe error.
    pub fn open(&mut self) -> Result<mpsc::Receiver<Message<T>>> {
        if self.opened {
            return Err(MessagingError::AlreadyOpen);
        }
        self.transport.subscribe(self.topic.name())?;
        self.opened = true;

        let (tx, rx) = mpsc::channel(self.buffer.max(1));
        self.task = Some(tokio::spawn(poll_loop(
            self.topic.clone(),
            Arc::clone(&self.transport),
            tx,
            self.cancel.clone(),
            self.poll_timeout,
        )));

        info!("Consumer opened for topic '{}'", self.topic.name());
        Ok(rx)
    }

    /// Commits progress past the record identified by `token`.
    ///
    /// Equivalent to [`Message::ack`] for the message carrying the token.
    pub fn ack(&self, token: &CommitToken) -> Result<()> {
        self.transport.commit(token)
    }

    /// Stops the polling task and leaves the subscription.
    ///
    /// Returns within roughly one poll timeout. Calling `close` again is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Shutdown`] if the polling task panicked, or
    /// the transport's close error.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| MessagingError::Shutdown(format!("consumer poll loop: {}", e)))?;
        }
        self.transport.close()?;

        info!("Consumer closed for topic '{}'", self.topic.name());
        Ok(())
    }
}

impl<T: Payload> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop<T: Payload>(
    topic: Topic<T>,
    transport: Arc<dyn ConsumerTransport>,
    tx: mpsc::Sender<Message<T>>,
    cancel: CancellationToken,
    poll_timeout: Duration,
) {
    info!("Starting consumer loop for topic '{}'", topic.name());

    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            polled = transport.poll(poll_timeout) => polled,
        };

        let record = match polled {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                error!("Error receiving message from topic '{}': {}", topic.name(), e);
                break;
            }
        };

        debug!(
            "Received message from topic '{}' (partition: {}, offset: {})",
            record.topic, record.partition, record.offset
        );

        let Some(payload) = record.payload.as_deref() else {
            warn!(
                "Skipping message with no payload from topic '{}' (partition: {}, offset: {})",
                record.topic, record.partition, record.offset
            );
            continue;
        };

        let mut value = topic.allocate();
        if let Err(e) = value.decode_into(payload) {
            let err = MessagingError::Deserialization(e.to_string());
            warn!(
                "Skipping message from topic '{}' (partition: {}, offset: {}): {}",
                record.topic, record.partition, record.offset, err
            );
            continue;
        }

        let message = Message::consumed(record, value, Arc::clone(&transport));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(message) => {
                if sent.is_err() {
                    debug!("Receiver for topic '{}' dropped", topic.name());
                    break;
                }
            }
        }
    }

    info!("Consumer loop stopped for topic '{}'", topic.name());
}
