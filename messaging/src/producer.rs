//! Typed publisher.
//!
//! Application code writes [`Message`]s to the channel returned by
//! [`Publisher::open`]. A background pump encodes each payload and hands it
//! to the broker; a second task drains delivery reports and logs failures.
//! Delivery is fire-and-forget from the caller's point of view.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use messaging_topics::{Payload, Topic, TopicRegistry};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProducerSettings;
use crate::error::{MessagingError, Result};
use crate::message::Message;
use crate::transport::{DeliveryFuture, OutboundRecord, ProducerTransport};

/// Delivery reports the pump may hand over before the drain picks them up.
const DELIVERY_QUEUE: usize = 1000;

/// Publishes messages of type `T` to the topic registered for `T`.
///
/// # Example
///
/// ```no_run
/// use messaging::{register_topics, BrokerConfig, MemoryBroker, Message, Publisher};
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
/// let config = BrokerConfig::new("in-process");
///
/// let mut publisher = Publisher::<UserCreated>::new(
///     broker.producer(),
///     &registry,
///     &config.producer,
///     &CancellationToken::new(),
/// )?;
/// let outbox = publisher.open()?;
/// outbox
///     .send(Message::new(UserCreated { user_id: "123".to_string() }).with_key("123"))
///     .await
///     .ok();
/// publisher.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Publisher<T: Payload> {
    transport: Arc<dyn ProducerTransport>,
    topic: Topic<T>,
    buffer: usize,
    flush_timeout: Duration,
    cancel: CancellationToken,
    opened: bool,
    tasks: Option<(JoinHandle<Result<()>>, JoinHandle<()>)>,
    closed: bool,
}

impl<T: Payload> Publisher<T> {
    /// Creates a publisher over a broker transport.
    ///
    /// The topic is resolved from the registry now; the instance stops when
    /// either [`close`](Self::close) is called or `parent` is cancelled.
    ///
    /// # Arguments
    ///
    /// * `transport` - Broker client to hand records to (e.g., `KafkaProducer`)
    /// * `registry` - Registry `T` is bound in
    /// * `settings` - Channel capacity and flush deadline
    /// * `parent` - Cancelling it stops this publisher too
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Registry`] if `T` has no registered topic.
    pub fn new(
        transport: impl ProducerTransport + 'static,
        registry: &TopicRegistry,
        settings: &ProducerSettings,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let topic = registry.topic::<T>()?;
        info!("Creating publisher for topic '{}'", topic.name());

        Ok(Self {
            transport: Arc::new(transport),
            topic,
            buffer: settings.buffer_size,
            flush_timeout: settings.flush_timeout,
            cancel: parent.child_token(),
            opened: false,
            tasks: None,
            closed: false,
        })
    }

    /// The wire name of the topic this publisher writes to.
    pub fn topic(&self) -> &str {
        self.topic.name()
    }

    /// Starts the background tasks and returns the channel to publish on.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::AlreadyOpen`] on a second call.
    pub fn open(&mut self) -> Result<mpsc::Sender<Message<T>>> {
        if self.opened {
            return Err(MessagingError::AlreadyOpen);
        }
        self.opened = true;

        // A bounded channel needs at least one slot; 0 means "as unbuffered as possible".
        let (tx, rx) = mpsc::channel(self.buffer.max(1));
        let (reports_tx, reports_rx) = mpsc::channel(DELIVERY_QUEUE);

        let reports = tokio::spawn(drain_delivery_reports(
            self.topic.name().to_string(),
            reports_rx,
        ));
        let pump = tokio::spawn(pump(
            self.topic.clone(),
            Arc::clone(&self.transport),
            rx,
            reports_tx,
            self.cancel.clone(),
            self.flush_timeout,
        ));
        self.tasks = Some((pump, reports));

        info!("Publisher opened for topic '{}'", self.topic.name());
        Ok(tx)
    }

    /// Stops accepting messages, flushes what was accepted and releases the
    /// broker client.
    ///
    /// Returns within the flush deadline even if the broker is stuck;
    /// delivery reports still outstanding at the deadline are abandoned.
    /// Calling `close` again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the flush error, [`MessagingError::Transport`] if the deadline
    /// passed before the flush finished, or [`MessagingError::Shutdown`] if a
    /// background task panicked.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cancel.cancel();

        let Some((mut pump, mut reports)) = self.tasks.take() else {
            // Never opened: nothing was accepted, but flush anything the
            // client may still hold.
            return flush(Arc::clone(&self.transport), self.flush_timeout).await;
        };

        let deadline = Instant::now() + self.flush_timeout;
        let flushed = match tokio::time::timeout_at(deadline, &mut pump).await {
            Ok(joined) => {
                joined.map_err(|e| MessagingError::Shutdown(format!("publisher pump: {}", e)))?
            }
            Err(_) => {
                pump.abort();
                reports.abort();
                error!(
                    "Publisher for topic '{}' did not flush within {:?}",
                    self.topic.name(),
                    self.flush_timeout
                );
                return Err(MessagingError::Transport(format!(
                    "publisher did not flush within {:?}",
                    self.flush_timeout
                )));
            }
        };

        match tokio::time::timeout_at(deadline, &mut reports).await {
            Ok(joined) => {
                joined.map_err(|e| MessagingError::Shutdown(format!("delivery reports: {}", e)))?
            }
            Err(_) => {
                warn!(
                    "Delivery reports for topic '{}' still pending after {:?}, abandoning",
                    self.topic.name(),
                    self.flush_timeout
                );
                reports.abort();
            }
        }

        info!("Publisher closed for topic '{}'", self.topic.name());
        flushed
    }
}

impl<T: Payload> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pump<T: Payload>(
    topic: Topic<T>,
    transport: Arc<dyn ProducerTransport>,
    mut rx: mpsc::Receiver<Message<T>>,
    reports: mpsc::Sender<DeliveryFuture>,
    cancel: CancellationToken,
    flush_timeout: Duration,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(message) => {
                    publish_one(&topic, transport.as_ref(), &reports, &cancel, message).await
                }
                None => break,
            },
        }
    }

    // Stop accepting, then hand over whatever was already buffered.
    rx.close();
    while let Ok(message) = rx.try_recv() {
        publish_one(&topic, transport.as_ref(), &reports, &cancel, message).await;
    }
    drop(reports);

    debug!("Flushing publisher for topic '{}'", topic.name());
    flush(transport, flush_timeout).await
}

async fn publish_one<T: Payload>(
    topic: &Topic<T>,
    transport: &dyn ProducerTransport,
    reports: &mpsc::Sender<DeliveryFuture>,
    cancel: &CancellationToken,
    message: Message<T>,
) {
    let payload = match message.value.encode() {
        Ok(payload) => payload,
        Err(e) => {
            let err = MessagingError::Serialization(e.to_string());
            error!("Dropping message for topic '{}': {}", topic.name(), err);
            return;
        }
    };

    debug!(
        "Sending message to topic '{}' ({} bytes)",
        topic.name(),
        payload.len()
    );

    let record = OutboundRecord {
        topic: topic.name().to_string(),
        key: message.key,
        payload,
        headers: message.headers,
    };

    let delivery = match transport.enqueue(record) {
        Ok(delivery) => delivery,
        Err(e) => {
            error!("Failed to send message to topic '{}': {}", topic.name(), e);
            return;
        }
    };

    // Once closing, a full report queue must not hold up the flush.
    tokio::select! {
        biased;
        sent = reports.send(delivery) => {
            if sent.is_err() {
                warn!("Delivery report drain for topic '{}' is gone", topic.name());
            }
        }
        _ = cancel.cancelled() => {
            warn!("Dropping delivery report for topic '{}' during shutdown", topic.name());
        }
    }
}

/// Awaits delivery reports concurrently, so one slow report never holds up
/// the ones behind it.
async fn drain_delivery_reports(topic: String, mut reports: mpsc::Receiver<DeliveryFuture>) {
    let mut in_flight = FuturesUnordered::new();
    let mut accepting = true;

    loop {
        tokio::select! {
            next = reports.recv(), if accepting => match next {
                Some(delivery) => in_flight.push(delivery),
                None => accepting = false,
            },
            Some(delivered) = in_flight.next(), if !in_flight.is_empty() => {
                if let Err(e) = delivered {
                    error!("Delivery to topic '{}' failed: {}", topic, e);
                }
            }
            else => break,
        }
    }
}

/// Flushes on a blocking thread, bounded by `timeout` even if the client
/// ignores its own deadline.
async fn flush(transport: Arc<dyn ProducerTransport>, timeout: Duration) -> Result<()> {
    let flushing = tokio::task::spawn_blocking(move || transport.flush(timeout));
    match tokio::time::timeout(timeout, flushing).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(MessagingError::Shutdown(format!("flush task: {}", e))),
        Err(_) => {
            warn!("Flush did not finish within {:?}", timeout);
            Err(MessagingError::Transport(format!(
                "flush did not finish within {:?}",
                timeout
            )))
        }
    }
}
