//! The typed envelope exchanged with application code.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{MessagingError, Result};
use crate::transport::{ConsumerTransport, RawRecord};

/// Identifies a consumed record so its position can be committed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitToken {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Commits one record's position at most once.
struct Acker {
    transport: Arc<dyn ConsumerTransport>,
    token: CommitToken,
    acked: AtomicBool,
}

impl Acker {
    fn ack(&self) -> Result<()> {
        if self.acked.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.transport.commit(&self.token) {
            // Leave the record un-acked so the caller may retry.
            self.acked.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }
}

/// A typed message: key, payload, headers and, on the consuming side, an
/// acknowledgment that commits the originating record.
///
/// # Example
///
/// ```
/// use messaging::Message;
///
/// let message = Message::new(42u32)
///     .with_key("user-1")
///     .with_header("trace-id", "abc");
/// assert_eq!(message.key.as_deref(), Some("user-1"));
/// assert!(message.commit_token().is_none());
/// ```
pub struct Message<T> {
    /// Partitioning/identity key.
    pub key: Option<String>,
    pub value: T,
    pub headers: HashMap<String, String>,
    acker: Option<Acker>,
}

impl<T> Message<T> {
    /// Creates an outgoing message with no key and no headers.
    pub fn new(value: T) -> Self {
        Self {
            key: None,
            value,
            headers: HashMap::new(),
            acker: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Builds a consumer-side envelope for a decoded record.
    pub(crate) fn consumed(
        record: RawRecord,
        value: T,
        transport: Arc<dyn ConsumerTransport>,
    ) -> Self {
        let token = record.commit_token();
        let key = record
            .key
            .map(|key| String::from_utf8_lossy(&key).into_owned());
        let headers = record
            .headers
            .into_iter()
            .map(|(name, value)| (name, String::from_utf8_lossy(&value).into_owned()))
            .collect();

        Self {
            key,
            value,
            headers,
            acker: Some(Acker {
                transport,
                token,
                acked: AtomicBool::new(false),
            }),
        }
    }

    /// Position of the originating record, for consumer-side messages.
    pub fn commit_token(&self) -> Option<&CommitToken> {
        self.acker.as_ref().map(|acker| &acker.token)
    }

    /// Commits the originating record's position.
    ///
    /// Does not block on the broker: the Kafka transport queues the commit
    /// and returns, so an `Ok` means the commit was accepted by the client,
    /// not yet stored by the group coordinator. A commit lost before it is
    /// stored leads to redelivery after a restart, never to a skipped record.
    ///
    /// Only the first successful call commits; later calls are no-ops. A
    /// failed commit leaves the message un-acked and may be retried.
    ///
    /// # Errors
    ///
    /// [`MessagingError::NotAckable`] for messages that were not consumed,
    /// or the broker's commit error.
    pub fn ack(&self) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.ack(),
            None => Err(MessagingError::NotAckable),
        }
    }

    pub fn is_acked(&self) -> bool {
        self.acker
            .as_ref()
            .is_some_and(|acker| acker.acked.load(Ordering::Acquire))
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("headers", &self.headers)
            .field("commit_token", &self.commit_token())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingTransport {
        commits: AtomicUsize,
        failing: AtomicBool,
    }

    #[async_trait]
    impl ConsumerTransport for CountingTransport {
        fn subscribe(&self, _topic: &str) -> Result<()> {
            Ok(())
        }

        async fn poll(&self, _timeout: Duration) -> Result<Option<RawRecord>> {
            Ok(None)
        }

        fn commit(&self, _token: &CommitToken) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(MessagingError::Commit("broker unavailable".to_string()));
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record() -> RawRecord {
        RawRecord {
            topic: "file.upload".to_string(),
            partition: 2,
            offset: 17,
            key: Some(b"user-1".to_vec()),
            payload: Some(b"{}".to_vec()),
            headers: vec![("trace-id".to_string(), b"abc".to_vec())],
        }
    }

    #[test]
    fn test_outgoing_message_is_not_ackable() {
        let message = Message::new("payload").with_key("k");
        assert!(matches!(message.ack(), Err(MessagingError::NotAckable)));
        assert!(!message.is_acked());
    }

    #[test]
    fn test_consumed_message_decodes_key_and_headers() {
        let transport = Arc::new(CountingTransport::default());
        let message = Message::consumed(record(), (), transport);

        assert_eq!(message.key.as_deref(), Some("user-1"));
        assert_eq!(message.headers.get("trace-id").map(String::as_str), Some("abc"));
        assert_eq!(
            message.commit_token(),
            Some(&CommitToken {
                topic: "file.upload".to_string(),
                partition: 2,
                offset: 17,
            })
        );
    }

    #[test]
    fn test_ack_commits_once() {
        let transport = Arc::new(CountingTransport::default());
        let message = Message::consumed(record(), (), transport.clone());

        message.ack().unwrap();
        message.ack().unwrap();

        assert!(message.is_acked());
        assert_eq!(transport.commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_ack_can_be_retried() {
        let transport = Arc::new(CountingTransport::default());
        transport.failing.store(true, Ordering::SeqCst);
        let message = Message::consumed(record(), (), transport.clone());

        assert!(matches!(message.ack(), Err(MessagingError::Commit(_))));
        assert!(!message.is_acked());

        transport.failing.store(false, Ordering::SeqCst);
        message.ack().unwrap();
        assert!(message.is_acked());
        assert_eq!(transport.commits.load(Ordering::SeqCst), 1);
    }
}
