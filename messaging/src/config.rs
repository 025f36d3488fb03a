//! Resolution of untyped driver options into a typed broker configuration.
//!
//! Options arrive as a loosely typed mapping decoded from the configuration
//! document. Every recognized option has a default except `brokers`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::{Map, Value};

use crate::error::{MessagingError, Result};

/// Untyped options as decoded from the configuration document.
pub type DriverOptions = Map<String, Value>;

/// Upper bound on the flush performed when a publisher closes.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-iteration poll timeout; also bounds how fast a consumer observes close.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Where a consumer group starts when it has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
    None,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
            OffsetReset::None => "none",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            "none" => Ok(OffsetReset::None),
            other => Err(MessagingError::Config(format!(
                "consumer.auto_offset_reset: unknown policy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport security settings. Unset fields leave the client on plaintext.
#[derive(Debug, Default)]
pub struct SecurityConfig {
    pub protocol: Option<String>,
    pub mechanism: Option<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

/// Producer tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSettings {
    /// Batch delay before flush, in milliseconds. 0 means no artificial delay.
    pub linger_ms: u64,
    /// Max records per batch. `None` keeps the client default.
    pub batch_size: Option<u64>,
    /// Acknowledgment durability level. `None` keeps the client default.
    pub ack: Option<String>,
    /// In-library retries on transient send failure.
    pub retries: u64,
    /// Capacity of the inbound channel handed to the application.
    pub buffer_size: usize,
    /// Deadline for flushing accepted messages on close.
    pub flush_timeout: Duration,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            linger_ms: 0,
            batch_size: None,
            ack: None,
            retries: 0,
            buffer_size: 0,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

/// Consumer tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub group_id: Option<String>,
    /// `None` keeps the client default.
    pub auto_offset_reset: Option<OffsetReset>,
    /// Capacity of the channel delivering messages to the application.
    pub buffer_size: usize,
    pub poll_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            group_id: None,
            auto_offset_reset: None,
            buffer_size: 0,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// Resolved broker configuration.
#[derive(Debug)]
pub struct BrokerConfig {
    /// Comma-separated bootstrap addresses. Never empty.
    pub bootstrap_servers: String,
    pub security: SecurityConfig,
    pub producer: ProducerSettings,
    pub consumer: ConsumerSettings,
}

impl BrokerConfig {
    /// Creates a configuration with defaults for everything but the brokers.
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            security: SecurityConfig::default(),
            producer: ProducerSettings::default(),
            consumer: ConsumerSettings::default(),
        }
    }

    /// Resolves driver options into a broker configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Config`] when `brokers` is absent or empty,
    /// or when a present option has a value of the wrong shape.
    pub fn from_options(options: &DriverOptions) -> Result<Self> {
        Ok(Self {
            bootstrap_servers: resolve_brokers(options.get("brokers"))?,
            security: SecurityConfig::from_options(options)?,
            producer: ProducerSettings::from_options(options)?,
            consumer: ConsumerSettings::from_options(options)?,
        })
    }
}

impl SecurityConfig {
    /// Reads the `security` section.
    pub fn from_options(options: &DriverOptions) -> Result<Self> {
        let Some(security) = section(options, "security")? else {
            return Ok(Self::default());
        };
        Ok(Self {
            protocol: string_option(security, "security", "protocol")?,
            mechanism: string_option(security, "security", "mechanism")?,
            username: string_option(security, "security", "username")?,
            password: string_option(security, "security", "password")?.map(SecretString::new),
        })
    }
}

impl ProducerSettings {
    /// Reads the `producer` section.
    pub fn from_options(options: &DriverOptions) -> Result<Self> {
        let mut settings = Self::default();
        let Some(producer) = section(options, "producer")? else {
            return Ok(settings);
        };

        if let Some(linger_ms) = number_option(producer, "producer", "linger_ms")? {
            settings.linger_ms = linger_ms;
        }
        settings.batch_size = number_option(producer, "producer", "batch_size")?;
        settings.ack = string_option(producer, "producer", "ack")?;
        if let Some(retries) = number_option(producer, "producer", "retries")? {
            settings.retries = retries;
        }
        if let Some(buffer_size) = number_option(producer, "producer", "buffer_size")? {
            settings.buffer_size = to_usize(buffer_size, "producer.buffer_size")?;
        }
        if let Some(ms) = number_option(producer, "producer", "flush_timeout_ms")? {
            settings.flush_timeout = Duration::from_millis(ms);
        }
        Ok(settings)
    }
}

impl ConsumerSettings {
    /// Reads the `consumer` section.
    pub fn from_options(options: &DriverOptions) -> Result<Self> {
        let mut settings = Self::default();
        let Some(consumer) = section(options, "consumer")? else {
            return Ok(settings);
        };

        settings.group_id = string_option(consumer, "consumer", "group_id")?;
        settings.auto_offset_reset = string_option(consumer, "consumer", "auto_offset_reset")?
            .map(|policy| policy.parse())
            .transpose()?;
        if let Some(buffer_size) = number_option(consumer, "consumer", "buffer_size")? {
            settings.buffer_size = to_usize(buffer_size, "consumer.buffer_size")?;
        }
        if let Some(ms) = number_option(consumer, "consumer", "poll_timeout_ms")? {
            settings.poll_timeout = Duration::from_millis(ms);
        }
        Ok(settings)
    }
}

fn resolve_brokers(value: Option<&Value>) -> Result<String> {
    let brokers: Vec<String> = match value {
        None | Some(Value::Null) => {
            return Err(MessagingError::Config(
                "brokers must be set in options".to_string(),
            ))
        }
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.trim().to_string()),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(MessagingError::Config(format!(
                    "brokers: unexpected entry {}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(Value::String(s)) => s.split(',').map(|b| b.trim().to_string()).collect(),
        Some(other) => {
            return Err(MessagingError::Config(format!(
                "brokers must be a list of addresses, got {}",
                other
            )))
        }
    };

    let brokers: Vec<String> = brokers.into_iter().filter(|b| !b.is_empty()).collect();
    if brokers.is_empty() {
        return Err(MessagingError::Config("brokers must not be empty".to_string()));
    }
    Ok(brokers.join(","))
}

fn section<'a>(options: &'a DriverOptions, name: &str) -> Result<Option<&'a DriverOptions>> {
    match options.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(MessagingError::Config(format!(
            "{} must be a mapping, got {}",
            name, other
        ))),
    }
}

fn string_option(section: &DriverOptions, prefix: &str, key: &str) -> Result<Option<String>> {
    match section.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        // YAML happily decodes `ack: 1` or `password: 1234` as scalars.
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(MessagingError::Config(format!(
            "{}.{} must be a string, got {}",
            prefix, key, other
        ))),
    }
}

/// Reads a non-negative number given as an integer, a float or a digit string.
fn number_option(section: &DriverOptions, prefix: &str, key: &str) -> Result<Option<u64>> {
    let value = match section.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };
    let invalid = || {
        MessagingError::Config(format!(
            "{}.{} must be a non-negative number, got {}",
            prefix, key, value
        ))
    };

    match value {
        Value::Number(n) => match (n.as_u64(), n.as_f64()) {
            (Some(u), _) => Ok(Some(u)),
            (None, Some(f)) if f.is_finite() && f >= 0.0 => Ok(Some(f.trunc() as u64)),
            _ => Err(invalid()),
        },
        Value::String(s) => s.trim().parse::<u64>().map(Some).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn to_usize(value: u64, name: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| MessagingError::Config(format!("{} is out of range: {}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serde_json::json;

    fn options(value: Value) -> DriverOptions {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {}", other),
        }
    }

    #[test]
    fn test_missing_brokers_is_config_error() {
        let err = BrokerConfig::from_options(&DriverOptions::new()).unwrap_err();
        assert!(matches!(err, MessagingError::Config(ref msg) if msg.contains("brokers")));
    }

    #[test]
    fn test_empty_brokers_is_config_error() {
        let err = BrokerConfig::from_options(&options(json!({"brokers": []}))).unwrap_err();
        assert!(matches!(err, MessagingError::Config(_)));
    }

    #[test]
    fn test_brokers_list_is_joined() {
        let cfg = BrokerConfig::from_options(&options(json!({
            "brokers": ["kafka-0:9092", "kafka-1:9092"]
        })))
        .unwrap();
        assert_eq!(cfg.bootstrap_servers, "kafka-0:9092,kafka-1:9092");
    }

    #[test]
    fn test_brokers_string_is_accepted() {
        let cfg = BrokerConfig::from_options(&options(json!({
            "brokers": "kafka-0:9092, kafka-1:9092"
        })))
        .unwrap();
        assert_eq!(cfg.bootstrap_servers, "kafka-0:9092,kafka-1:9092");
    }

    #[test]
    fn test_defaults_when_sections_absent() {
        let cfg = BrokerConfig::from_options(&options(json!({"brokers": ["kafka:9092"]}))).unwrap();

        assert!(cfg.security.protocol.is_none());
        assert!(cfg.security.password.is_none());
        assert_eq!(cfg.producer, ProducerSettings::default());
        assert_eq!(cfg.producer.linger_ms, 0);
        assert_eq!(cfg.producer.retries, 0);
        assert_eq!(cfg.producer.buffer_size, 0);
        assert_eq!(cfg.producer.flush_timeout, DEFAULT_FLUSH_TIMEOUT);
        assert_eq!(cfg.consumer, ConsumerSettings::default());
        assert_eq!(cfg.consumer.poll_timeout, DEFAULT_POLL_TIMEOUT);
    }

    #[test]
    fn test_full_options() {
        let cfg = BrokerConfig::from_options(&options(json!({
            "brokers": ["kafka:9092"],
            "security": {
                "protocol": "SASL_SSL",
                "mechanism": "PLAIN",
                "username": "svc",
                "password": "hunter2"
            },
            "producer": {
                "linger_ms": 5,
                "batch_size": 1000,
                "ack": "all",
                "retries": 3,
                "buffer_size": 64,
                "flush_timeout_ms": 2000
            },
            "consumer": {
                "group_id": "ocr-workers",
                "auto_offset_reset": "earliest",
                "buffer_size": 16,
                "poll_timeout_ms": 250
            }
        })))
        .unwrap();

        assert_eq!(cfg.security.protocol.as_deref(), Some("SASL_SSL"));
        assert_eq!(cfg.security.mechanism.as_deref(), Some("PLAIN"));
        assert_eq!(cfg.security.username.as_deref(), Some("svc"));
        assert_eq!(
            cfg.security.password.as_ref().map(|p| p.expose_secret().as_str()),
            Some("hunter2")
        );

        assert_eq!(cfg.producer.linger_ms, 5);
        assert_eq!(cfg.producer.batch_size, Some(1000));
        assert_eq!(cfg.producer.ack.as_deref(), Some("all"));
        assert_eq!(cfg.producer.retries, 3);
        assert_eq!(cfg.producer.buffer_size, 64);
        assert_eq!(cfg.producer.flush_timeout, Duration::from_secs(2));

        assert_eq!(cfg.consumer.group_id.as_deref(), Some("ocr-workers"));
        assert_eq!(cfg.consumer.auto_offset_reset, Some(OffsetReset::Earliest));
        assert_eq!(cfg.consumer.buffer_size, 16);
        assert_eq!(cfg.consumer.poll_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_float_and_string_numbers_are_normalized() {
        let cfg = BrokerConfig::from_options(&options(json!({
            "brokers": ["kafka:9092"],
            "producer": {"linger_ms": 10.0, "batch_size": 500.7, "retries": "2"},
            "consumer": {"buffer_size": 8.0}
        })))
        .unwrap();

        assert_eq!(cfg.producer.linger_ms, 10);
        assert_eq!(cfg.producer.batch_size, Some(500));
        assert_eq!(cfg.producer.retries, 2);
        assert_eq!(cfg.consumer.buffer_size, 8);
    }

    #[test]
    fn test_numeric_ack_is_accepted() {
        let cfg = BrokerConfig::from_options(&options(json!({
            "brokers": ["kafka:9092"],
            "producer": {"ack": -1}
        })))
        .unwrap();
        assert_eq!(cfg.producer.ack.as_deref(), Some("-1"));
    }

    #[test]
    fn test_negative_number_is_rejected() {
        let err = BrokerConfig::from_options(&options(json!({
            "brokers": ["kafka:9092"],
            "producer": {"retries": -1}
        })))
        .unwrap_err();
        assert!(matches!(err, MessagingError::Config(ref msg) if msg.contains("producer.retries")));
    }

    #[test]
    fn test_unknown_offset_reset_is_rejected() {
        let err = BrokerConfig::from_options(&options(json!({
            "brokers": ["kafka:9092"],
            "consumer": {"auto_offset_reset": "smallest"}
        })))
        .unwrap_err();
        assert!(matches!(err, MessagingError::Config(_)));
    }

    #[test]
    fn test_offset_reset_parse() {
        assert_eq!("Latest".parse::<OffsetReset>().unwrap(), OffsetReset::Latest);
        assert_eq!(" none ".parse::<OffsetReset>().unwrap(), OffsetReset::None);
        assert_eq!(OffsetReset::Earliest.to_string(), "earliest");
    }

    #[test]
    fn test_section_must_be_mapping() {
        let err = BrokerConfig::from_options(&options(json!({
            "brokers": ["kafka:9092"],
            "producer": "fast"
        })))
        .unwrap_err();
        assert!(matches!(err, MessagingError::Config(ref msg) if msg.starts_with("producer")));
    }

    #[test]
    fn test_password_is_not_printed() {
        let cfg = BrokerConfig::from_options(&options(json!({
            "brokers": ["kafka:9092"],
            "security": {"username": "svc", "password": "hunter2"}
        })))
        .unwrap();
        assert!(!format!("{:?}", cfg).contains("hunter2"));
    }
}
