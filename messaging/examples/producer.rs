//! Example producer demonstrating type-safe publishing.
//!
//! This example shows how to:
//! - Bind message types to topics with the `register_topics!` macro
//! - Create a Publisher through the MessagingFactory
//! - Send typed messages with keys and headers
//! - Close the publisher so buffered messages are flushed
//!
//! To run this example:
//! ```bash
//! cargo run --example producer
//! ```
//!
//! Make sure you have a Kafka broker running on localhost:9092, or point
//! `MESSAGING_CONFIG` at a configuration document.

use std::sync::Arc;
use std::time::Duration;

use messaging::{load_config, register_topics, FactoryConfig, Message, MessagingFactory};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

/// Example message type for user creation events
#[derive(Debug, Default, Serialize, Deserialize)]
struct UserCreated {
    user_id: String,
    email: String,
    name: String,
    timestamp: u64,
}

/// Example message type for order placement events
#[derive(Debug, Default, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
    user_id: String,
    amount: f64,
    items: Vec<String>,
}

fn config() -> anyhow::Result<FactoryConfig> {
    if std::env::var_os(messaging::CONFIG_PATH_ENV).is_some() {
        return Ok(load_config(None)?);
    }

    let brokers = std::env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string());
    let options = json!({
        "brokers": brokers,
        "producer": { "linger_ms": 5, "ack": "all", "flush_timeout_ms": 5000 },
    });
    let serde_json::Value::Object(options) = options else {
        anyhow::bail!("producer options must be a mapping");
    };
    Ok(FactoryConfig::new("kafka", options))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting producer example");

    let registry = register_topics![
        UserCreated => "user.created",
        OrderPlaced => "order.placed",
    ]?;
    let factory = MessagingFactory::new(Arc::new(registry));
    let config = config()?;
    let shutdown = CancellationToken::new();

    let mut users = factory.publisher::<UserCreated>(&config, &shutdown)?;
    let mut orders = factory.publisher::<OrderPlaced>(&config, &shutdown)?;
    let user_outbox = users.open()?;
    let order_outbox = orders.open()?;
    info!("Publishers opened on '{}' and '{}'", users.topic(), orders.topic());

    for i in 1..=5 {
        let user = UserCreated {
            user_id: format!("user-{}", i),
            email: format!("user{}@example.com", i),
            name: format!("User {}", i),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)?
                .as_secs(),
        };

        info!("Sending UserCreated event for user_id: {}", user.user_id);
        let key = user.user_id.clone();
        user_outbox
            .send(Message::new(user).with_key(key).with_header("source", "producer-example"))
            .await?;

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for i in 1..=3 {
        let order = OrderPlaced {
            order_id: format!("order-{}", i),
            user_id: format!("user-{}", i),
            amount: 99.99 * i as f64,
            items: vec![format!("item-{}", i), format!("item-{}", i + 1)],
        };

        info!("Sending OrderPlaced event for order_id: {}", order.order_id);
        // Keyed by user so all orders for one user land on the same partition
        let key = order.user_id.clone();
        order_outbox.send(Message::new(order).with_key(key)).await?;
    }

    info!("Closing publishers");
    users.close().await?;
    orders.close().await?;

    info!("All messages sent successfully!");
    Ok(())
}
