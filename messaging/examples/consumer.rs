//! Example consumer demonstrating type-safe message handling.
//!
//! This example shows how to:
//! - Bind message types to topics with the `register_topics!` macro
//! - Create Consumers through the MessagingFactory
//! - Acknowledge messages after processing
//! - Handle graceful shutdown on Ctrl+C
//!
//! To run this example:
//! ```bash
//! cargo run --example consumer
//! ```
//!
//! Make sure you have a Kafka broker running on localhost:9092.
//! Run the producer example in another terminal to generate messages.

use std::sync::Arc;

use messaging::{
    load_config, register_topics, Consumer, FactoryConfig, MessagingFactory, Payload,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserCreated {
    user_id: String,
    email: String,
    name: String,
    timestamp: u64,
}

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
    let group_id = std::env::var("KAFKA_GROUP_ID")
        .unwrap_or_else(|_| "example-consumer-group".to_string());
    let options = json!({
        "brokers": brokers,
        "consumer": { "group_id": group_id, "auto_offset_reset": "earliest" },
    });
    let serde_json::Value::Object(options) = options else {
        anyhow::bail!("consumer options must be a mapping");
    };
    Ok(FactoryConfig::new("kafka", options))
}

fn handle_user_created(user: &UserCreated) -> anyhow::Result<()> {
    info!(
        "User created - ID: {}, Email: {}, Name: {}",
        user.user_id, user.email, user.name
    );
    Ok(())
}

fn handle_order_placed(order: &OrderPlaced) -> anyhow::Result<()> {
    if order.items.is_empty() {
        anyhow::bail!("order {} has no items", order.order_id);
    }
    info!(
        "Order placed - ID: {}, User: {}, Amount: ${:.2}",
        order.order_id, order.user_id, order.amount
    );
    info!("   Items: {:?}", order.items);
    Ok(())
}

/// Processes messages until the stream ends, acking each one that was handled.
async fn run<T, F>(mut consumer: Consumer<T>, handler: F) -> anyhow::Result<()>
where
    T: Payload,
    F: Fn(&T) -> anyhow::Result<()>,
{
    let mut inbox = consumer.open()?;
    while let Some(message) = inbox.recv().await {
        match handler(&message.value) {
            Ok(()) => message.ack()?,
            Err(e) => error!("Handler failed on topic '{}': {}", consumer.topic(), e),
        }
    }
    consumer.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting consumer example");

    let registry = register_topics![
        UserCreated => "user.created",
        OrderPlaced => "order.placed",
    ]?;
    let factory = MessagingFactory::new(Arc::new(registry));
    let config = config()?;
    let shutdown = CancellationToken::new();

    let users = factory.consumer::<UserCreated>(&config, &shutdown)?;
    let orders = factory.consumer::<OrderPlaced>(&config, &shutdown)?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal (Ctrl+C)");
        }
        signal_token.cancel();
    });

    info!("Starting to consume messages... Press Ctrl+C to stop");
    let (users, orders) = tokio::join!(
        run(users, handle_user_created),
        run(orders, handle_order_placed),
    );
    users?;
    orders?;

    info!("Consumer shut down gracefully");
    Ok(())
}
