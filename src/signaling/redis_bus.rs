//! Redis pub/sub implementation of [`MessageBus`]

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use super::bridge::{BusMessage, MessageBus};
use crate::error::BridgeError;

pub struct RedisBus {
    client: redis::Client,
    publisher: MultiplexedConnection,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let client = redis::Client::open(url).map_err(|e| BridgeError::Connection(e.to_string()))?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))?;
        tracing::info!(url = %url, "Connected to Redis");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BridgeError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| BridgeError::Publish(e.to_string()))?;
        tracing::trace!(channel = %channel, receivers, "PUBLISH");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::UnboundedReceiver<BusMessage>, BridgeError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BridgeError::Subscribe(e.to_string()))?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| BridgeError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!("Dropping non-text bus payload: {}", e);
                        continue;
                    }
                };
                let message = BusMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
            tracing::warn!(pattern = %pattern, "Redis subscription ended");
        });

        Ok(rx)
    }
}
