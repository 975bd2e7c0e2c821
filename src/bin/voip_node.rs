//! Signaling node
//!
//! Connects to Redis, joins the per-user channel fan-out and routes
//! signaling for the users attached to this instance. Client transports are
//! attached by the embedding server; this binary runs the shared plumbing
//! and reports statistics.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voip_core::{
    config::AppConfig,
    signaling::{RedisBus, RedisSignalingBridge, SignalingManager},
};

const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server_id = config.signaling.resolved_server_id();
    tracing::info!(server_id = %server_id, redis = %config.signaling.redis_url, "Starting signaling node");

    let bus = RedisBus::connect(&config.signaling.redis_url)
        .await
        .context("Failed to connect to Redis")?;
    let bridge = Arc::new(RedisSignalingBridge::new(Arc::new(bus), server_id));
    let manager = SignalingManager::new(config.signaling.clone(), bridge);
    manager.initialize().await.context("Failed to start signaling bridge")?;

    tracing::info!("Signaling node ready - press Ctrl+C to stop");

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = manager.statistics();
                tracing::info!(
                    "Stats: {} connections, {} active calls, {} routed ({} local, {} bridged, {} failed), bus {} received / {} forwarded",
                    stats.connections,
                    stats.active_calls,
                    stats.messages_routed,
                    stats.local_deliveries,
                    stats.bridged_deliveries,
                    stats.delivery_failures,
                    stats.bridge.received,
                    stats.bridge.forwarded,
                );
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                }
                break;
            }
        }
    }

    manager.shutdown();
    tracing::info!("Signaling node stopped");
    Ok(())
}
