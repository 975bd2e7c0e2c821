//! Audio loopback check
//!
//! Runs the full engine on the default devices with its encoded output fed
//! straight back into its own input, exercising capture, Opus, the jitter
//! buffer and playback without a network.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voip_core::{
    audio::{list_devices, AudioEngine},
    config::AppConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
    }
    println!();

    let engine = Arc::new(AudioEngine::with_default_backend());
    engine
        .initialize(config.engine.clone())
        .context("Failed to initialize audio engine")?;

    // Weak so the callback stored inside the engine does not keep it alive
    let loopback: Weak<AudioEngine> = Arc::downgrade(&engine);
    engine.set_network_callback(move |packet| {
        if let Some(engine) = loopback.upgrade() {
            engine.feed_encoded_audio(packet);
        }
    });

    engine.start().context("Failed to start audio engine")?;
    tracing::info!(
        "Loopback running: {} Hz, {} ch, {} ms frames, {} bps - press Ctrl+C to stop",
        config.engine.sample_rate,
        config.engine.channels,
        config.engine.frame_size_ms,
        config.engine.bitrate
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = engine.statistics();
                tracing::info!(
                    "Stats: {} sent, {} received, {} decoded, {} lost ({:.1}%), jitter {:.1} ms, buffer {} ms, {} overflows, {} underruns",
                    stats.packets_sent,
                    stats.packets_received,
                    stats.packets_decoded,
                    stats.packets_lost,
                    stats.packet_loss_percent,
                    stats.jitter_ms,
                    stats.current_buffer_ms,
                    stats.capture_overflows,
                    stats.playback_underruns,
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

    engine.clear_network_callback();
    engine.stop();
    tracing::info!("Loopback stopped");
    Ok(())
}
