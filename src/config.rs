//! Configuration management
//!
//! Every section deserializes with defaults, so a partial TOML file (or no
//! file at all) yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::JitterConfig;
use crate::constants::*;
use crate::error::{AudioError, Error, Result};

/// Top-level configuration for a node or client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub nat: NatConfig,
    pub signaling: SignalingConfig,
    pub access: AccessConfig,
    pub logging: LoggingConfig,
}

/// Audio engine configuration. Immutable once the engine is initialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size_ms: u32,
    pub bitrate: u32,
    pub enable_fec: bool,
    /// Accepted for compatibility; the bundled Opus binding exposes no DTX control
    pub enable_dtx: bool,
    pub jitter_min_ms: u32,
    pub jitter_max_ms: u32,
    pub jitter_target_ms: u32,
    /// Capture device id (`input:<name>`), default device when unset
    pub input_device: Option<String>,
    /// Playback device id (`output:<name>`), default device when unset
    pub output_device: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_size_ms: DEFAULT_FRAME_SIZE_MS,
            bitrate: DEFAULT_BITRATE,
            enable_fec: true,
            enable_dtx: false,
            jitter_min_ms: DEFAULT_JITTER_MIN_MS,
            jitter_max_ms: DEFAULT_JITTER_MAX_MS,
            jitter_target_ms: DEFAULT_JITTER_TARGET_MS,
            input_device: None,
            output_device: None,
        }
    }
}

impl EngineConfig {
    /// Check sample rate, channel count and frame duration
    pub fn validate(&self) -> std::result::Result<(), AudioError> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(AudioError::InvalidSampleRate(self.sample_rate));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(AudioError::InvalidChannels(self.channels));
        }
        if !SUPPORTED_FRAME_SIZES_MS.contains(&self.frame_size_ms) {
            return Err(AudioError::InvalidFrameSize(self.frame_size_ms));
        }
        Ok(())
    }

    /// Samples per channel in one frame
    pub fn frame_size(&self) -> usize {
        (self.sample_rate * self.frame_size_ms / 1000) as usize
    }

    /// Interleaved samples in one frame
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size() * self.channels as usize
    }

    /// Jitter buffer window derived from this configuration
    pub fn jitter_config(&self) -> JitterConfig {
        JitterConfig {
            min_buffer_ms: self.jitter_min_ms,
            max_buffer_ms: self.jitter_max_ms,
            target_buffer_ms: self.jitter_target_ms,
            late_packet_threshold_ms: LATE_PACKET_THRESHOLD_MS,
            frame_duration_ms: self.frame_size_ms,
        }
    }
}

/// ICE server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    pub stun_servers: Vec<String>,
    /// `turn:user:pass@host:port?transport=udp|tcp` style URLs
    pub turn_servers: Vec<String>,
    pub enable_ipv6: bool,
    /// Milliseconds a closed connection lingers before release
    pub drain_grace_ms: u64,
    pub max_draining: usize,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            turn_servers: Vec::new(),
            enable_ipv6: true,
            drain_grace_ms: DRAIN_GRACE.as_millis() as u64,
            max_draining: MAX_DRAINING_CONNECTIONS,
        }
    }
}

/// Signaling and cross-server bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub redis_url: String,
    /// Generated when empty
    pub server_id: String,
    pub max_connections: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            server_id: String::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl SignalingConfig {
    /// Configured server id, or a fresh random one
    pub fn resolved_server_id(&self) -> String {
        if self.server_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            self.server_id.clone()
        }
    }
}

/// Registration-date gate for call features
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub enabled: bool,
    /// Unix seconds; users registered later are feature-locked
    pub cutoff_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from `path`, or from the platform config directory when `None`.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;

        if self.engine.jitter_min_ms > self.engine.jitter_max_ms {
            return Err(Error::Config(format!(
                "jitter_min_ms ({}) exceeds jitter_max_ms ({})",
                self.engine.jitter_min_ms, self.engine.jitter_max_ms
            )));
        }
        if self.signaling.max_connections == 0 {
            return Err(Error::Config("max_connections must be positive".into()));
        }
        for url in self.nat.stun_servers.iter().chain(&self.nat.turn_servers) {
            crate::nat::IceServer::parse(url)?;
        }
        Ok(())
    }
}

/// `<config dir>/config.toml` for this application
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "voip-core", "voip-core")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
