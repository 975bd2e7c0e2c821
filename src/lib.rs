//! # VoIP Core
//!
//! Real-time voice-call core: device audio, Opus, jitter buffering, ICE
//! negotiation and call signaling routed across a fleet of servers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── CLIENT ─────────────────────────────────┐
//! │                                                                         │
//! │  ┌───────────┐  capture ring  ┌──────────┐  network ring / callback     │
//! │  │ Capture   │ ─────────────▶ │  Encode  │ ──────────────────┐          │
//! │  │ callback  │   (f32 SPSC)   │  thread  │                   │          │
//! │  └───────────┘                └──────────┘                   ▼          │
//! │                                                      ┌──────────────┐   │
//! │                                                      │ NatTraversal │   │
//! │  ┌───────────┐  playback ring ┌──────────┐  jitter   │ (ICE / SRTP) │   │
//! │  │ Playback  │ ◀───────────── │  Decode  │ ◀──────── │  audio track │   │
//! │  │ callback  │   (f32 SPSC)   │  thread  │   buffer  └──────┬───────┘   │
//! │  └───────────┘                └──────────┘                  │           │
//! │                                                             │           │
//! │            CallSession (offer / answer / candidates)        │           │
//! └──────────────────────────────┬──────────────────────────────┼───────────┘
//!                                │ signaling JSON               │ media (P2P)
//!                                ▼                              ▼
//! ┌──────────── SERVER 1 ────────────┐          ┌──────────── SERVER 2 ────────────┐
//! │  SignalingManager                │          │  SignalingManager                │
//! │   user → transport (local)       │          │   user → transport (local)       │
//! │   RedisSignalingBridge ──────────┼──┐   ┌──▶│   RedisSignalingBridge           │
//! └──────────────────────────────────┘  │   │   └──────────────────────────────────┘
//!                                       ▼   │
//!                           ┌───────────────────────┐
//!                           │  Redis pub/sub        │
//!                           │  voip:user:{user_id}  │
//!                           └───────────────────────┘
//! ```

pub mod audio;
pub mod call;
pub mod codec;
pub mod config;
pub mod error;
pub mod nat;
pub mod signaling;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (mono voice)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 32_000;

    /// Default frame size in milliseconds
    pub const DEFAULT_FRAME_SIZE_MS: u32 = 20;

    /// Sample rates Opus accepts
    pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

    /// Frame durations the engine accepts
    pub const SUPPORTED_FRAME_SIZES_MS: [u32; 4] = [10, 20, 40, 60];

    /// Expected packet loss the encoder plans FEC for
    pub const OPUS_PACKET_LOSS_PERC: i32 = 5;

    /// Jitter buffer window
    pub const DEFAULT_JITTER_MIN_MS: u32 = 20;
    pub const DEFAULT_JITTER_MAX_MS: u32 = 200;
    pub const DEFAULT_JITTER_TARGET_MS: u32 = 60;

    /// Age after which a buffered packet is dropped
    pub const LATE_PACKET_THRESHOLD_MS: u32 = 100;

    /// Seconds of audio each sample ring holds
    pub const RING_BUFFER_SECONDS: u32 = 2;

    /// Encode to network ring capacity in bytes
    pub const NETWORK_RING_BYTES: usize = 64 * 1024;

    /// First and longest delay between bus resubscribe attempts
    pub const BUS_RESUBSCRIBE_INITIAL: Duration = Duration::from_millis(50);
    pub const BUS_RESUBSCRIBE_MAX: Duration = Duration::from_secs(5);

    /// How long a closed peer connection lingers before it is freed
    pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

    /// Closed peer connections kept at most
    pub const MAX_DRAINING_CONNECTIONS: usize = 16;

    /// Default STUN server
    pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

    /// Pub/sub channel prefix for per-user signaling
    pub const USER_CHANNEL_PREFIX: &str = "voip:user:";

    /// Default Redis endpoint
    pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

    /// Default cap on locally registered connections
    pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
}
