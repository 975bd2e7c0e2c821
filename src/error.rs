//! Error types for the voice-call core

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("Invalid channel count: {0}")]
    InvalidChannels(u16),

    #[error("Invalid frame size: {0} ms")]
    InvalidFrameSize(u32),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Engine is running")]
    AlreadyRunning,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
}

/// ICE / SDP negotiation errors
///
/// These are returned as values and logged; they never cross a callback
/// boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Connection is closing")]
    Closing,

    #[error("Generation {0} is no longer active")]
    StaleGeneration(u64),

    #[error("No peer connection")]
    NoPeerConnection,

    #[error("Invalid session description: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Invalid ICE server URL: {0}")]
    InvalidIceServer(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Signaling routing errors
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Connection limit reached: {0}")]
    ConnectionLimit(usize),

    #[error("Transport write failed: {0}")]
    WriteFailed(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Cross-server delivery failed: {0}")]
    Delivery(#[from] BridgeError),
}

/// Cross-server bus errors
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge is not running")]
    NotRunning,

    #[error("Bus connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
