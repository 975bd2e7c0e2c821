//! Opus codec wrapper
//!
//! Encoding and decoding for the voice pipeline, configured from
//! [`EngineConfig`](crate::config::EngineConfig).

pub mod decoder;
pub mod encoder;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;
