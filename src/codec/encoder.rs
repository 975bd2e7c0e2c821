//! Opus encoder wrapper
//!
//! Voice-tuned Opus encoding driven by the engine configuration.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::config::EngineConfig;
use crate::constants::OPUS_PACKET_LOSS_PERC;
use crate::error::CodecError;

/// Largest packet Opus can produce for one frame
const MAX_PACKET_BYTES: usize = 4000;

/// Opus encoder configured for VoIP
pub struct OpusEncoder {
    encoder: Encoder,
    sample_rate: u32,
    channels: u16,
    frame_size: usize,
    bitrate: u32,
    fec: bool,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl OpusEncoder {
    /// Create an encoder for the given engine configuration
    pub fn new(config: &EngineConfig) -> Result<Self, CodecError> {
        let channels = opus_channels(config.channels)
            .ok_or_else(|| CodecError::EncoderInit(format!("Unsupported channel count: {}", config.channels)))?;

        let mut encoder = Encoder::new(config.sample_rate, channels, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        encoder
            .set_vbr(true)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;
        encoder
            .set_inband_fec(config.enable_fec)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;
        encoder
            .set_packet_loss_perc(OPUS_PACKET_LOSS_PERC)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;

        if config.enable_dtx {
            tracing::debug!("DTX requested but not supported by the Opus binding");
        }

        Ok(Self {
            encoder,
            sample_rate: config.sample_rate,
            channels: config.channels,
            frame_size: config.frame_size(),
            bitrate: config.bitrate,
            fec: config.enable_fec,
            encode_buffer: vec![0u8; MAX_PACKET_BYTES],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Encode one frame of interleaved samples.
    ///
    /// Input length must be `frame_size * channels`.
    pub fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError> {
        if samples.len() != self.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        let size = self
            .encoder
            .encode_float(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    /// Update bitrate dynamically
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CodecError> {
        self.encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        self.bitrate = bitrate;
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn fec_enabled(&self) -> bool {
        self.fec
    }

    /// Samples per channel in one frame
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Interleaved samples in one frame
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}

pub(crate) fn opus_channels(channels: u16) -> Option<Channels> {
    match channels {
        1 => Some(Channels::Mono),
        2 => Some(Channels::Stereo),
        _ => None,
    }
}
