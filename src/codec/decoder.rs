//! Opus decoder wrapper

use opus::Decoder;

use crate::codec::encoder::opus_channels;
use crate::error::CodecError;

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
    sample_rate: u32,
    channels: u16,
    frame_size: usize,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<f32>,
    frames_decoded: u64,
    decode_errors: u64,
    samples_produced: u64,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32, channels: u16, frame_size: usize) -> Result<Self, CodecError> {
        let opus_channels = opus_channels(channels)
            .ok_or_else(|| CodecError::DecoderInit(format!("Unsupported channel count: {}", channels)))?;

        let decoder = Decoder::new(sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        // 120 ms is the longest Opus packet
        let decode_buffer = vec![0.0f32; sample_rate as usize * channels as usize * 120 / 1000];

        Ok(Self {
            decoder,
            sample_rate,
            channels,
            frame_size,
            decode_buffer,
            frames_decoded: 0,
            decode_errors: 0,
            samples_produced: 0,
        })
    }

    /// Decode one packet into interleaved samples.
    ///
    /// The returned slice borrows the internal buffer.
    pub fn decode(&mut self, data: &[u8]) -> Result<&[f32], CodecError> {
        let samples = match self.decoder.decode_float(data, &mut self.decode_buffer, false) {
            Ok(samples) => samples,
            Err(e) => {
                self.decode_errors += 1;
                return Err(CodecError::DecodingFailed(e.to_string()));
            }
        };

        let total = samples * self.channels as usize;
        self.frames_decoded += 1;
        self.samples_produced += total as u64;

        Ok(&self.decode_buffer[..total])
    }

    /// Reset decoder state
    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder
            .reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Samples per channel in one frame
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            decode_errors: self.decode_errors,
            samples_produced: self.samples_produced,
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub decode_errors: u64,
    pub samples_produced: u64,
}
