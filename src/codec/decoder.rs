//! Opus decoder wrapper
//!
//! Provides Opus decoding with packet loss concealment.

use opus::{Channels, Decoder};

use crate::error::CodecError;

/// Longest Opus packet duration (120 ms) at 48 kHz
const MAX_DECODE_SAMPLES: usize = 48_000 * 120 / 1000;

/// Mono Opus decoder. One instance per remote speaker.
pub struct OpusDecoder {
    decoder: Decoder,
    sample_rate: u32,
    frame_size: usize,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
    frames_decoded: u64,
    /// Frames synthesized by PLC
    frames_concealed: u64,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32, frame_size: usize) -> Result<Self, CodecError> {
        let decoder = Decoder::new(sample_rate, Channels::Mono)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            sample_rate,
            frame_size,
            decode_buffer: vec![0i16; MAX_DECODE_SAMPLES.max(frame_size)],
            frames_decoded: 0,
            frames_concealed: 0,
        })
    }

    /// Decode one Opus packet to mono samples
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError> {
        let samples = self
            .decoder
            .decode(data, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_decoded += 1;
        Ok(self.decode_buffer[..samples].to_vec())
    }

    /// Synthesize one frame continuing the last decoded audio
    pub fn decode_plc(&mut self) -> Result<Vec<i16>, CodecError> {
        // PLC length follows the output size, so hand it exactly one frame
        let samples = self
            .decoder
            .decode(&[], &mut self.decode_buffer[..self.frame_size], false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_concealed += 1;
        Ok(self.decode_buffer[..samples].to_vec())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn stats(&self) -> DecoderStats {
        let total = self.frames_decoded + self.frames_concealed;
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_concealed: self.frames_concealed,
            concealment_rate: if total > 0 {
                self.frames_concealed as f32 / total as f32
            } else {
                0.0
            },
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_concealed: u64,
    pub concealment_rate: f32,
}
