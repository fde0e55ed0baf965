//! Opus codec wrapper
//!
//! [`VoiceCodec`] owns the single local encoder and one decoder per remote
//! speaker. Decoders are created on demand and each sits behind its own lock,
//! so different peers decode in parallel.

pub mod decoder;
pub mod encoder;

pub use decoder::{DecoderStats, OpusDecoder};
pub use encoder::{EncoderStats, OpusEncoder};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::CodecConfig;
use crate::error::CodecError;
use crate::PlayerId;

/// Mono 16-bit samples for one frame
pub type AudioFrame = Vec<i16>;

/// Root-mean-square amplitude in sample units
pub fn rms(frame: &[i16]) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / frame.len() as f64).sqrt()
}

pub struct VoiceCodec {
    config: CodecConfig,
    encoder: Mutex<OpusEncoder>,
    decoders: DashMap<PlayerId, Arc<Mutex<OpusDecoder>>>,
}

impl VoiceCodec {
    pub fn new(config: CodecConfig) -> Result<Self, CodecError> {
        let encoder = OpusEncoder::new(config.clone())?;
        Ok(Self {
            config,
            encoder: Mutex::new(encoder),
            decoders: DashMap::new(),
        })
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Encode a frame, or return an empty payload when it is below the VAD
    /// threshold. Silence is never transmitted.
    pub fn encode(&self, frame: &[i16]) -> Result<Bytes, CodecError> {
        if rms(frame) < self.config.vad_threshold {
            return Ok(Bytes::new());
        }
        self.encode_voiced(frame)
    }

    /// Encode without the VAD gate
    pub fn encode_voiced(&self, frame: &[i16]) -> Result<Bytes, CodecError> {
        self.encoder.lock().encode(frame)
    }

    /// Decode `data` from `peer`. Errors are absorbed: the peer's decoder is
    /// dropped so the next packet starts from a fresh one, and the result is
    /// an empty frame.
    pub fn decode(&self, peer: PlayerId, data: &[u8]) -> AudioFrame {
        let decoder = match self.decoder_for(peer) {
            Ok(decoder) => decoder,
            Err(e) => {
                tracing::warn!("Cannot create decoder for player {}: {}", peer, e);
                return AudioFrame::new();
            }
        };

        let result = decoder.lock().decode(data);
        match result {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Decode failed for player {}, resetting decoder: {}", peer, e);
                self.discard_if_same(peer, &decoder);
                AudioFrame::new()
            }
        }
    }

    /// Conceal one missing frame. Empty if `peer` has no decoder yet.
    pub fn decode_plc(&self, peer: PlayerId) -> AudioFrame {
        let Some(decoder) = self.decoders.get(&peer).map(|d| d.value().clone()) else {
            return AudioFrame::new();
        };

        let result = decoder.lock().decode_plc();
        match result {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("PLC failed for player {}, resetting decoder: {}", peer, e);
                self.discard_if_same(peer, &decoder);
                AudioFrame::new()
            }
        }
    }

    /// Drop the decoder for `peer`
    pub fn discard(&self, peer: PlayerId) {
        self.decoders.remove(&peer);
    }

    pub fn has_decoder(&self, peer: PlayerId) -> bool {
        self.decoders.contains_key(&peer)
    }

    pub fn decoder_count(&self) -> usize {
        self.decoders.len()
    }

    pub fn encoder_stats(&self) -> EncoderStats {
        self.encoder.lock().stats()
    }

    pub fn decoder_stats(&self, peer: PlayerId) -> Option<DecoderStats> {
        self.decoders.get(&peer).map(|d| d.lock().stats())
    }

    fn decoder_for(&self, peer: PlayerId) -> Result<Arc<Mutex<OpusDecoder>>, CodecError> {
        if let Some(existing) = self.decoders.get(&peer) {
            return Ok(existing.value().clone());
        }
        let entry = self.decoders.entry(peer).or_try_insert_with(|| {
            OpusDecoder::new(self.config.sample_rate, self.config.frame_size)
                .map(|d| Arc::new(Mutex::new(d)))
        })?;
        Ok(entry.value().clone())
    }

    // A concurrent reset may already have replaced the decoder; leave that one alone
    fn discard_if_same(&self, peer: PlayerId, decoder: &Arc<Mutex<OpusDecoder>>) {
        self.decoders
            .remove_if(&peer, |_, current| Arc::ptr_eq(current, decoder));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: f32) -> Vec<i16> {
        (0..960)
            .map(|i| ((i as f32 * 0.06).sin() * amplitude) as i16)
            .collect()
    }

    fn codec() -> VoiceCodec {
        VoiceCodec::new(CodecConfig::default()).unwrap()
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0; 10]), 0.0);
        assert!((rms(&[100, -100, 100, -100]) - 100.0).abs() < 1e-9);
        assert!((rms(&[3, 4]) - (12.5f64).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_silence_is_not_encoded() {
        let codec = codec();
        assert!(codec.encode(&[0; 960]).unwrap().is_empty());
        assert!(codec.encode(&tone(50.0)).unwrap().is_empty());
        assert!(!codec.encode(&tone(8000.0)).unwrap().is_empty());
    }

    #[test]
    fn test_encode_voiced_ignores_gate() {
        let codec = codec();
        assert!(!codec.encode_voiced(&tone(50.0)).unwrap().is_empty());
    }

    #[test]
    fn test_decode_creates_decoder_lazily() {
        let codec = codec();
        let packet = codec.encode(&tone(8000.0)).unwrap();

        assert!(!codec.has_decoder(1));
        assert_eq!(codec.decode(1, &packet).len(), 960);
        assert!(codec.has_decoder(1));
        assert_eq!(codec.decoder_count(), 1);
    }

    #[test]
    fn test_plc_without_decoder_is_empty() {
        let codec = codec();
        assert!(codec.decode_plc(9).is_empty());
        assert!(!codec.has_decoder(9));
    }

    #[test]
    fn test_plc_continues_existing_decoder() {
        let codec = codec();
        let packet = codec.encode(&tone(8000.0)).unwrap();
        codec.decode(4, &packet);
        assert_eq!(codec.decode_plc(4).len(), 960);
        assert_eq!(codec.decoder_stats(4).unwrap().frames_concealed, 1);
    }

    #[test]
    fn test_corrupt_packet_isolated_to_one_peer() {
        let codec = codec();
        let packet = codec.encode(&tone(8000.0)).unwrap();

        codec.decode(1, &packet);
        codec.decode(2, &packet);

        // Code 3 packet with a zero frame count is rejected by libopus
        assert!(codec.decode(1, &[0x03, 0x00]).is_empty());
        assert!(!codec.has_decoder(1));

        assert!(codec.has_decoder(2));
        assert_eq!(codec.decoder_stats(2).unwrap().frames_decoded, 1);
        assert_eq!(codec.decode(2, &packet).len(), 960);

        // Peer 1 recovers with a fresh decoder
        assert_eq!(codec.decode(1, &packet).len(), 960);
        assert_eq!(codec.decoder_stats(1).unwrap().frames_decoded, 1);
    }

    #[test]
    fn test_discard() {
        let codec = codec();
        let packet = codec.encode(&tone(8000.0)).unwrap();
        codec.decode(5, &packet);
        codec.discard(5);
        assert!(!codec.has_decoder(5));
        assert!(codec.decode_plc(5).is_empty());
    }

    #[test]
    fn test_parallel_peers() {
        let codec = Arc::new(codec());
        let packet = codec.encode(&tone(8000.0)).unwrap();

        let handles: Vec<_> = (0..4u32)
            .map(|peer| {
                let codec = codec.clone();
                let packet = packet.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        assert_eq!(codec.decode(peer, &packet).len(), 960);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(codec.decoder_count(), 4);
        assert_eq!(codec.decoder_stats(3).unwrap().frames_decoded, 20);
    }
}
