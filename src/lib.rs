//! # In-game Voice
//!
//! Real-time positional voice chat carried over a game's own connection.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── SPEAKING PLAYER ────────────────────────────┐
//! │  ┌────────────┐   ┌──────────┐   ┌─────────────┐   ┌──────────────────────┐ │
//! │  │ Microphone │──▶│ VAD gate │──▶│ Opus encode │──▶│ Batch 2 sub-frames   │ │
//! │  │ (capture   │   │ + 400 ms │   │ (VoiceCodec)│   │ [len|opus][len|opus] │ │
//! │  │  thread)   │   │ hangover │   └─────────────┘   └──────────┬───────────┘ │
//! │  └────────────┘   └──────────┘                                │             │
//! │                                       SessionManager::submit ◀┘             │
//! └───────────────────────────────────────────────┬─────────────────────────────┘
//!                                                 │ AudioPacket (unreliable)
//!                                                 ▼
//! ┌──────────────────────────────────── SERVER ─────────────────────────────────┐
//! │  sender id := connection's player id  ──▶  fan-out to accepted connections  │
//! └───────────────────────────────────────────────┬─────────────────────────────┘
//!                                                 ▼
//! ┌──────────────────────────────────── LISTENER ───────────────────────────────┐
//! │  SessionManager::handle_packet ──▶ unbatch ──▶ Mixer::queue                  │
//! │                                                  │                          │
//! │        ┌─────────────┐  ┌─────────────┐  ┌─────────────┐                    │
//! │        │ Jitter buf  │  │ Jitter buf  │  │ Jitter buf  │  one per sender    │
//! │        │ + decoder   │  │ + decoder   │  │ + decoder   │                    │
//! │        └──────┬──────┘  └──────┬──────┘  └──────┬──────┘                    │
//! │               └──────── pan / attenuate / sum ──┘                           │
//! │                                 │ soft clip                                 │
//! │                                 ▼                                           │
//! │                    Speaker callback (Mixer::pull_into)                      │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod mixer;
pub mod network;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

/// Player identifier assigned by the host game
pub type PlayerId = u32;

/// Protocol-wide constants
pub mod constants {
    /// Sample rate used for capture, coding and mixing
    pub const SAMPLE_RATE: u32 = 48_000;

    /// Voice is mono end to end until the mixer pans it
    pub const CHANNELS: u16 = 1;

    /// Duration of one coded frame in milliseconds
    pub const FRAME_DURATION_MS: u32 = 20;

    /// Samples in one coded frame
    pub const FRAME_SIZE: usize = (SAMPLE_RATE * FRAME_DURATION_MS / 1000) as usize;

    /// Encoded sub-frames batched into one audio packet
    pub const FRAMES_PER_PACKET: usize = 2;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 24_000;

    /// Bumped whenever the wire format changes
    pub const PROTOCOL_VERSION: u32 = 3;

    /// Upper bound for a single Opus sub-frame
    pub const MAX_OPUS_FRAME: usize = 1275;

    /// Upper bound for any serialized voice message
    pub const MAX_MESSAGE_SIZE: u64 = 8 * 1024;

    /// Capture ring capacity in samples (one second)
    pub const CAPTURE_RING_CAPACITY: usize = SAMPLE_RATE as usize;
}
