//! Audio subsystem: devices, capture, playback and jitter buffering

pub mod backend;
pub mod buffer;
pub mod capture;
pub mod controller;
#[cfg(feature = "cpal")]
pub mod device;
pub mod jitter;
pub mod playback;

pub use backend::{AudioBackend, InputDevice, NullBackend, OutputDevice, StreamFormat};
pub use buffer::SampleRing;
pub use capture::{CaptureHandle, CaptureSink, VoiceActivity};
pub use controller::AudioController;
#[cfg(feature = "cpal")]
pub use device::{list_devices, AudioDeviceInfo, CpalBackend, DeviceChoice};
pub use jitter::{JitterBuffer, JitterBufferStats};
pub use playback::{ChunkSource, PlaybackHandle, StereoCursor};
