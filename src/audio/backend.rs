//! Audio device abstraction
//!
//! The pipeline talks to hardware only through [`AudioBackend`]. Devices are
//! opened on the thread that drives them and closed by dropping them, so
//! implementations may hold thread-bound platform handles.

use std::sync::Arc;

use crate::audio::playback::ChunkSource;
use crate::config::CodecConfig;
use crate::error::AudioError;

/// Sample layout the pipeline runs at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    /// Mono samples per frame
    pub frame_size: usize,
}

impl From<&CodecConfig> for StreamFormat {
    fn from(config: &CodecConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            frame_size: config.frame_size,
        }
    }
}

/// Microphone. Produces mono samples at the stream format's rate.
pub trait InputDevice {
    fn start(&mut self) -> Result<(), AudioError>;

    fn stop(&mut self);

    /// Copy available samples into `out` without blocking
    fn read(&mut self, out: &mut [i16]) -> usize;
}

/// Speaker. Pulls stereo chunks from its source on its own schedule.
pub trait OutputDevice {
    fn start(&mut self) -> Result<(), AudioError>;

    fn stop(&mut self);
}

pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &str;

    fn open_input(&self, format: &StreamFormat) -> Result<Box<dyn InputDevice>, AudioError>;

    fn open_output(
        &self,
        format: &StreamFormat,
        source: Arc<dyn ChunkSource>,
    ) -> Result<Box<dyn OutputDevice>, AudioError>;
}

/// Backend for headless hosts: opens always succeed, the microphone never
/// produces samples and the speaker never pulls.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

/// Microphone that never produces samples
#[derive(Debug, Default)]
pub struct NullInput;

impl InputDevice for NullInput {
    fn start(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn read(&mut self, _out: &mut [i16]) -> usize {
        0
    }
}

/// Speaker that discards everything
#[derive(Debug, Default)]
pub struct NullOutput;

impl OutputDevice for NullOutput {
    fn start(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn stop(&mut self) {}
}

impl AudioBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn open_input(&self, _format: &StreamFormat) -> Result<Box<dyn InputDevice>, AudioError> {
        Ok(Box::new(NullInput))
    }

    fn open_output(
        &self,
        _format: &StreamFormat,
        _source: Arc<dyn ChunkSource>,
    ) -> Result<Box<dyn OutputDevice>, AudioError> {
        Ok(Box::new(NullOutput))
    }
}
