//! cpal-backed audio devices and device enumeration

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use std::sync::Arc;

use crate::audio::backend::{
    AudioBackend, InputDevice, NullInput, NullOutput, OutputDevice, StreamFormat,
};
use crate::audio::buffer::{create_shared_ring, SharedSampleRing};
use crate::audio::playback::{ChunkSource, StereoCursor};
use crate::constants::CAPTURE_RING_CAPACITY;
use crate::error::AudioError;

/// Which physical device to use for one direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChoice {
    /// System default
    Default,
    /// Device whose name matches exactly
    Named(String),
    /// Open a silent stand-in instead of hardware
    Disabled,
}

impl From<Option<String>> for DeviceChoice {
    fn from(name: Option<String>) -> Self {
        match name {
            Some(name) => DeviceChoice::Named(name),
            None => DeviceChoice::Default,
        }
    }
}

/// Description of an available device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
}

/// Backend over the platform's default cpal host
#[derive(Debug, Clone)]
pub struct CpalBackend {
    input: DeviceChoice,
    output: DeviceChoice,
}

impl CpalBackend {
    pub fn new(input: DeviceChoice, output: DeviceChoice) -> Self {
        Self { input, output }
    }

    /// Devices named in the config, defaults otherwise
    pub fn from_config(config: &crate::config::CaptureConfig) -> Self {
        Self::new(
            config.input_device.clone().into(),
            config.output_device.clone().into(),
        )
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new(DeviceChoice::Default, DeviceChoice::Default)
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn open_input(&self, format: &StreamFormat) -> Result<Box<dyn InputDevice>, AudioError> {
        let device = match &self.input {
            DeviceChoice::Disabled => return Ok(Box::new(NullInput)),
            DeviceChoice::Default => cpal::default_host()
                .default_input_device()
                .ok_or_else(|| AudioError::DeviceNotFound("No default input device".into()))?,
            DeviceChoice::Named(name) => find_device(name, true)?,
        };
        let default_config = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

        let config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let ring = create_shared_ring(CAPTURE_RING_CAPACITY);

        let stream = match default_config.sample_format() {
            SampleFormat::I16 => build_input::<i16>(&device, &config, ring.clone()),
            SampleFormat::U16 => build_input::<u16>(&device, &config, ring.clone()),
            SampleFormat::F32 => build_input::<f32>(&device, &config, ring.clone()),
            other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
        }?;

        tracing::debug!(
            "Opened input {:?} ({} ch @ {} Hz)",
            device.name().unwrap_or_default(),
            config.channels,
            format.sample_rate
        );
        Ok(Box::new(CpalInput { stream, ring }))
    }

    fn open_output(
        &self,
        format: &StreamFormat,
        source: Arc<dyn ChunkSource>,
    ) -> Result<Box<dyn OutputDevice>, AudioError> {
        let device = match &self.output {
            DeviceChoice::Disabled => return Ok(Box::new(NullOutput)),
            DeviceChoice::Default => cpal::default_host()
                .default_output_device()
                .ok_or_else(|| AudioError::DeviceNotFound("No default output device".into()))?,
            DeviceChoice::Named(name) => find_device(name, false)?,
        };
        let default_config = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

        let config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match default_config.sample_format() {
            SampleFormat::I16 => build_output::<i16>(&device, &config, source),
            SampleFormat::U16 => build_output::<u16>(&device, &config, source),
            SampleFormat::F32 => build_output::<f32>(&device, &config, source),
            other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
        }?;

        tracing::debug!(
            "Opened output {:?} ({} ch @ {} Hz)",
            device.name().unwrap_or_default(),
            config.channels,
            format.sample_rate
        );
        Ok(Box::new(CpalOutput { stream }))
    }
}

struct CpalInput {
    stream: cpal::Stream,
    ring: SharedSampleRing,
}

impl InputDevice for CpalInput {
    fn start(&mut self) -> Result<(), AudioError> {
        self.ring.clear();
        self.stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))
    }

    fn stop(&mut self) {
        if let Err(e) = self.stream.pause() {
            tracing::debug!("Failed to pause input stream: {}", e);
        }
        let dropped = self.ring.overflow_count();
        if dropped > 0 {
            tracing::debug!("Capture ring dropped {} samples", dropped);
        }
    }

    fn read(&mut self, out: &mut [i16]) -> usize {
        self.ring.read(out)
    }
}

struct CpalOutput {
    stream: cpal::Stream,
}

impl OutputDevice for CpalOutput {
    fn start(&mut self) -> Result<(), AudioError> {
        self.stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))
    }

    fn stop(&mut self) {
        if let Err(e) = self.stream.pause() {
            tracing::debug!("Failed to pause output stream: {}", e);
        }
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    ring: SharedSampleRing,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<i16> = Vec::with_capacity(4096);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.chunks(channels).map(|frame| {
                    let sum: i32 = frame
                        .iter()
                        .map(|&s| <i16 as FromSample<T>>::from_sample_(s) as i32)
                        .sum();
                    (sum / frame.len() as i32) as i16
                }));
                ring.push_slice(&mono);
            },
            |err| tracing::warn!("Input stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    source: Arc<dyn ChunkSource>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<i16> + Send + 'static,
{
    let channels = config.channels as usize;
    let mut cursor = StereoCursor::new();
    let silence = <T as FromSample<i16>>::from_sample_(0);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                cursor.fill(
                    data,
                    channels,
                    source.as_ref(),
                    <T as FromSample<i16>>::from_sample_,
                    silence,
                );
            },
            |err| tracing::warn!("Output stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

fn find_device(name: &str, input: bool) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    let devices = if input {
        host.input_devices()
    } else {
        host.output_devices()
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().is_ok_and(|n| n == name) {
            return Ok(device);
        }
    }
    Err(AudioError::DeviceNotFound(name.to_string()))
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for name in inputs.filter_map(|d| d.name().ok()) {
            let is_default = default_input_name.as_ref() == Some(&name);
            devices.push(AudioDeviceInfo {
                name,
                is_input: true,
                is_output: false,
                is_default,
            });
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for name in outputs.filter_map(|d| d.name().ok()) {
            let is_default = default_output_name.as_ref() == Some(&name);
            // Headsets show up on both sides
            if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                existing.is_output = true;
                existing.is_default |= is_default;
            } else {
                devices.push(AudioDeviceInfo {
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                });
            }
        }
    }

    devices
}
