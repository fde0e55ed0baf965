//! Configuration for the voice pipeline
//!
//! Every section has sensible defaults so a partial TOML file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VoiceConfig {
    pub codec: CodecConfig,
    pub jitter: JitterConfig,
    pub mixer: MixerConfig,
    pub capture: CaptureConfig,
    pub session: SessionConfig,
}

/// Opus and VAD settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub sample_rate: u32,
    /// Samples per frame
    pub frame_size: usize,
    /// Constant bitrate in bits per second
    pub bitrate: u32,
    /// In-band forward error correction
    pub fec: bool,
    /// Expected packet loss for FEC tuning (0-100)
    pub packet_loss_perc: u8,
    /// RMS level (sample units) below which frames count as silence
    pub vad_threshold: f64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame_size: FRAME_SIZE,
            bitrate: DEFAULT_BITRATE,
            fec: true,
            packet_loss_perc: 10,
            vad_threshold: 400.0,
        }
    }
}

impl CodecConfig {
    /// Frame duration in milliseconds
    pub fn frame_duration_ms(&self) -> f32 {
        self.frame_size as f32 * 1000.0 / self.sample_rate as f32
    }
}

/// Adaptive jitter buffer settings, all depths in frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    pub default_target: usize,
    pub min_target: usize,
    pub max_target: usize,
    pub step: usize,
    /// Hard cap; older frames are dropped past this
    pub max_frames: usize,
    pub adapt_interval_ms: u64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            default_target: 3,
            min_target: 2,
            max_target: 10,
            step: 1,
            max_frames: 25,
            adapt_interval_ms: 2000,
        }
    }
}

/// Spatial mixer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Horizontal distance at which a voice is fully panned to one side
    pub pan_range: f32,
    /// Distance at which attenuation reaches its floor
    pub max_distance: f32,
    /// Attenuation floor at and beyond `max_distance`
    pub min_attenuation: f32,
    /// How long after the last real frame concealment keeps running
    pub plc_window_ms: u64,
    /// Samples below this magnitude bypass the soft clipper
    pub soft_clip_threshold: i32,
    pub spatial: bool,
    pub master_volume: f32,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            pan_range: 400.0,
            max_distance: 1500.0,
            min_attenuation: 0.5,
            plc_window_ms: 200,
            soft_clip_threshold: 20_000,
            spatial: true,
            master_volume: 1.0,
        }
    }
}

/// Microphone and speaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Input device name, `None` for the system default
    pub input_device: Option<String>,
    /// Output device name, `None` for the system default
    pub output_device: Option<String>,
    /// Keep transmitting this long after the level drops below the VAD threshold
    pub vad_hangover_ms: u64,
    pub frames_per_packet: usize,
    pub device_open_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            vad_hangover_ms: 400,
            frames_per_packet: FRAMES_PER_PACKET,
            device_open_timeout_ms: 3000,
        }
    }
}

/// Handshake and routing policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub handshake_timeout_ms: u64,
    /// Only forward voice between players on the same team
    pub team_only: bool,
    /// Start with the microphone muted
    pub start_muted: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            team_only: false,
            start_muted: false,
        }
    }
}

impl VoiceConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML document
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write to `path`, creating parent directories as needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Platform config location, e.g. `~/.config/ingame-voice/voice.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("net", "ingame", "ingame-voice")
            .map(|dirs| dirs.config_dir().join("voice.toml"))
    }

    /// Load from the platform location, or defaults
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let codec = &self.codec;
        if ![8_000, 12_000, 16_000, 24_000, 48_000].contains(&codec.sample_rate) {
            return Err(Error::Config(format!(
                "unsupported sample rate {}",
                codec.sample_rate
            )));
        }
        // Opus accepts 2.5, 5, 10, 20, 40 and 60 ms frames (in tenths of a ms)
        let scaled = codec.frame_size as u64 * 10_000;
        let rate = codec.sample_rate as u64;
        if scaled % rate != 0 || ![25, 50, 100, 200, 400, 600].contains(&(scaled / rate)) {
            return Err(Error::Config(format!(
                "frame size {} is not a valid Opus frame at {} Hz",
                codec.frame_size, codec.sample_rate
            )));
        }
        if codec.packet_loss_perc > 100 {
            return Err(Error::Config("packet_loss_perc must be 0-100".into()));
        }

        let jitter = &self.jitter;
        if jitter.min_target == 0
            || jitter.min_target > jitter.max_target
            || !(jitter.min_target..=jitter.max_target).contains(&jitter.default_target)
        {
            return Err(Error::Config(
                "jitter targets must satisfy 0 < min <= default <= max".into(),
            ));
        }
        if jitter.max_frames < jitter.max_target {
            return Err(Error::Config("jitter max_frames below max_target".into()));
        }
        if jitter.step == 0 {
            return Err(Error::Config("jitter step must be positive".into()));
        }

        let mixer = &self.mixer;
        if mixer.pan_range <= 0.0 || mixer.max_distance <= 0.0 {
            return Err(Error::Config("pan_range and max_distance must be positive".into()));
        }
        if !(0.0..=1.0).contains(&mixer.min_attenuation) {
            return Err(Error::Config("min_attenuation must be within 0-1".into()));
        }
        if !(0.0..=crate::mixer::MAX_VOLUME).contains(&mixer.master_volume) {
            return Err(Error::Config(format!(
                "master_volume must be within 0-{}",
                crate::mixer::MAX_VOLUME
            )));
        }
        if !(1..i16::MAX as i32).contains(&mixer.soft_clip_threshold) {
            return Err(Error::Config("soft_clip_threshold out of range".into()));
        }

        if self.capture.frames_per_packet == 0 {
            return Err(Error::Config("frames_per_packet must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = VoiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.codec.frame_size, 960);
        assert!((config.codec.frame_duration_ms() - 20.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = VoiceConfig::from_toml(
            r#"
            [mixer]
            pan_range = 250.0

            [session]
            team_only = true
            "#,
        )
        .unwrap();

        assert_eq!(config.mixer.pan_range, 250.0);
        assert_eq!(config.mixer.max_distance, 1500.0);
        assert!(config.session.team_only);
        assert_eq!(config.jitter, JitterConfig::default());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = VoiceConfig::default();
        config.capture.input_device = Some("USB Headset".into());
        let text = config.to_toml().unwrap();
        assert_eq!(VoiceConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_frame_size() {
        let mut config = VoiceConfig::default();
        config.codec.frame_size = 1000;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_jitter_targets() {
        let mut config = VoiceConfig::default();
        config.jitter.min_target = 8;
        config.jitter.max_target = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_excessive_master_volume() {
        let mut config = VoiceConfig::default();
        config.mixer.master_volume = 50.0;
        assert!(config.validate().is_err());
        config.mixer.master_volume = 2.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("ingame-voice-missing-config.toml");
        let _ = std::fs::remove_file(&path);
        assert_eq!(VoiceConfig::load(&path).unwrap(), VoiceConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join(format!("ingame-voice-test-{}", std::process::id()));
        let path = dir.join("voice.toml");
        let mut config = VoiceConfig::default();
        config.session.start_muted = true;
        config.save(&path).unwrap();
        assert_eq!(VoiceConfig::load(&path).unwrap(), config);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
