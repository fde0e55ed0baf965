//! Owner of the microphone, speaker, codec and mixer

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::audio::backend::{AudioBackend, StreamFormat};
use crate::audio::capture::{CaptureHandle, CapturePipeline, CaptureSink};
use crate::audio::playback::{ChunkSource, PlaybackHandle};
use crate::codec::VoiceCodec;
use crate::config::VoiceConfig;
use crate::error::{CodecError, Result};
use crate::mixer::Mixer;

/// Wires the codec and mixer to the audio devices. Codec and mixer are built
/// on first use and reused until [`AudioController::close`].
pub struct AudioController {
    config: VoiceConfig,
    backend: Arc<dyn AudioBackend>,
    codec: Option<Arc<VoiceCodec>>,
    mixer: Option<Arc<Mixer>>,
    capture: Option<CaptureHandle>,
    playback: Option<PlaybackHandle>,
    /// Next outbound sequence. Never reset, so listeners that kept our
    /// jitter buffer across a restart do not see old numbers again.
    sequence: Arc<AtomicU32>,
}

impl AudioController {
    pub fn new(config: VoiceConfig, backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            config,
            backend,
            codec: None,
            mixer: None,
            capture: None,
            playback: None,
            sequence: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn codec(&mut self) -> std::result::Result<Arc<VoiceCodec>, CodecError> {
        if let Some(codec) = &self.codec {
            return Ok(codec.clone());
        }
        let codec = Arc::new(VoiceCodec::new(self.config.codec.clone())?);
        self.codec = Some(codec.clone());
        Ok(codec)
    }

    pub fn mixer(&mut self) -> std::result::Result<Arc<Mixer>, CodecError> {
        if let Some(mixer) = &self.mixer {
            return Ok(mixer.clone());
        }
        let mixer = Arc::new(Mixer::new(
            self.codec()?,
            self.config.mixer.clone(),
            self.config.jitter.clone(),
        ));
        self.mixer = Some(mixer.clone());
        Ok(mixer)
    }

    /// Mixer if one has been built, without building it
    pub fn current_mixer(&self) -> Option<Arc<Mixer>> {
        self.mixer.clone()
    }

    /// Open the microphone and start sending voice to `sink`. No-op if
    /// capture is already running.
    pub fn start_capture(&mut self, sink: Weak<dyn CaptureSink>) -> Result<()> {
        if self.capture.as_ref().is_some_and(|c| c.is_running()) {
            return Ok(());
        }
        let pipeline = CapturePipeline::new(
            self.codec()?,
            sink,
            &self.config.capture,
            self.sequence.clone(),
        );
        let handle = CaptureHandle::spawn(
            self.backend.clone(),
            self.format(),
            pipeline,
            self.open_timeout(),
        )?;
        self.capture = Some(handle);
        Ok(())
    }

    pub fn stop_capture(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
    }

    /// Open the speaker, driven by the mixer. No-op if already playing.
    pub fn start_playback(&mut self) -> Result<Arc<Mixer>> {
        let mixer = self.mixer()?;
        if self.playback.as_ref().is_some_and(|p| p.is_running()) {
            return Ok(mixer);
        }
        let source: Arc<dyn ChunkSource> = mixer.clone();
        let handle = PlaybackHandle::spawn(
            self.backend.clone(),
            self.format(),
            source,
            self.open_timeout(),
        )?;
        self.playback = Some(handle);
        Ok(mixer)
    }

    pub fn stop_playback(&mut self) {
        if let Some(mut playback) = self.playback.take() {
            playback.stop();
        }
    }

    /// Stop both devices, forget every peer and drop the codec
    pub fn close(&mut self) {
        self.stop_capture();
        self.stop_playback();
        if let Some(mixer) = self.mixer.take() {
            mixer.clear();
        }
        self.codec = None;
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.as_ref().is_some_and(|c| c.is_running())
    }

    pub fn is_playing(&self) -> bool {
        self.playback.as_ref().is_some_and(|p| p.is_running())
    }

    /// Microphone level in sample units, 0 when not capturing
    pub fn input_level(&self) -> f32 {
        self.capture.as_ref().map_or(0.0, |c| c.level())
    }

    /// Sequence the next captured packet will carry
    pub fn next_sequence(&self) -> u32 {
        self.sequence.load(Ordering::Relaxed)
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.backend
    }

    fn format(&self) -> StreamFormat {
        StreamFormat::from(&self.config.codec)
    }

    fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.config.capture.device_open_timeout_ms)
    }
}

impl Drop for AudioController {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted devices shared by controller and session tests

    use super::*;
    use crate::audio::backend::{InputDevice, NullBackend, OutputDevice};
    use crate::error::AudioError;
    use parking_lot::Mutex;

    /// Microphone that plays back a fixed tone forever
    pub struct ToneInput {
        amplitude: f32,
        phase: usize,
    }

    impl InputDevice for ToneInput {
        fn start(&mut self) -> std::result::Result<(), AudioError> {
            Ok(())
        }

        fn stop(&mut self) {}

        fn read(&mut self, out: &mut [i16]) -> usize {
            for slot in out.iter_mut() {
                *slot = ((self.phase as f32 * 0.08).sin() * self.amplitude) as i16;
                self.phase += 1;
            }
            out.len()
        }
    }

    /// Backend with a tone microphone and optional forced failures
    #[derive(Default)]
    pub struct ScriptedBackend {
        pub fail_input: bool,
        pub fail_output: bool,
        pub amplitude: f32,
        pub opened_outputs: Mutex<usize>,
    }

    impl ScriptedBackend {
        pub fn tone(amplitude: f32) -> Self {
            Self {
                amplitude,
                ..Self::default()
            }
        }
    }

    impl AudioBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn open_input(
            &self,
            _format: &StreamFormat,
        ) -> std::result::Result<Box<dyn InputDevice>, AudioError> {
            if self.fail_input {
                return Err(AudioError::DeviceNotFound("scripted microphone".into()));
            }
            Ok(Box::new(ToneInput {
                amplitude: self.amplitude,
                phase: 0,
            }))
        }

        fn open_output(
            &self,
            format: &StreamFormat,
            source: Arc<dyn ChunkSource>,
        ) -> std::result::Result<Box<dyn OutputDevice>, AudioError> {
            if self.fail_output {
                return Err(AudioError::DeviceNotFound("scripted speaker".into()));
            }
            *self.opened_outputs.lock() += 1;
            NullBackend.open_output(format, source)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ScriptedBackend;
    use super::*;
    use crate::audio::backend::NullBackend;
    use crate::error::{AudioError, Error};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct Collector {
        packets: Mutex<Vec<(u32, Bytes)>>,
    }

    impl CaptureSink for Collector {
        fn submit(&self, sequence: u32, payload: Bytes) {
            self.packets.lock().push((sequence, payload));
        }
    }

    #[test]
    fn test_codec_and_mixer_are_lazy_and_shared() {
        let mut controller = AudioController::new(VoiceConfig::default(), Arc::new(NullBackend));
        let codec = controller.codec().unwrap();
        assert!(Arc::ptr_eq(&codec, &controller.codec().unwrap()));

        let mixer = controller.mixer().unwrap();
        assert!(Arc::ptr_eq(&mixer, &controller.mixer().unwrap()));
        assert!(Arc::ptr_eq(mixer.codec(), &codec));
    }

    #[test]
    fn test_capture_sends_batched_packets() {
        let mut controller =
            AudioController::new(VoiceConfig::default(), Arc::new(ScriptedBackend::tone(9000.0)));
        let sink = Arc::new(Collector::default());
        let dyn_sink: Arc<dyn CaptureSink> = sink.clone();

        controller.start_capture(Arc::downgrade(&dyn_sink)).unwrap();
        assert!(controller.is_capturing());

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.packets.lock().len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        controller.stop_capture();
        assert!(!controller.is_capturing());

        let packets = sink.packets.lock();
        assert!(packets.len() >= 3);
        for (i, (sequence, _)) in packets.iter().enumerate() {
            assert_eq!(*sequence, i as u32 * 2);
        }
    }

    #[test]
    fn test_sequence_continues_after_restart() {
        let mut controller =
            AudioController::new(VoiceConfig::default(), Arc::new(ScriptedBackend::tone(9000.0)));
        let sink = Arc::new(Collector::default());
        let dyn_sink: Arc<dyn CaptureSink> = sink.clone();
        let wait_for = |count: usize| {
            let deadline = Instant::now() + Duration::from_secs(5);
            while sink.packets.lock().len() < count && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
        };

        controller.start_capture(Arc::downgrade(&dyn_sink)).unwrap();
        wait_for(2);
        controller.close();
        let resume_at = controller.next_sequence();
        let sent_before = sink.packets.lock().len();
        assert!(resume_at >= 4);

        controller.start_capture(Arc::downgrade(&dyn_sink)).unwrap();
        wait_for(sent_before + 2);
        controller.stop_capture();

        let packets = sink.packets.lock();
        assert!(packets.len() >= sent_before + 2);
        assert_eq!(packets[sent_before].0, resume_at);
        for pair in packets.windows(2) {
            assert_eq!(pair[1].0, pair[0].0 + 2);
        }
    }

    #[test]
    fn test_stop_survives_panicked_capture_thread() {
        struct Exploding(Mutex<bool>);
        impl CaptureSink for Exploding {
            fn submit(&self, _sequence: u32, _payload: Bytes) {
                *self.0.lock() = true;
                panic!("sink failure");
            }
        }

        let mut controller =
            AudioController::new(VoiceConfig::default(), Arc::new(ScriptedBackend::tone(9000.0)));
        let sink = Arc::new(Exploding(Mutex::new(false)));
        let dyn_sink: Arc<dyn CaptureSink> = sink.clone();
        controller.start_capture(Arc::downgrade(&dyn_sink)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !*sink.0.lock() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(*sink.0.lock());
        controller.stop_capture();
        assert!(!controller.is_capturing());
    }

    #[test]
    fn test_start_capture_is_idempotent() {
        let mut controller = AudioController::new(VoiceConfig::default(), Arc::new(NullBackend));
        let sink: Arc<dyn CaptureSink> = Arc::new(Collector::default());
        controller.start_capture(Arc::downgrade(&sink)).unwrap();
        controller.start_capture(Arc::downgrade(&sink)).unwrap();
        assert!(controller.is_capturing());
        controller.close();
        assert!(!controller.is_capturing());
    }

    #[test]
    fn test_microphone_failure_is_reported() {
        let backend = ScriptedBackend {
            fail_input: true,
            ..ScriptedBackend::default()
        };
        let mut controller = AudioController::new(VoiceConfig::default(), Arc::new(backend));
        let sink: Arc<dyn CaptureSink> = Arc::new(Collector::default());

        let err = controller.start_capture(Arc::downgrade(&sink)).unwrap_err();
        assert!(matches!(err, Error::Audio(AudioError::DeviceNotFound(_))));
        assert!(!controller.is_capturing());
    }

    #[test]
    fn test_speaker_failure_is_reported() {
        let backend = ScriptedBackend {
            fail_output: true,
            ..ScriptedBackend::default()
        };
        let mut controller = AudioController::new(VoiceConfig::default(), Arc::new(backend));
        assert!(controller.start_playback().is_err());
        assert!(!controller.is_playing());
    }

    #[test]
    fn test_close_clears_peers_and_codec() {
        let backend = Arc::new(ScriptedBackend::tone(0.0));
        let mut controller = AudioController::new(VoiceConfig::default(), backend.clone());
        let mixer = controller.start_playback().unwrap();
        controller.start_playback().unwrap();
        assert_eq!(*backend.opened_outputs.lock(), 1);
        assert!(controller.is_playing());

        mixer.set_position(4, None);
        controller.close();

        assert!(!controller.is_playing());
        assert_eq!(mixer.peer_count(), 0);
        assert!(controller.current_mixer().is_none());
        let fresh = controller.mixer().unwrap();
        assert!(!Arc::ptr_eq(&fresh, &mixer));
    }
}
