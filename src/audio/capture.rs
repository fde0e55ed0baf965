//! Microphone capture
//!
//! A dedicated thread reads the microphone one frame at a time, gates it on
//! voice activity, encodes it and hands batched packets to a [`CaptureSink`].

use bytes::Bytes;
use crossbeam_channel::{bounded, Sender};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::backend::{AudioBackend, InputDevice, StreamFormat};
use crate::codec::{rms, VoiceCodec};
use crate::config::CaptureConfig;
use crate::error::AudioError;
use crate::protocol::pack_frames;

/// How long to park when a full frame is not ready yet
const READ_RETRY: Duration = Duration::from_millis(5);

/// Receives outbound voice. Implemented by the session layer.
pub trait CaptureSink: Send + Sync {
    /// `sequence` numbers the first sub-frame in `payload`
    fn submit(&self, sequence: u32, payload: Bytes);
}

/// Level gate with hangover, so trailing syllables are not clipped
#[derive(Debug, Clone)]
pub struct VoiceActivity {
    threshold: f64,
    hangover: Duration,
    last_voiced: Option<Instant>,
}

impl VoiceActivity {
    pub fn new(threshold: f64, hangover: Duration) -> Self {
        Self {
            threshold,
            hangover,
            last_voiced: None,
        }
    }

    /// Whether the speaker counts as talking for this frame
    pub fn update(&mut self, level: f64, now: Instant) -> bool {
        if level >= self.threshold {
            self.last_voiced = Some(now);
            return true;
        }
        self.last_voiced
            .is_some_and(|last| now.saturating_duration_since(last) <= self.hangover)
    }
}

/// Per-frame processing of the capture loop
pub struct CapturePipeline {
    codec: Arc<VoiceCodec>,
    sink: Weak<dyn CaptureSink>,
    vad: VoiceActivity,
    frames_per_packet: usize,
    pending: Vec<Bytes>,
    /// Shared with the owner so numbering carries on across restarts
    sequence: Arc<AtomicU32>,
}

impl CapturePipeline {
    pub fn new(
        codec: Arc<VoiceCodec>,
        sink: Weak<dyn CaptureSink>,
        config: &CaptureConfig,
        sequence: Arc<AtomicU32>,
    ) -> Self {
        let vad = VoiceActivity::new(
            codec.config().vad_threshold,
            Duration::from_millis(config.vad_hangover_ms),
        );
        Self {
            codec,
            sink,
            vad,
            frames_per_packet: config.frames_per_packet.max(1),
            pending: Vec::with_capacity(config.frames_per_packet),
            sequence,
        }
    }

    /// Run one captured frame through the gate, encoder and batcher.
    /// Returns the frame's level.
    pub fn process(&mut self, frame: &[i16], now: Instant) -> f64 {
        let level = rms(frame);
        if !self.vad.update(level, now) {
            self.pending.clear();
            return level;
        }

        let encoded = if level >= self.codec.config().vad_threshold {
            self.codec.encode(frame)
        } else {
            // Hangover: keep sending the quiet tail
            self.codec.encode_voiced(frame)
        };
        match encoded {
            Ok(bytes) if !bytes.is_empty() => self.pending.push(bytes),
            Ok(_) => {}
            Err(e) => tracing::warn!("Dropping captured frame: {}", e),
        }

        if self.pending.len() >= self.frames_per_packet {
            let payload = pack_frames(&self.pending);
            let sequence = self
                .sequence
                .fetch_add(self.pending.len() as u32, Ordering::Relaxed);
            if let Some(sink) = self.sink.upgrade() {
                sink.submit(sequence, payload);
            }
            self.pending.clear();
        }
        level
    }

    /// Sequence number the next packet will carry
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Relaxed)
    }
}

/// Running capture thread
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    level: Arc<AtomicU32>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Open the microphone on a new thread and start streaming frames into
    /// `pipeline`. Fails if the device does not open within `open_timeout`.
    pub fn spawn(
        backend: Arc<dyn AudioBackend>,
        format: StreamFormat,
        pipeline: CapturePipeline,
        open_timeout: Duration,
    ) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let level = Arc::new(AtomicU32::new(0));
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running_for_thread = running.clone();
        let level_for_thread = level.clone();
        let thread = thread::Builder::new()
            .name("voice-capture".into())
            .spawn(move || {
                capture_thread(
                    backend,
                    format,
                    pipeline,
                    running_for_thread,
                    level_for_thread,
                    ready_tx,
                )
            })
            .map_err(|e| AudioError::ThreadSpawn(e.to_string()))?;

        let mut handle = Self {
            running,
            level,
            thread: Some(thread),
        };
        match ready_rx.recv_timeout(open_timeout) {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                handle.stop();
                Err(e)
            }
            Err(_) => {
                handle.running.store(false, Ordering::SeqCst);
                handle.thread.take();
                Err(AudioError::OpenTimeout(open_timeout.as_millis() as u64))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// RMS of the most recent frame, for level meters
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    /// Stop the loop and close the microphone. Safe to call at any point of
    /// the loop's iteration.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                tracing::warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    backend: Arc<dyn AudioBackend>,
    format: StreamFormat,
    mut pipeline: CapturePipeline,
    running: Arc<AtomicBool>,
    level: Arc<AtomicU32>,
    ready: Sender<Result<(), AudioError>>,
) {
    let mut device = match backend
        .open_input(&format)
        .and_then(|mut device| device.start().map(|_| device))
    {
        Ok(device) => device,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    tracing::info!("Microphone started on {} backend", backend.name());

    run_capture_loop(device.as_mut(), format.frame_size, &mut pipeline, &running, &level);

    device.stop();
    tracing::debug!("Microphone stopped");
}

fn run_capture_loop(
    device: &mut dyn InputDevice,
    frame_size: usize,
    pipeline: &mut CapturePipeline,
    running: &AtomicBool,
    level: &AtomicU32,
) {
    let mut frame = vec![0i16; frame_size];
    let mut filled = 0;

    while running.load(Ordering::Relaxed) {
        filled += device.read(&mut frame[filled..]);
        if filled < frame_size {
            thread::park_timeout(READ_RETRY);
            continue;
        }
        filled = 0;

        let frame_level = pipeline.process(&frame, Instant::now());
        level.store((frame_level as f32).to_bits(), Ordering::Relaxed);
    }
}
