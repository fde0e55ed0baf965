//! Speaker side
//!
//! The output device's callback drives mixing: it pulls stereo chunks from a
//! [`ChunkSource`] (the mixer) and re-slices them to whatever period and
//! channel layout the device asks for.

use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::backend::{AudioBackend, StreamFormat};
use crate::error::AudioError;

/// Producer of interleaved stereo chunks
pub trait ChunkSource: Send + Sync {
    /// Replace `out` with the next chunk. Returns false when there is nothing
    /// to play right now.
    fn pull_into(&self, out: &mut Vec<i16>) -> bool;
}

/// Carries a partially played chunk across device callbacks
#[derive(Debug, Default)]
pub struct StereoCursor {
    chunk: Vec<i16>,
    pos: usize,
}

impl StereoCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill one device buffer. `channels` is the device's interleave width.
    /// Once the source runs dry the rest of the buffer is silence and the
    /// source is not asked again until the next callback.
    pub fn fill<T: Copy>(
        &mut self,
        out: &mut [T],
        channels: usize,
        source: &dyn ChunkSource,
        convert: impl Fn(i16) -> T,
        silence: T,
    ) {
        let channels = channels.max(1);
        let mut idle = false;

        for frame in out.chunks_mut(channels) {
            let pair = if idle { None } else { self.next_pair(source) };
            let Some((left, right)) = pair else {
                idle = true;
                frame.fill(silence);
                continue;
            };

            match frame {
                [mono] => *mono = convert(((left as i32 + right as i32) / 2) as i16),
                [l, r, rest @ ..] => {
                    *l = convert(left);
                    *r = convert(right);
                    rest.fill(silence);
                }
                [] => {}
            }
        }
    }

    fn next_pair(&mut self, source: &dyn ChunkSource) -> Option<(i16, i16)> {
        if self.pos + 1 >= self.chunk.len() {
            self.pos = 0;
            if !source.pull_into(&mut self.chunk) {
                self.chunk.clear();
                return None;
            }
            if self.chunk.len() < 2 {
                return None;
            }
        }
        let pair = (self.chunk[self.pos], self.chunk[self.pos + 1]);
        self.pos += 2;
        Some(pair)
    }
}

/// Speaker thread. Owns the output device for its whole life, since device
/// handles are not always movable between threads.
pub struct PlaybackHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackHandle {
    /// Open and start the speaker, waiting up to `open_timeout` for the
    /// device to report back
    pub fn spawn(
        backend: Arc<dyn AudioBackend>,
        format: StreamFormat,
        source: Arc<dyn ChunkSource>,
        open_timeout: Duration,
    ) -> Result<Self, AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running_for_thread = running.clone();
        let thread = thread::Builder::new()
            .name("voice-playback".into())
            .spawn(move || {
                let mut device = match backend
                    .open_output(&format, source)
                    .and_then(|mut device| device.start().map(|_| device))
                {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                tracing::info!("Speaker started on {} backend", backend.name());

                while running_for_thread.load(Ordering::Relaxed) {
                    thread::park_timeout(Duration::from_millis(100));
                }

                device.stop();
                tracing::debug!("Speaker stopped");
            })
            .map_err(|e| AudioError::ThreadSpawn(e.to_string()))?;

        let mut handle = Self {
            running,
            thread: Some(thread),
        };
        match ready_rx.recv_timeout(open_timeout) {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                handle.stop();
                Err(e)
            }
            Err(_) => {
                // Leave a wedged driver call behind rather than block on it
                handle.running.store(false, Ordering::SeqCst);
                handle.thread.take();
                Err(AudioError::OpenTimeout(open_timeout.as_millis() as u64))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                tracing::warn!("Playback thread panicked");
            }
        }
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Hands out numbered chunks of four stereo frames
    struct Counter {
        chunks: Mutex<Vec<Vec<i16>>>,
        pulls: Mutex<usize>,
    }

    impl Counter {
        fn new(chunks: Vec<Vec<i16>>) -> Self {
            Self {
                chunks: Mutex::new(chunks),
                pulls: Mutex::new(0),
            }
        }
    }

    impl ChunkSource for Counter {
        fn pull_into(&self, out: &mut Vec<i16>) -> bool {
            *self.pulls.lock() += 1;
            let mut chunks = self.chunks.lock();
            if chunks.is_empty() {
                return false;
            }
            *out = chunks.remove(0);
            true
        }
    }

    #[test]
    fn test_stereo_spans_callbacks() {
        let source = Counter::new(vec![vec![1, -1, 2, -2, 3, -3], vec![4, -4]]);
        let mut cursor = StereoCursor::new();

        let mut first = [0i16; 4];
        cursor.fill(&mut first, 2, &source, |s| s, 0);
        assert_eq!(first, [1, -1, 2, -2]);

        let mut second = [9i16; 6];
        cursor.fill(&mut second, 2, &source, |s| s, 0);
        assert_eq!(second, [3, -3, 4, -4, 0, 0]);
    }

    #[test]
    fn test_idle_source_pulled_once_per_callback() {
        let source = Counter::new(Vec::new());
        let mut cursor = StereoCursor::new();
        let mut out = [5i16; 8];
        cursor.fill(&mut out, 2, &source, |s| s, 0);
        assert_eq!(out, [0; 8]);
        assert_eq!(*source.pulls.lock(), 1);
    }

    #[test]
    fn test_mono_and_surround_layouts() {
        let source = Counter::new(vec![vec![100, 300, 10, 20]]);
        let mut cursor = StereoCursor::new();
        let mut mono = [0i16; 1];
        cursor.fill(&mut mono, 1, &source, |s| s, 0);
        assert_eq!(mono, [200]);

        let mut quad = [7f32; 4];
        cursor.fill(&mut quad, 4, &source, |s| s as f32, 0.0);
        assert_eq!(quad, [10.0, 20.0, 0.0, 0.0]);
    }
}
