//! Lock-free sample ring between the capture callback and the capture thread
//!
//! Single producer (device callback), single consumer (capture loop).

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct SampleRing {
    queue: ArrayQueue<i16>,
    overflow_count: AtomicUsize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Push samples, dropping whatever does not fit.
    /// Returns how many were stored.
    pub fn push_slice(&self, samples: &[i16]) -> usize {
        for (i, &sample) in samples.iter().enumerate() {
            if self.queue.push(sample).is_err() {
                self.overflow_count
                    .fetch_add(samples.len() - i, Ordering::Relaxed);
                return i;
            }
        }
        samples.len()
    }

    /// Fill `out` with as many samples as are available
    pub fn read(&self, out: &mut [i16]) -> usize {
        let mut read = 0;
        for slot in out.iter_mut() {
            match self.queue.pop() {
                Some(sample) => {
                    *slot = sample;
                    read += 1;
                }
                None => break,
            }
        }
        read
    }

    /// Samples dropped because the consumer fell behind
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}

/// Thread-safe handle to a sample ring
pub type SharedSampleRing = Arc<SampleRing>;

pub fn create_shared_ring(capacity: usize) -> SharedSampleRing {
    Arc::new(SampleRing::new(capacity))
}
