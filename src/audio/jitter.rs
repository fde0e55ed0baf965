//! Adaptive jitter buffer for encoded voice frames
//!
//! One buffer per remote speaker. Frames arrive keyed by sequence number and
//! leave in strictly increasing order. The buffer holds back output until
//! `target` frames are queued, and widens or narrows `target` every
//! adaptation interval depending on whether it ran dry.
//!
//! Gaps are not waited out. When the head is ahead of the next expected
//! sequence, the missing frame is treated as consumed (the caller conceals
//! it) and the expected sequence moves on. A frame that shows up after its
//! slot was skipped is then stale and gets dropped on push. Latency stays
//! bounded at the cost of occasionally discarding a late but intact frame.
//!
//! A frame numbered more than `max_frames` behind the last one played is not
//! late, it is the sender starting over, and the buffer restarts with it.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::config::JitterConfig;

pub struct JitterBuffer {
    config: JitterConfig,
    state: Mutex<JitterState>,
}

struct JitterState {
    frames: BTreeMap<u32, Bytes>,
    /// Highest sequence emitted or skipped, `None` until the first pop
    last_popped: Option<u32>,
    primed: bool,
    target: usize,
    underrun_in_period: bool,
    period_start: Option<Instant>,
    underruns: u64,
    stale: u64,
    overflow_drops: u64,
    skipped: u64,
    restarts: u64,
}

impl JitterState {
    fn new(target: usize) -> Self {
        Self {
            frames: BTreeMap::new(),
            last_popped: None,
            primed: false,
            target,
            underrun_in_period: false,
            period_start: None,
            underruns: 0,
            stale: 0,
            overflow_drops: 0,
            skipped: 0,
            restarts: 0,
        }
    }

    fn is_restart(&self, sequence: u32, window: usize) -> bool {
        self.last_popped
            .is_some_and(|last| sequence < last && (last - sequence) as usize > window)
    }

    /// Forget the old stream but keep the learned target and counters
    fn restart(&mut self) {
        self.frames.clear();
        self.last_popped = None;
        self.primed = false;
        self.restarts += 1;
    }

    fn is_stale(&self, sequence: u32) -> bool {
        self.last_popped.is_some_and(|last| sequence <= last)
    }

    fn advance_to(&mut self, sequence: u32) {
        if self.last_popped.map_or(true, |last| sequence > last) {
            self.last_popped = Some(sequence);
        }
    }
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        let state = JitterState::new(config.default_target);
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn push(&self, frame: Bytes, sequence: u32) -> bool {
        self.push_at(frame, sequence, Instant::now())
    }

    /// Queue a frame. Returns true when it began a new stream, in which case
    /// everything buffered from the old one was dropped.
    pub fn push_at(&self, frame: Bytes, sequence: u32, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.period_start.get_or_insert(now);

        let restarted = state.is_restart(sequence, self.config.max_frames);
        if restarted {
            tracing::debug!(
                "Sequence jumped back from {:?} to {}, restarting stream",
                state.last_popped,
                sequence
            );
            state.restart();
        } else if state.is_stale(sequence) {
            state.stale += 1;
            return false;
        }
        state.frames.insert(sequence, frame);

        while state.frames.len() > self.config.max_frames {
            if let Some((oldest, _)) = state.frames.pop_first() {
                state.advance_to(oldest);
                state.overflow_drops += 1;
            }
        }

        if !state.primed && state.frames.len() >= state.target {
            state.primed = true;
        }
        restarted
    }

    /// Next frame in sequence order. `None` means either still buffering or
    /// a frame to conceal.
    pub fn pop(&self) -> Option<Bytes> {
        self.pop_at(Instant::now())
    }

    pub fn pop_at(&self, now: Instant) -> Option<Bytes> {
        let mut state = self.state.lock();
        self.adapt(&mut state, now);

        loop {
            if !state.primed {
                return None;
            }

            let Some(&head) = state.frames.keys().next() else {
                state.underruns += 1;
                state.underrun_in_period = true;
                state.primed = false;
                return None;
            };

            let expected = state.last_popped.map(|last| last.wrapping_add(1));
            match expected {
                Some(expected) if head > expected => {
                    // Leave the head in place; it is re-evaluated next pop
                    state.last_popped = Some(expected);
                    state.skipped += 1;
                    return None;
                }
                Some(expected) if head < expected => {
                    state.frames.remove(&head);
                    state.stale += 1;
                }
                _ => {
                    let frame = state.frames.remove(&head);
                    state.last_popped = Some(head);
                    return frame;
                }
            }
        }
    }

    fn adapt(&self, state: &mut JitterState, now: Instant) {
        let interval = Duration::from_millis(self.config.adapt_interval_ms);
        let start = *state.period_start.get_or_insert(now);
        if now.saturating_duration_since(start) < interval {
            return;
        }

        let previous = state.target;
        state.target = if state.underrun_in_period {
            (state.target + self.config.step).min(self.config.max_target)
        } else {
            state
                .target
                .saturating_sub(self.config.step)
                .max(self.config.min_target)
        };
        if state.target != previous {
            tracing::trace!("Jitter target {} -> {} frames", previous, state.target);
        }
        state.underrun_in_period = false;
        state.period_start = Some(now);
    }

    /// Back to buffering with the default target and no sequence history
    pub fn clear(&self) {
        *self.state.lock() = JitterState::new(self.config.default_target);
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }

    pub fn is_primed(&self) -> bool {
        self.state.lock().primed
    }

    pub fn target(&self) -> usize {
        self.state.lock().target
    }

    pub fn last_popped(&self) -> Option<u32> {
        self.state.lock().last_popped
    }

    pub fn stats(&self) -> JitterBufferStats {
        let state = self.state.lock();
        JitterBufferStats {
            level: state.frames.len(),
            target: state.target,
            underruns: state.underruns,
            stale: state.stale,
            overflow_drops: state.overflow_drops,
            skipped: state.skipped,
            restarts: state.restarts,
        }
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitterBufferStats {
    pub level: usize,
    pub target: usize,
    pub underruns: u64,
    /// Late or duplicate frames discarded
    pub stale: u64,
    /// Frames dropped because the buffer hit its cap
    pub overflow_drops: u64,
    /// Sequence numbers skipped over as lost
    pub skipped: u64,
    /// Times the sender started numbering over
    pub restarts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(seq: u32) -> Bytes {
        Bytes::from(seq.to_be_bytes().to_vec())
    }

    fn seq_of(bytes: &Bytes) -> u32 {
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn buffer() -> JitterBuffer {
        JitterBuffer::new(JitterConfig::default())
    }

    #[test]
    fn test_buffers_until_target() {
        let jitter = buffer();
        let now = Instant::now();
        jitter.push_at(frame(0), 0, now);
        jitter.push_at(frame(1), 1, now);
        assert!(!jitter.is_primed());
        assert!(jitter.pop_at(now).is_none());

        jitter.push_at(frame(2), 2, now);
        assert!(jitter.is_primed());
        assert_eq!(seq_of(&jitter.pop_at(now).unwrap()), 0);
    }

    #[test]
    fn test_reorders_out_of_order_arrivals() {
        let jitter = buffer();
        let now = Instant::now();
        for seq in [12, 10, 11] {
            jitter.push_at(frame(seq), seq, now);
        }
        let popped: Vec<u32> = (0..3).map(|_| seq_of(&jitter.pop_at(now).unwrap())).collect();
        assert_eq!(popped, vec![10, 11, 12]);
    }

    #[test]
    fn test_stale_push_is_ignored() {
        let jitter = buffer();
        let now = Instant::now();
        for seq in 0..3 {
            jitter.push_at(frame(seq), seq, now);
        }
        jitter.pop_at(now);
        jitter.pop_at(now);
        let before = jitter.len();

        jitter.push_at(frame(1), 1, now);
        jitter.push_at(frame(0), 0, now);
        assert_eq!(jitter.len(), before);
        assert_eq!(jitter.stats().stale, 2);
    }

    #[test]
    fn test_gap_skips_without_consuming_head() {
        let jitter = buffer();
        let now = Instant::now();
        for seq in [0, 2, 3] {
            jitter.push_at(frame(seq), seq, now);
        }

        assert_eq!(seq_of(&jitter.pop_at(now).unwrap()), 0);
        // Sequence 1 is missing: caller conceals, head stays
        assert!(jitter.pop_at(now).is_none());
        assert_eq!(jitter.last_popped(), Some(1));
        assert_eq!(jitter.len(), 2);
        assert_eq!(seq_of(&jitter.pop_at(now).unwrap()), 2);

        // The late frame is now stale
        jitter.push_at(frame(1), 1, now);
        assert_eq!(jitter.len(), 1);
        assert_eq!(seq_of(&jitter.pop_at(now).unwrap()), 3);
    }

    #[test]
    fn test_underrun_unprimes() {
        let jitter = buffer();
        let now = Instant::now();
        for seq in 0..3 {
            jitter.push_at(frame(seq), seq, now);
        }
        for _ in 0..3 {
            assert!(jitter.pop_at(now).is_some());
        }
        assert!(jitter.pop_at(now).is_none());
        assert!(!jitter.is_primed());
        assert_eq!(jitter.stats().underruns, 1);

        // Needs a full target's worth again before emitting
        jitter.push_at(frame(3), 3, now);
        assert!(jitter.pop_at(now).is_none());
        assert_eq!(jitter.stats().underruns, 1);
    }

    #[test]
    fn test_overflow_drops_oldest_and_advances() {
        let jitter = buffer();
        let now = Instant::now();
        for seq in 100..130 {
            jitter.push_at(frame(seq), seq, now);
        }
        assert_eq!(jitter.len(), 25);
        assert_eq!(jitter.last_popped(), Some(104));
        assert_eq!(jitter.stats().overflow_drops, 5);
        assert_eq!(seq_of(&jitter.pop_at(now).unwrap()), 105);
    }

    #[test]
    fn test_continuous_underruns_grow_target_to_cap() {
        let config = JitterConfig::default();
        let jitter = JitterBuffer::new(config.clone());
        let start = Instant::now();
        let mut seq = 0;
        let mut targets = vec![jitter.target()];

        for cycle in 1..=12u64 {
            // Fill just enough to prime, then drain past empty
            let now = start + Duration::from_millis(cycle * config.adapt_interval_ms);
            let t = jitter.target();
            for _ in 0..t {
                jitter.push_at(frame(seq), seq, now - Duration::from_millis(1));
                seq += 1;
            }
            for _ in 0..=t {
                jitter.pop_at(now - Duration::from_millis(1));
            }
            jitter.pop_at(now);
            targets.push(jitter.target());
        }

        assert!(targets.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*targets.last().unwrap(), config.max_target);
    }

    #[test]
    fn test_quiet_periods_shrink_target_to_floor() {
        let config = JitterConfig {
            default_target: 8,
            ..JitterConfig::default()
        };
        let jitter = JitterBuffer::new(config.clone());
        let start = Instant::now();
        jitter.pop_at(start);
        let mut targets = vec![jitter.target()];

        for cycle in 1..=10u64 {
            jitter.pop_at(start + Duration::from_millis(cycle * config.adapt_interval_ms));
            targets.push(jitter.target());
        }

        assert!(targets.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(*targets.last().unwrap(), config.min_target);
    }

    #[test]
    fn test_clear_resets() {
        let jitter = buffer();
        let now = Instant::now();
        for seq in 0..5 {
            jitter.push_at(frame(seq), seq, now);
        }
        jitter.pop_at(now);
        jitter.clear();

        assert!(jitter.is_empty());
        assert!(!jitter.is_primed());
        assert_eq!(jitter.target(), JitterConfig::default().default_target);
        assert_eq!(jitter.last_popped(), None);

        // A reconnecting sender may restart from zero
        for seq in 0..3 {
            jitter.push_at(frame(seq), seq, now);
        }
        assert_eq!(seq_of(&jitter.pop_at(now).unwrap()), 0);
    }

    #[test]
    fn test_sender_restart_starts_new_stream() {
        let jitter = buffer();
        let now = Instant::now();
        for seq in 0..60 {
            assert!(!jitter.push_at(frame(seq), seq, now));
            jitter.pop_at(now);
        }
        let last = jitter.last_popped().unwrap();
        assert!(last > JitterConfig::default().max_frames as u32);

        // Small backward step is just a late frame
        assert!(!jitter.push_at(frame(last - 1), last - 1, now));
        assert_eq!(jitter.stats().stale, 1);

        assert!(jitter.push_at(frame(0), 0, now));
        assert_eq!(jitter.last_popped(), None);
        assert_eq!(jitter.len(), 1);
        for seq in 1..3 {
            assert!(!jitter.push_at(frame(seq), seq, now));
        }
        let popped: Vec<u32> = (0..3).map(|_| seq_of(&jitter.pop_at(now).unwrap())).collect();
        assert_eq!(popped, vec![0, 1, 2]);
        assert_eq!(jitter.stats().restarts, 1);
    }

    proptest! {
        #[test]
        fn prop_increasing_pushes_pop_in_order(
            start in 0u32..1_000_000,
            steps in proptest::collection::vec(1u32..3, 1..24),
        ) {
            let jitter = buffer();
            let now = Instant::now();
            let mut pushed = Vec::new();
            let mut seq = start;
            for step in steps {
                jitter.push_at(frame(seq), seq, now);
                pushed.push(seq);
                seq += step;
            }

            // Drain, forcing priming for short runs
            let mut popped = Vec::new();
            for _ in 0..pushed.len() * 3 {
                match jitter.pop_at(now) {
                    Some(bytes) => popped.push(seq_of(&bytes)),
                    None if jitter.is_empty() => break,
                    None => {
                        if !jitter.is_primed() {
                            break;
                        }
                    }
                }
            }

            if pushed.len() >= JitterConfig::default().default_target {
                prop_assert_eq!(popped, pushed);
            } else {
                prop_assert!(popped.is_empty());
            }
        }

        #[test]
        fn prop_stale_push_never_changes_size(
            count in 3u32..20,
            stale in 0u32..3,
        ) {
            let jitter = buffer();
            let now = Instant::now();
            for seq in 0..count {
                jitter.push_at(frame(seq), seq, now);
            }
            jitter.pop_at(now);
            jitter.pop_at(now);
            jitter.pop_at(now);
            let before = jitter.len();
            jitter.push_at(frame(stale), stale, now);
            prop_assert_eq!(jitter.len(), before);
        }

        #[test]
        fn prop_overflow_only_advances_within_a_stream(
            seqs in proptest::collection::vec(0u32..200, 1..120),
        ) {
            let jitter = buffer();
            let now = Instant::now();
            let mut last = None;
            for seq in seqs {
                if jitter.push_at(frame(seq), seq, now) {
                    last = None;
                }
                prop_assert!(jitter.len() <= JitterConfig::default().max_frames);
                let current = jitter.last_popped();
                prop_assert!(current >= last);
                last = current;
            }
        }
    }
}
