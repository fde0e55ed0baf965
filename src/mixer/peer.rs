//! Per-speaker mixing state

use bytes::Bytes;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::audio::jitter::{JitterBuffer, JitterBufferStats};
use crate::config::JitterConfig;
use crate::mixer::spatial::Position;
use crate::PlayerId;

/// Local listening policy for one remote player
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerPolicy {
    pub muted: bool,
    /// Linear gain, 1.0 is unchanged
    pub volume: f32,
}

impl Default for PeerPolicy {
    fn default() -> Self {
        Self {
            muted: false,
            volume: 1.0,
        }
    }
}

/// One remote speaker as seen by the mixer. Its decoder lives in the codec
/// under the same id and is dropped together with the session.
pub struct PeerSession {
    id: PlayerId,
    jitter: JitterBuffer,
    state: Mutex<PeerState>,
}

struct PeerState {
    last_active: Option<Instant>,
    position: Option<Position>,
    policy: PeerPolicy,
}

impl PeerSession {
    pub fn new(id: PlayerId, jitter: JitterConfig, policy: PeerPolicy) -> Self {
        Self {
            id,
            jitter: JitterBuffer::new(jitter),
            state: Mutex::new(PeerState {
                last_active: None,
                position: None,
                policy,
            }),
        }
    }

    pub fn id(&self) -> PlayerId {
        self.id
    }

    /// True when the frame started a new stream from this speaker
    pub fn push(&self, sequence: u32, frame: Bytes, now: Instant) -> bool {
        self.jitter.push_at(frame, sequence, now)
    }

    pub fn pop(&self, now: Instant) -> Option<Bytes> {
        self.jitter.pop_at(now)
    }

    /// Record that a real frame was played
    pub fn touch(&self, now: Instant) {
        self.state.lock().last_active = Some(now);
    }

    /// Whether concealment should still cover a missing frame
    pub fn within_plc_window(&self, now: Instant, window: Duration) -> bool {
        self.state
            .lock()
            .last_active
            .is_some_and(|last| now.saturating_duration_since(last) <= window)
    }

    pub fn position(&self) -> Option<Position> {
        self.state.lock().position
    }

    pub fn set_position(&self, position: Option<Position>) {
        self.state.lock().position = position;
    }

    pub fn policy(&self) -> PeerPolicy {
        self.state.lock().policy
    }

    pub fn set_policy(&self, policy: PeerPolicy) {
        self.state.lock().policy = policy;
    }

    pub fn stats(&self) -> JitterBufferStats {
        self.jitter.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plc_window() {
        let peer = PeerSession::new(1, JitterConfig::default(), PeerPolicy::default());
        let now = Instant::now();
        let window = Duration::from_millis(200);

        assert!(!peer.within_plc_window(now, window));
        peer.touch(now);
        assert!(peer.within_plc_window(now + Duration::from_millis(200), window));
        assert!(!peer.within_plc_window(now + Duration::from_millis(201), window));
    }

    #[test]
    fn test_policy_and_position() {
        let peer = PeerSession::new(
            2,
            JitterConfig::default(),
            PeerPolicy {
                muted: true,
                volume: 0.5,
            },
        );
        assert!(peer.policy().muted);
        assert_eq!(peer.position(), None);
        peer.set_position(Some(Position::new(3.0, 4.0)));
        assert_eq!(peer.position(), Some(Position::new(3.0, 4.0)));
    }
}
