//! Spatial voice mixer
//!
//! Pull-based: the speaker callback asks for one chunk per period and the
//! mixer pops one frame from every speaker's jitter buffer, decodes or
//! conceals it, pans it relative to the listener and sums everything into
//! one interleaved stereo buffer.

pub mod peer;
pub mod spatial;

pub use peer::{PeerPolicy, PeerSession};
pub use spatial::{soft_clip, Position, StereoGain};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::jitter::JitterBufferStats;
use crate::audio::playback::ChunkSource;
use crate::codec::{AudioFrame, VoiceCodec};
use crate::config::{JitterConfig, MixerConfig};
use crate::PlayerId;

/// Ceiling for both master and per-peer volume
pub const MAX_VOLUME: f32 = 2.0;

#[derive(Debug, Clone, Copy)]
struct MixSettings {
    listener: Option<Position>,
    master_volume: f32,
    spatial: bool,
}

struct Voice {
    frame: AudioFrame,
    gain: StereoGain,
}

/// Buffers reused across pulls
#[derive(Default)]
struct MixScratch {
    peers: Vec<Arc<PeerSession>>,
    voices: Vec<Voice>,
    left: Vec<i32>,
    right: Vec<i32>,
}

pub struct Mixer {
    codec: Arc<VoiceCodec>,
    config: MixerConfig,
    jitter_config: JitterConfig,
    peers: DashMap<PlayerId, Arc<PeerSession>>,
    /// Survives peer removal so a reconnecting player keeps its mute
    policies: DashMap<PlayerId, PeerPolicy>,
    settings: RwLock<MixSettings>,
    scratch: Mutex<MixScratch>,
}

impl Mixer {
    pub fn new(codec: Arc<VoiceCodec>, config: MixerConfig, jitter_config: JitterConfig) -> Self {
        let settings = MixSettings {
            listener: None,
            master_volume: config.master_volume.clamp(0.0, MAX_VOLUME),
            spatial: config.spatial,
        };
        Self {
            codec,
            config,
            jitter_config,
            peers: DashMap::new(),
            policies: DashMap::new(),
            settings: RwLock::new(settings),
            scratch: Mutex::new(MixScratch::default()),
        }
    }

    pub fn codec(&self) -> &Arc<VoiceCodec> {
        &self.codec
    }

    /// Queue an encoded frame from `peer`
    pub fn queue(&self, peer: PlayerId, sequence: u32, frame: Bytes) {
        self.queue_at(peer, sequence, frame, Instant::now());
    }

    pub fn queue_at(&self, peer: PlayerId, sequence: u32, frame: Bytes, now: Instant) {
        if self.peer(peer).push(sequence, frame, now) {
            // Decoder state belongs to the old stream
            self.codec.discard(peer);
        }
    }

    /// Mix one chunk of interleaved stereo, or `None` when nobody is talking
    pub fn pull_chunk(&self) -> Option<Vec<i16>> {
        let mut out = Vec::new();
        self.pull_at(Instant::now(), &mut out).then_some(out)
    }

    /// Mix into `out`, replacing its contents. Returns false when nobody is
    /// talking, leaving `out` untouched.
    pub fn pull_at(&self, now: Instant, out: &mut Vec<i16>) -> bool {
        let settings = *self.settings.read();
        let plc_window = Duration::from_millis(self.config.plc_window_ms);

        let mut guard = self.scratch.lock();
        let scratch = &mut *guard;
        scratch.peers.clear();
        scratch
            .peers
            .extend(self.peers.iter().map(|entry| entry.value().clone()));
        scratch.voices.clear();

        for peer in scratch.peers.drain(..) {
            let frame = match peer.pop(now) {
                Some(bytes) => {
                    peer.touch(now);
                    self.codec.decode(peer.id(), &bytes)
                }
                None if peer.within_plc_window(now, plc_window) => self.codec.decode_plc(peer.id()),
                None => continue,
            };
            if frame.is_empty() {
                continue;
            }

            let policy = peer.policy();
            if policy.muted {
                continue;
            }
            let gain = spatial::spatial_gain(
                settings.listener,
                peer.position(),
                settings.spatial,
                &self.config,
            )
            .scaled(policy.volume * settings.master_volume);
            scratch.voices.push(Voice { frame, gain });
        }

        if scratch.voices.is_empty() {
            return false;
        }

        let len = scratch
            .voices
            .iter()
            .map(|v| v.frame.len())
            .max()
            .unwrap_or(0);
        if scratch.left.len() != len {
            scratch.left.resize(len, 0);
            scratch.right.resize(len, 0);
        }
        scratch.left.fill(0);
        scratch.right.fill(0);

        for voice in &scratch.voices {
            for (i, &sample) in voice.frame.iter().enumerate() {
                let sample = sample as f32;
                let left = (sample * voice.gain.left).round() as i32;
                let right = (sample * voice.gain.right).round() as i32;
                scratch.left[i] = scratch.left[i].saturating_add(left);
                scratch.right[i] = scratch.right[i].saturating_add(right);
            }
        }

        let threshold = self.config.soft_clip_threshold;
        out.clear();
        out.reserve(len * 2);
        for (&l, &r) in scratch.left.iter().zip(scratch.right.iter()) {
            out.push(soft_clip(l, threshold));
            out.push(soft_clip(r, threshold));
        }
        true
    }

    pub fn set_listener(&self, position: Option<Position>) {
        self.settings.write().listener = position;
    }

    pub fn listener(&self) -> Option<Position> {
        self.settings.read().listener
    }

    /// Update a speaker's position, creating its session if needed
    pub fn set_position(&self, peer: PlayerId, position: Option<Position>) {
        self.peer(peer).set_position(position);
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.settings.write().master_volume = volume.clamp(0.0, MAX_VOLUME);
    }

    pub fn master_volume(&self) -> f32 {
        self.settings.read().master_volume
    }

    pub fn set_spatial(&self, enabled: bool) {
        self.settings.write().spatial = enabled;
    }

    pub fn spatial(&self) -> bool {
        self.settings.read().spatial
    }

    pub fn set_peer_muted(&self, peer: PlayerId, muted: bool) {
        self.update_policy(peer, |policy| policy.muted = muted);
    }

    pub fn set_peer_volume(&self, peer: PlayerId, volume: f32) {
        self.update_policy(peer, |policy| policy.volume = volume.clamp(0.0, MAX_VOLUME));
    }

    pub fn peer_policy(&self, peer: PlayerId) -> PeerPolicy {
        self.policies.get(&peer).map(|p| *p).unwrap_or_default()
    }

    fn update_policy(&self, peer: PlayerId, update: impl FnOnce(&mut PeerPolicy)) {
        let policy = {
            let mut entry = self.policies.entry(peer).or_default();
            update(entry.value_mut());
            *entry.value()
        };
        if let Some(session) = self.peers.get(&peer) {
            session.set_policy(policy);
        }
    }

    /// Drop a speaker's session and decoder
    pub fn remove_peer(&self, peer: PlayerId) {
        if self.peers.remove(&peer).is_some() {
            tracing::debug!("Removed voice peer {}", peer);
        }
        self.codec.discard(peer);
    }

    /// Drop every session and decoder
    pub fn clear(&self) {
        for id in self.peer_ids() {
            self.remove_peer(id);
        }
    }

    pub fn has_peer(&self, peer: PlayerId) -> bool {
        self.peers.contains_key(&peer)
    }

    pub fn peer_ids(&self) -> Vec<PlayerId> {
        self.peers.iter().map(|p| *p.key()).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_stats(&self, peer: PlayerId) -> Option<JitterBufferStats> {
        self.peers.get(&peer).map(|p| p.stats())
    }

    fn peer(&self, id: PlayerId) -> Arc<PeerSession> {
        if let Some(existing) = self.peers.get(&id) {
            return existing.value().clone();
        }
        self.peers
            .entry(id)
            .or_insert_with(|| {
                tracing::debug!("New voice peer {}", id);
                Arc::new(PeerSession::new(
                    id,
                    self.jitter_config.clone(),
                    self.peer_policy(id),
                ))
            })
            .value()
            .clone()
    }
}

impl ChunkSource for Mixer {
    fn pull_into(&self, out: &mut Vec<i16>) -> bool {
        self.pull_at(Instant::now(), out)
    }
}
