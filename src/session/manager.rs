//! Session manager
//!
//! Decides when the microphone and speaker are open, runs the version
//! handshake between client and server and routes voice packets. It is the
//! only part of the pipeline that knows about connections and roles.
//!
//! Locking: `transition` serializes state changes and owns the right to touch
//! the [`AudioController`]. `inner` holds routing state and is only ever held
//! for short, non-blocking sections, so the capture thread (which takes
//! `inner` in [`CaptureSink::submit`]) can always make progress while a
//! transition waits for it to stop.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::audio::backend::AudioBackend;
use crate::audio::capture::CaptureSink;
use crate::audio::controller::AudioController;
use crate::config::VoiceConfig;
use crate::constants::PROTOCOL_VERSION;
use crate::error::Error;
use crate::mixer::{Mixer, PeerPolicy, MAX_VOLUME};
use crate::network::{ConnectionId, Delivery, PlayerRoster, TransportAdapter, VoiceGate};
use crate::protocol::{
    AudioPacket, HandshakeRequest, HandshakeResponse, ResponseCode, VoiceMessage,
};
use crate::session::state::{LinkState, Notice, Role, SessionEvent, SessionState};
use crate::PlayerId;

const EVENT_CAPACITY: usize = 64;


#[derive(Debug, Clone, Copy)]
struct Link {
    state: LinkState,
    player: Option<PlayerId>,
    opened: Instant,
}

/// User choices that outlive any one mixer
#[derive(Debug, Clone)]
struct Policy {
    mic_muted: bool,
    master_volume: f32,
    spatial: bool,
    peers: HashMap<PlayerId, PeerPolicy>,
}

impl Policy {
    fn apply(&self, mixer: &Mixer) {
        mixer.set_master_volume(self.master_volume);
        mixer.set_spatial(self.spatial);
        for (&peer, policy) in &self.peers {
            mixer.set_peer_muted(peer, policy.muted);
            mixer.set_peer_volume(peer, policy.volume);
        }
    }
}

struct Inner {
    state: SessionState,
    enabled: bool,
    role: Option<Role>,
    mixer: Option<Arc<Mixer>>,
    links: HashMap<ConnectionId, Link>,
    /// Handshake request that arrived while voice was off
    deferred_request: Option<HandshakeRequest>,
    handshake_deadline: Option<Instant>,
    policy: Policy,
}

pub struct SessionManager {
    this: Weak<SessionManager>,
    config: VoiceConfig,
    transport: Arc<dyn TransportAdapter>,
    roster: Arc<dyn PlayerRoster>,
    gate: Arc<dyn VoiceGate>,
    transition: Mutex<()>,
    audio: Mutex<AudioController>,
    inner: Mutex<Inner>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        config: VoiceConfig,
        backend: Arc<dyn AudioBackend>,
        transport: Arc<dyn TransportAdapter>,
        roster: Arc<dyn PlayerRoster>,
        gate: Arc<dyn VoiceGate>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = bounded(EVENT_CAPACITY);
        let policy = Policy {
            mic_muted: config.session.start_muted,
            master_volume: config.mixer.master_volume.clamp(0.0, MAX_VOLUME),
            spatial: config.mixer.spatial,
            peers: HashMap::new(),
        };

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            audio: Mutex::new(AudioController::new(config.clone(), backend)),
            config,
            transport,
            roster,
            gate,
            transition: Mutex::new(()),
            inner: Mutex::new(Inner {
                state: SessionState::Disabled,
                enabled: false,
                role: None,
                mixer: None,
                links: HashMap::new(),
                deferred_request: None,
                handshake_deadline: None,
                policy,
            }),
            events_tx,
            events_rx,
        })
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    pub fn role(&self) -> Option<Role> {
        self.inner.lock().role
    }

    /// Receiver for UI events. Events are dropped when nobody drains it.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    /// Mixer of the running session, for level meters and tests
    pub fn mixer(&self) -> Option<Arc<Mixer>> {
        self.inner.lock().mixer.clone()
    }

    pub fn input_level(&self) -> f32 {
        self.audio.lock().input_level()
    }

    pub fn link_state(&self, conn: ConnectionId) -> Option<LinkState> {
        self.inner.lock().links.get(&conn).map(|link| link.state)
    }

    /// Turn voice on or off. Turning it on again also retries after a
    /// device error.
    pub fn set_enabled(&self, enabled: bool) {
        let _transition = self.transition.lock();
        let was_error = {
            let mut inner = self.inner.lock();
            inner.enabled = enabled;
            inner.state.is_error()
        };
        if enabled && was_error {
            self.shut_down_audio(SessionState::Disabled);
        }
        self.refresh_locked();
    }

    /// The host joined or started a network session
    pub fn on_network_started(&self, role: Role) {
        let _transition = self.transition.lock();
        {
            let mut inner = self.inner.lock();
            inner.role = Some(role);
            inner.links.clear();
            inner.handshake_deadline = None;
        }
        tracing::info!("Voice network started as {:?}", role);
        self.refresh_locked();
    }

    pub fn on_network_stopped(&self) {
        let _transition = self.transition.lock();
        {
            let mut inner = self.inner.lock();
            inner.role = None;
            inner.links.clear();
            inner.deferred_request = None;
            inner.handshake_deadline = None;
        }
        tracing::info!("Voice network stopped");
        self.refresh_locked();
    }

    /// Server side: a client connected, start the handshake
    pub fn on_connection_opened(&self, conn: ConnectionId) {
        {
            let mut inner = self.inner.lock();
            if !inner.role.is_some_and(Role::is_server) {
                return;
            }
            let player = self.roster.player_for_connection(conn).map(|p| p.id);
            inner.links.insert(
                conn,
                Link {
                    state: LinkState::Pending,
                    player,
                    opened: Instant::now(),
                },
            );
        }
        tracing::debug!("Sending voice handshake to {}", conn);
        self.send(
            conn,
            &VoiceMessage::HandshakeRequest(HandshakeRequest::default()),
        );
    }

    pub fn on_connection_closed(&self, conn: ConnectionId) {
        let (link, mixer) = {
            let mut inner = self.inner.lock();
            (inner.links.remove(&conn), inner.mixer.clone())
        };
        let player = link
            .and_then(|link| link.player)
            .or_else(|| self.roster.player_for_connection(conn).map(|p| p.id));
        if let (Some(player), Some(mixer)) = (player, mixer) {
            mixer.remove_peer(player);
        }
    }

    /// Forget a player's voice stream and decoder
    pub fn on_player_left(&self, player: PlayerId) {
        if let Some(mixer) = self.mixer() {
            mixer.remove_peer(player);
        }
    }

    /// Entry point for bytes received from the host network. Never fails;
    /// malformed input is logged and dropped.
    pub fn handle_packet(&self, conn: ConnectionId, data: &[u8]) {
        match VoiceMessage::decode(data) {
            Ok(message) => self.handle_message(conn, message),
            Err(e) => tracing::debug!("Dropping voice message from {}: {}", conn, e),
        }
    }

    pub fn handle_message(&self, conn: ConnectionId, message: VoiceMessage) {
        let role = self.role();
        match (message, role) {
            (VoiceMessage::HandshakeRequest(request), Some(Role::Client)) => {
                self.on_handshake_request(conn, request)
            }
            (VoiceMessage::HandshakeResponse(response), Some(role)) if role.is_server() => {
                self.on_handshake_response(conn, response)
            }
            (VoiceMessage::Audio(packet), Some(Role::Client)) => {
                if Some(conn) == self.transport.server_connection() {
                    self.play(packet);
                } else {
                    tracing::trace!("Ignoring audio from non-server {}", conn);
                }
            }
            (VoiceMessage::Audio(packet), Some(_)) => self.route(conn, packet),
            (message, role) => {
                tracing::debug!("Unexpected {:?} as {:?} from {}", message, role, conn)
            }
        }
    }

    /// Periodic housekeeping: handshake timeouts, gate changes and positions
    pub fn tick(&self, now: Instant) {
        let timeout = Duration::from_millis(self.config.session.handshake_timeout_ms);
        let (expired, needs_refresh) = {
            let mut inner = self.inner.lock();
            for (conn, link) in inner.links.iter_mut() {
                if link.state == LinkState::Pending
                    && now.saturating_duration_since(link.opened) >= timeout
                {
                    tracing::warn!("Voice handshake with {} timed out", conn);
                    link.state = LinkState::Rejected;
                }
            }

            let expired = inner.state == SessionState::WaitingHandshake
                && inner.handshake_deadline.is_some_and(|deadline| now >= deadline);
            let running = !matches!(inner.state, SessionState::Disabled) && !inner.state.is_error();
            let needs_refresh = running != self.should_run(&inner) && !inner.state.is_error();
            (expired, needs_refresh)
        };

        if expired {
            let _transition = self.transition.lock();
            // The request may have arrived while we waited for the lock
            if self.state() == SessionState::WaitingHandshake {
                tracing::warn!("Voice handshake timed out");
                self.fail_handshake(Notice::HandshakeTimeout);
            }
        } else if needs_refresh {
            let _transition = self.transition.lock();
            self.refresh_locked();
        }

        self.update_positions();
    }

    /// Push listener and speaker positions from the roster into the mixer
    pub fn update_positions(&self) {
        let Some(mixer) = self.mixer() else {
            return;
        };
        mixer.set_listener(self.roster.local_player().and_then(|p| p.position));
        for peer in mixer.peer_ids() {
            if let Some(player) = self.roster.player(peer) {
                mixer.set_position(peer, player.position);
            }
        }
    }

    pub fn set_mic_muted(&self, muted: bool) {
        let changed = {
            let mut inner = self.inner.lock();
            let changed = inner.policy.mic_muted != muted;
            inner.policy.mic_muted = muted;
            changed
        };
        if changed {
            self.publish(SessionEvent::MicMuted(muted));
        }
    }

    pub fn is_mic_muted(&self) -> bool {
        self.inner.lock().policy.mic_muted
    }

    pub fn set_peer_muted(&self, peer: PlayerId, muted: bool) {
        let mixer = {
            let mut inner = self.inner.lock();
            inner.policy.peers.entry(peer).or_default().muted = muted;
            inner.mixer.clone()
        };
        if let Some(mixer) = mixer {
            mixer.set_peer_muted(peer, muted);
        }
    }

    pub fn set_peer_volume(&self, peer: PlayerId, volume: f32) {
        let volume = volume.clamp(0.0, MAX_VOLUME);
        let mixer = {
            let mut inner = self.inner.lock();
            inner.policy.peers.entry(peer).or_default().volume = volume;
            inner.mixer.clone()
        };
        if let Some(mixer) = mixer {
            mixer.set_peer_volume(peer, volume);
        }
    }

    pub fn peer_policy(&self, peer: PlayerId) -> PeerPolicy {
        self.inner
            .lock()
            .policy
            .peers
            .get(&peer)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_master_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, MAX_VOLUME);
        let mixer = {
            let mut inner = self.inner.lock();
            inner.policy.master_volume = volume;
            inner.mixer.clone()
        };
        if let Some(mixer) = mixer {
            mixer.set_master_volume(volume);
        }
    }

    pub fn set_spatial(&self, enabled: bool) {
        let mixer = {
            let mut inner = self.inner.lock();
            inner.policy.spatial = enabled;
            inner.mixer.clone()
        };
        if let Some(mixer) = mixer {
            mixer.set_spatial(enabled);
        }
    }

    fn should_run(&self, inner: &Inner) -> bool {
        inner.enabled
            && matches!(inner.role, Some(Role::Client | Role::ListenServer))
            && self.transport.is_active()
            && self.gate.is_enabled()
    }

    /// Bring devices in line with the desired state. Caller holds
    /// `transition`.
    fn refresh_locked(&self) {
        let (run, state, role) = {
            let inner = self.inner.lock();
            (self.should_run(&inner), inner.state, inner.role)
        };

        if !run {
            if state != SessionState::Disabled {
                self.shut_down_audio(SessionState::Disabled);
            }
            return;
        }
        if state != SessionState::Disabled {
            // Running already, or parked in a device error
            return;
        }
        if let Some(role) = role {
            self.activate(role);
        }
    }

    fn activate(&self, role: Role) {
        let sink: Weak<dyn CaptureSink> = self.this.clone();
        let opened = {
            let mut audio = self.audio.lock();
            let result = audio
                .start_capture(sink)
                .map_err(|e| (SessionState::MicError, e))
                .and_then(|_| {
                    audio
                        .start_playback()
                        .map_err(|e| (SessionState::SpeakerError, e))
                });
            if result.is_err() {
                audio.close();
            }
            result
        };

        let mixer = match opened {
            Ok(mixer) => mixer,
            Err((state, e)) => {
                tracing::warn!("Failed to open audio device: {}", e);
                let reason = match &e {
                    Error::Audio(audio) => audio.to_string(),
                    other => other.to_string(),
                };
                self.set_state(state);
                self.publish(SessionEvent::Notice(match state {
                    SessionState::MicError => Notice::MicUnavailable(reason),
                    _ => Notice::SpeakerUnavailable(reason),
                }));
                return;
            }
        };

        {
            let mut inner = self.inner.lock();
            inner.policy.apply(&mixer);
            inner.mixer = Some(mixer);
        }
        self.set_state(SessionState::Ready);
        self.update_positions();

        match role {
            Role::ListenServer => self.set_state(SessionState::Connected),
            Role::Client => {
                let deferred = {
                    let mut inner = self.inner.lock();
                    let timeout = Duration::from_millis(self.config.session.handshake_timeout_ms);
                    inner.handshake_deadline = Some(Instant::now() + timeout);
                    inner.deferred_request.take()
                };
                self.set_state(SessionState::WaitingHandshake);
                if let Some(request) = deferred {
                    self.answer_handshake(request);
                }
            }
            Role::DedicatedServer => {}
        }
    }

    /// Stop both devices and drop the mixer. Caller holds `transition`.
    fn shut_down_audio(&self, next: SessionState) {
        // Stop sending before the capture thread is joined
        self.set_state(next);
        {
            let mut inner = self.inner.lock();
            inner.mixer = None;
            inner.handshake_deadline = None;
        }
        self.audio.lock().close();
    }

    fn on_handshake_request(&self, conn: ConnectionId, request: HandshakeRequest) {
        if Some(conn) != self.transport.server_connection() {
            tracing::debug!("Ignoring voice handshake from non-server {}", conn);
            return;
        }
        let _transition = self.transition.lock();
        let state = {
            let mut inner = self.inner.lock();
            if !matches!(
                inner.state,
                SessionState::WaitingHandshake | SessionState::Connected
            ) {
                inner.deferred_request = Some(request);
            }
            inner.state
        };
        match state {
            SessionState::WaitingHandshake | SessionState::Connected => {
                self.answer_handshake(request)
            }
            _ => tracing::debug!("Deferring voice handshake while {}", state),
        }
    }

    /// Reply to the server and move to Connected or give up. Caller holds
    /// `transition`.
    fn answer_handshake(&self, request: HandshakeRequest) {
        let code = ResponseCode::for_versions(request.protocol_version, PROTOCOL_VERSION);
        if let Some(server) = self.transport.server_connection() {
            self.send(
                server,
                &VoiceMessage::HandshakeResponse(HandshakeResponse { code }),
            );
        }

        match Notice::for_response(code) {
            None => {
                self.inner.lock().handshake_deadline = None;
                self.set_state(SessionState::Connected);
            }
            Some(notice) => {
                tracing::warn!(
                    "Voice protocol mismatch: server {}, local {}",
                    request.protocol_version,
                    PROTOCOL_VERSION
                );
                self.fail_handshake(notice);
            }
        }
    }

    /// Mute, switch voice off and tell the user. Caller holds `transition`.
    fn fail_handshake(&self, notice: Notice) {
        {
            let mut inner = self.inner.lock();
            inner.enabled = false;
            inner.deferred_request = None;
        }
        self.set_mic_muted(true);
        self.shut_down_audio(SessionState::Disabled);
        self.publish(SessionEvent::Notice(notice));
    }

    fn on_handshake_response(&self, conn: ConnectionId, response: HandshakeResponse) {
        let mut inner = self.inner.lock();
        let player = self.roster.player_for_connection(conn).map(|p| p.id);
        let link = inner.links.entry(conn).or_insert(Link {
            state: LinkState::Pending,
            player,
            opened: Instant::now(),
        });
        if link.player.is_none() {
            link.player = player;
        }
        link.state = match response.code {
            ResponseCode::Accepted => LinkState::Accepted,
            code => {
                tracing::warn!("Voice handshake with {} rejected: {:?}", conn, code);
                LinkState::Rejected
            }
        };
        tracing::debug!("Voice link {} is {:?}", conn, link.state);
    }

    /// Server side: stamp the sender, fan out and maybe play locally
    fn route(&self, origin: ConnectionId, mut packet: AudioPacket) {
        let Some(sender) = self.roster.player_for_connection(origin) else {
            tracing::trace!("Dropping audio from unknown player on {}", origin);
            return;
        };
        if packet.sender_id != sender.id {
            tracing::trace!(
                "Rewriting sender id {} to {} on {}",
                packet.sender_id,
                sender.id,
                origin
            );
            packet.sender_id = sender.id;
        }

        let (targets, play_locally) = {
            let inner = self.inner.lock();
            match inner.links.get(&origin) {
                Some(link) if link.state == LinkState::Accepted => {}
                _ => {
                    tracing::trace!("Dropping audio from unaccepted {}", origin);
                    return;
                }
            }
            let targets = self.targets(&inner, Some(origin), sender.team);
            let play_locally = inner.role == Some(Role::ListenServer)
                && inner.state == SessionState::Connected;
            (targets, play_locally)
        };

        if !targets.is_empty() {
            self.broadcast(&targets, &VoiceMessage::Audio(packet.clone()));
        }
        if play_locally {
            self.play(packet);
        }
    }

    /// Accepted connections that should hear a player on `team`
    fn targets(&self, inner: &Inner, except: Option<ConnectionId>, team: u32) -> Vec<ConnectionId> {
        inner
            .links
            .iter()
            .filter(|(conn, link)| link.state == LinkState::Accepted && Some(**conn) != except)
            .filter(|(conn, link)| {
                if !self.config.session.team_only {
                    return true;
                }
                link.player
                    .and_then(|id| self.roster.player(id))
                    .or_else(|| self.roster.player_for_connection(**conn))
                    .is_some_and(|listener| listener.team == team)
            })
            .map(|(conn, _)| *conn)
            .collect()
    }

    /// Unbatch into the mixer
    fn play(&self, packet: AudioPacket) {
        if self
            .roster
            .local_player()
            .is_some_and(|local| local.id == packet.sender_id)
        {
            tracing::trace!("Dropping own voice echoed back");
            return;
        }
        let mixer = {
            let inner = self.inner.lock();
            if inner.state != SessionState::Connected {
                return;
            }
            inner.mixer.clone()
        };
        let Some(mixer) = mixer else {
            return;
        };
        for (sequence, frame) in packet.frames() {
            mixer.queue(packet.sender_id, sequence, frame);
        }
    }

    fn broadcast(&self, targets: &[ConnectionId], message: &VoiceMessage) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("Failed to encode voice message: {}", e);
                return;
            }
        };
        for &conn in targets {
            self.send_bytes(conn, bytes.clone(), message.is_reliable());
        }
    }

    fn send(&self, conn: ConnectionId, message: &VoiceMessage) {
        self.broadcast(&[conn], message);
    }

    fn send_bytes(&self, conn: ConnectionId, bytes: Bytes, reliable: bool) {
        let delivery = if reliable {
            Delivery::Reliable
        } else {
            Delivery::Unreliable
        };
        if let Err(e) = self.transport.send(conn, bytes, delivery) {
            tracing::debug!("Voice send to {} failed: {}", conn, e);
        }
    }

    fn set_state(&self, to: SessionState) {
        let from = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.state, to)
        };
        if from != to {
            tracing::info!("Voice session {} -> {}", from, to);
            self.publish(SessionEvent::StateChanged { from, to });
        }
    }

    fn publish(&self, event: SessionEvent) {
        if self.events_tx.try_send(event).is_err() {
            tracing::trace!("Voice event queue full, dropping event");
        }
    }
}

impl CaptureSink for SessionManager {
    fn submit(&self, sequence: u32, payload: Bytes) {
        let Some(local) = self.roster.local_player() else {
            return;
        };
        let targets = {
            let inner = self.inner.lock();
            if inner.state != SessionState::Connected || inner.policy.mic_muted {
                return;
            }
            match inner.role {
                Some(Role::Client) => self.transport.server_connection().into_iter().collect(),
                Some(Role::ListenServer) => self.targets(&inner, None, local.team),
                _ => Vec::new(),
            }
        };
        if targets.is_empty() {
            return;
        }

        let packet = AudioPacket {
            sender_id: local.id,
            sequence,
            payload,
        };
        self.broadcast(&targets, &VoiceMessage::Audio(packet));
    }
}
