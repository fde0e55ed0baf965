//! In-process transport and roster for tests and the loopback tool

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use super::transport::{ConnectionId, Delivery, PlayerInfo, PlayerRoster, TransportAdapter};
use crate::error::TransportError;
use crate::mixer::Position;
use crate::PlayerId;

const OUTBOUND_CAPACITY: usize = 1024;

/// One message handed to the transport
#[derive(Debug, Clone)]
pub struct Outbound {
    pub conn: ConnectionId,
    pub delivery: Delivery,
    pub bytes: Bytes,
}

/// Transport that queues everything on a channel instead of a socket
pub struct MemoryTransport {
    server: Option<ConnectionId>,
    active: AtomicBool,
    closed: RwLock<HashSet<ConnectionId>>,
    tx: Sender<Outbound>,
}

impl MemoryTransport {
    pub fn new(server: Option<ConnectionId>, active: bool) -> (Self, Receiver<Outbound>) {
        let (tx, rx) = bounded(OUTBOUND_CAPACITY);
        let transport = Self {
            server,
            active: AtomicBool::new(active),
            closed: RwLock::new(HashSet::new()),
            tx,
        };
        (transport, rx)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Make further sends to `conn` fail
    pub fn close(&self, conn: ConnectionId) {
        self.closed.write().insert(conn);
    }
}

impl TransportAdapter for MemoryTransport {
    fn send(
        &self,
        conn: ConnectionId,
        bytes: Bytes,
        delivery: Delivery,
    ) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::NotConnected);
        }
        if self.closed.read().contains(&conn) {
            return Err(TransportError::Closed(conn.0));
        }
        self.tx
            .try_send(Outbound {
                conn,
                delivery,
                bytes,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => TransportError::SendFailed("outbound queue full".into()),
                TrySendError::Disconnected(_) => TransportError::Closed(conn.0),
            })
    }

    fn server_connection(&self) -> Option<ConnectionId> {
        self.server
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct RosterState {
    local: Option<PlayerId>,
    players: HashMap<PlayerId, PlayerInfo>,
    connections: HashMap<ConnectionId, PlayerId>,
}

/// Fixed player table
#[derive(Default)]
pub struct StaticRoster {
    state: RwLock<RosterState>,
}

impl StaticRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Roster whose local player is `id` on team 0
    pub fn with_local(id: PlayerId) -> Self {
        let roster = Self::new();
        roster.add_player(id, 0);
        roster.set_local(id);
        roster
    }

    pub fn add_player(&self, id: PlayerId, team: u32) {
        self.state.write().players.insert(
            id,
            PlayerInfo {
                id,
                team,
                position: None,
                unique_id: format!("player-{}", id),
            },
        );
    }

    pub fn remove_player(&self, id: PlayerId) {
        let mut state = self.state.write();
        state.players.remove(&id);
        state.connections.retain(|_, player| *player != id);
    }

    pub fn set_local(&self, id: PlayerId) {
        self.state.write().local = Some(id);
    }

    pub fn set_position(&self, id: PlayerId, position: Option<Position>) {
        if let Some(player) = self.state.write().players.get_mut(&id) {
            player.position = position;
        }
    }

    pub fn map_connection(&self, conn: ConnectionId, id: PlayerId) {
        self.state.write().connections.insert(conn, id);
    }

    pub fn players(&self) -> Vec<PlayerInfo> {
        self.state.read().players.values().cloned().collect()
    }
}

impl PlayerRoster for StaticRoster {
    fn local_player(&self) -> Option<PlayerInfo> {
        let state = self.state.read();
        state.local.and_then(|id| state.players.get(&id).cloned())
    }

    fn player(&self, id: PlayerId) -> Option<PlayerInfo> {
        self.state.read().players.get(&id).cloned()
    }

    fn player_for_connection(&self, conn: ConnectionId) -> Option<PlayerInfo> {
        let state = self.state.read();
        state
            .connections
            .get(&conn)
            .and_then(|id| state.players.get(id).cloned())
    }
}
