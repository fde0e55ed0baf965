//! Collaborator traits implemented by the host game

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::TransportError;
use crate::mixer::Position;
use crate::PlayerId;

/// Host-assigned handle of one network connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Ordered and retransmitted; used for handshakes
    Reliable,
    /// Fire and forget; used for audio
    Unreliable,
}

pub trait TransportAdapter: Send + Sync {
    fn send(&self, conn: ConnectionId, bytes: Bytes, delivery: Delivery)
        -> Result<(), TransportError>;

    /// Connection to the server when running as a client
    fn server_connection(&self) -> Option<ConnectionId>;

    /// Whether the host network session is up
    fn is_active(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerInfo {
    pub id: PlayerId,
    pub team: u32,
    pub position: Option<Position>,
    /// Stable identity across reconnects
    pub unique_id: String,
}

pub trait PlayerRoster: Send + Sync {
    fn local_player(&self) -> Option<PlayerInfo>;

    fn player(&self, id: PlayerId) -> Option<PlayerInfo>;

    /// Player behind a connection, as far as the server knows
    fn player_for_connection(&self, conn: ConnectionId) -> Option<PlayerInfo>;
}

/// Externally managed permission to use voice (e.g. authenticated session)
pub trait VoiceGate: Send + Sync {
    fn is_enabled(&self) -> bool;
}

impl VoiceGate for AtomicBool {
    fn is_enabled(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}
