//! Host networking boundary
//!
//! Voice rides on the game's own connection. The host implements
//! [`TransportAdapter`] for sending and feeds received bytes into the
//! session manager; [`PlayerRoster`] and [`VoiceGate`] are read-only views of
//! host state.

pub mod memory;
pub mod transport;

pub use memory::{MemoryTransport, Outbound, StaticRoster};
pub use transport::{ConnectionId, Delivery, PlayerInfo, PlayerRoster, TransportAdapter, VoiceGate};
