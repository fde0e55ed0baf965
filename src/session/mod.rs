//! Voice session: handshake, routing and user policy

pub mod manager;
pub mod state;

pub use manager::SessionManager;
pub use state::{LinkState, Notice, Role, SessionEvent, SessionState};
