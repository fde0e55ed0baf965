//! Session states and the events published to the UI

use std::fmt;

use crate::protocol::ResponseCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Voice off, or the network is not up
    Disabled,
    /// Client waiting for the server's handshake request
    WaitingHandshake,
    /// Devices open
    Ready,
    /// Microphone failed to open; stays here until re-enabled
    MicError,
    /// Speaker failed to open; stays here until re-enabled
    SpeakerError,
    /// Sending and receiving voice
    Connected,
}

impl SessionState {
    pub fn is_error(self) -> bool {
        matches!(self, SessionState::MicError | SessionState::SpeakerError)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disabled => "disabled",
            SessionState::WaitingHandshake => "waiting for handshake",
            SessionState::Ready => "ready",
            SessionState::MicError => "microphone error",
            SessionState::SpeakerError => "speaker error",
            SessionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// What this process is in the host game's network session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    /// Server that is also a player
    ListenServer,
    /// Server without a local player; routes only
    DedicatedServer,
}

impl Role {
    pub fn is_server(self) -> bool {
        !matches!(self, Role::Client)
    }
}

/// Handshake progress of one connection, tracked by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Pending,
    Accepted,
    Rejected,
}

/// User-facing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    HandshakeTimeout,
    ServerOutdated,
    ClientOutdated,
    MicUnavailable(String),
    SpeakerUnavailable(String),
}

impl Notice {
    /// Notice for a failed version check, `None` when accepted
    pub fn for_response(code: ResponseCode) -> Option<Self> {
        match code {
            ResponseCode::Accepted => None,
            ResponseCode::ServerOutdated => Some(Notice::ServerOutdated),
            ResponseCode::ClientOutdated => Some(Notice::ClientOutdated),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::HandshakeTimeout => {
                f.write_str("The server did not answer the voice handshake. Voice chat was turned off.")
            }
            Notice::ServerOutdated => f.write_str(
                "The server runs an older voice version. Voice chat was turned off.",
            ),
            Notice::ClientOutdated => f.write_str(
                "Your voice version is older than the server's. Update to use voice chat.",
            ),
            Notice::MicUnavailable(reason) => write!(f, "Could not open the microphone: {}", reason),
            Notice::SpeakerUnavailable(reason) => write!(f, "Could not open the speaker: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Notice(Notice),
    MicMuted(bool),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_for_response() {
        assert_eq!(Notice::for_response(ResponseCode::Accepted), None);
        assert_eq!(
            Notice::for_response(ResponseCode::ClientOutdated),
            Some(Notice::ClientOutdated)
        );
    }

    #[test]
    fn test_roles() {
        assert!(!Role::Client.is_server());
        assert!(Role::ListenServer.is_server());
        assert!(Role::DedicatedServer.is_server());
        assert!(SessionState::MicError.is_error());
        assert!(!SessionState::Disabled.is_error());
    }
}
