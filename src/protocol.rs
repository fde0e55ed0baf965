//! Voice wire protocol
//!
//! Messages ride on the host game's own channel. Handshakes go reliable,
//! audio goes unreliable. An audio payload is a run of Opus sub-frames:
//!
//! ```text
//! [len: u16 BE][opus bytes ...][len: u16 BE][opus bytes ...] ...
//! ```

use bincode::Options;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_MESSAGE_SIZE, MAX_OPUS_FRAME, PROTOCOL_VERSION};
use crate::error::ProtocolError;
use crate::PlayerId;

/// Sent by the server when a connection opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol_version: u32,
}

impl Default for HandshakeRequest {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Outcome of comparing protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    Accepted,
    ServerOutdated,
    ClientOutdated,
}

impl ResponseCode {
    /// Compare the server's advertised version against ours
    pub fn for_versions(server: u32, client: u32) -> Self {
        match server.cmp(&client) {
            std::cmp::Ordering::Equal => ResponseCode::Accepted,
            std::cmp::Ordering::Less => ResponseCode::ServerOutdated,
            std::cmp::Ordering::Greater => ResponseCode::ClientOutdated,
        }
    }
}

/// Client's answer to [`HandshakeRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub code: ResponseCode,
}

/// One batch of encoded voice from a single player
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPacket {
    pub sender_id: PlayerId,
    /// Sequence number of the first sub-frame
    pub sequence: u32,
    pub payload: Bytes,
}

impl AudioPacket {
    /// Split the payload into `(sequence, frame)` pairs
    pub fn frames(&self) -> Vec<(u32, Bytes)> {
        unpack_frames(&self.payload)
            .into_iter()
            .enumerate()
            .map(|(i, frame)| (self.sequence.wrapping_add(i as u32), frame))
            .collect()
    }
}

/// Everything the voice layer puts on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoiceMessage {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    Audio(AudioPacket),
}

impl VoiceMessage {
    /// Whether the message needs the reliable channel
    pub fn is_reliable(&self) -> bool {
        !matches!(self, VoiceMessage::Audio(_))
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        wire_options()
            .serialize(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() as u64 > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(data.len()));
        }
        wire_options()
            .deserialize(data)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_big_endian()
        .with_fixint_encoding()
}

/// Concatenate encoded sub-frames with 2-byte big-endian length prefixes.
/// Empty frames carry nothing and are skipped.
pub fn pack_frames(frames: &[Bytes]) -> Bytes {
    let total: usize = frames.iter().map(|f| f.len() + 2).sum();
    let mut out = BytesMut::with_capacity(total);
    for frame in frames.iter().filter(|f| !f.is_empty()) {
        debug_assert!(frame.len() <= u16::MAX as usize);
        out.put_u16(frame.len() as u16);
        out.put_slice(frame);
    }
    out.freeze()
}

/// Split a payload produced by [`pack_frames`].
///
/// Parsing stops at the end of the payload or at the first length that is
/// zero, larger than an Opus frame, or runs past the end.
pub fn unpack_frames(payload: &Bytes) -> Vec<Bytes> {
    let mut frames = Vec::new();
    let mut cursor = payload.clone();
    while cursor.remaining() >= 2 {
        let len = cursor.get_u16() as usize;
        if len == 0 || len > MAX_OPUS_FRAME || len > cursor.remaining() {
            tracing::trace!("Stopping unpack at invalid sub-frame length {}", len);
            break;
        }
        frames.push(cursor.split_to(len));
    }
    frames
}
