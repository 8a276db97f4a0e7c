// fabric-protocol: Wire codec and shared protocol types for the event fabric.
//
// A data frame on the wire is the ASCII room identifier, one `\n`, then the
// opaque event JSON.  The event bytes are never parsed by the core; only the
// room tag is interpreted for routing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Keepalive constants
// ---------------------------------------------------------------------------

/// Time allowed to write a message to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed to read the next pong message from the peer.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Period between pings.  Must be less than `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(30);

/// Time a client allows between pings from the hub before giving up.
pub const PING_WAIT: Duration = Duration::from_secs(90);

// ---------------------------------------------------------------------------
// EventWrapper
// ---------------------------------------------------------------------------

/// An event and its room tag, carried through every internal queue unchanged.
///
/// The event bytes are opaque JSON; wrapping avoids re-parsing between
/// ingress and egress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventWrapper {
    pub room: String,
    pub event: Vec<u8>,
}

impl EventWrapper {
    pub fn new(room: impl Into<String>, event: impl Into<Vec<u8>>) -> Self {
        EventWrapper {
            room: room.into(),
            event: event.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// SourceType
// ---------------------------------------------------------------------------

/// The role of an endpoint, and the source tag on a submitted event.
///
/// String forms appear on the wire (`/connect/:type`) and in the status
/// surface; everywhere else the closed variant is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    Messenger,
    Repeater,
    Hub,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Messenger => "messenger",
            SourceType::Repeater => "repeater",
            SourceType::Hub => "hub",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "messenger" => Ok(SourceType::Messenger),
            "repeater" => Ok(SourceType::Repeater),
            "hub" => Ok(SourceType::Hub),
            other => Err(CodecError::UnknownSourceType(other.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// SubscriptionChange
// ---------------------------------------------------------------------------

/// A request to add or remove room subscriptions, sent as a JSON text frame.
///
/// `create = true` subscribes, `create = false` unsubscribes.  An empty
/// `rooms` list on an unsubscribe means "every room I am subscribed to".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionChange {
    pub rooms: Vec<String>,
    pub create: bool,
}

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

/// Parse a binary frame of the form `room\nJSON`.
///
/// The split point is the first `\n`; its absence is a framing error.  The
/// room portion must be UTF-8.
pub fn parse_message(b: &[u8]) -> Result<EventWrapper, CodecError> {
    let index = b
        .iter()
        .position(|&c| c == b'\n')
        .ok_or(CodecError::MissingSeparator)?;

    let room = std::str::from_utf8(&b[..index])
        .map_err(|_| CodecError::InvalidRoom)?
        .to_owned();

    Ok(EventWrapper {
        room,
        event: b[index + 1..].to_vec(),
    })
}

/// Encode an [`EventWrapper`] into the `room\nJSON` frame format.
pub fn prepare_message(message: &EventWrapper) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.room.len() + 1 + message.event.len());
    out.extend_from_slice(message.room.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(&message.event);
    out
}

// ---------------------------------------------------------------------------
// Room tag extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TaggedEvent {
    #[serde(rename = "affectedRoom")]
    affected_room: AffectedRoom,
}

#[derive(Debug, Deserialize)]
struct AffectedRoom {
    #[serde(rename = "roomID")]
    room_id: String,
}

/// Extract the `affectedRoom.roomID` tag from raw event JSON.
///
/// Returns `None` when the tag is absent, empty, or the body is not valid
/// JSON.  The rest of the event is not interpreted.
pub fn room_of(event: &[u8]) -> Option<String> {
    let tagged: TaggedEvent = serde_json::from_slice(event).ok()?;
    if tagged.affected_room.room_id.is_empty() {
        return None;
    }
    Some(tagged.affected_room.room_id)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// No `\n` separator between the room tag and the event bytes.
    #[error("invalid frame: missing room separator")]
    MissingSeparator,
    /// The room portion of the frame was not UTF-8.
    #[error("invalid frame: room tag is not UTF-8")]
    InvalidRoom,
    #[error("unknown source type: {0}")]
    UnknownSourceType(String),
}
