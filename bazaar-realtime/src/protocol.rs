//! Change-feed types and the binary frame envelope.
//!
//! Records are schemaless JSON objects keyed by an `"id"` field. Everything a
//! provider delivers is normalized into a [`ProviderFrame`] before it reaches
//! the channel layer.
//!
//! Wire format for the websocket transport (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┐
//! │ kind     │ topic     │ event     │ payload  │
//! │ 1 byte   │ string    │ string    │ variable │
//! └──────────┴───────────┴───────────┴──────────┘
//! ```
//!
//! Change payloads carry records as JSON bytes since bincode cannot decode
//! self-describing values. Everything else in the payload is bincode.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A server-side row as seen by the client.
pub type Record = serde_json::Map<String, Value>;

/// Name of the key field every record carries.
pub const ID_FIELD: &str = "id";

/// Read the `"id"` field of a record.
pub fn record_id(record: &Record) -> Option<&str> {
    record.get(ID_FIELD).and_then(Value::as_str)
}

/// Read a string field of a record.
pub fn record_str<'a>(record: &'a Record, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

/// Build the topic name for a table, optionally narrowed by a filter.
///
/// `posts` + `thread_id=eq.42` becomes `posts:thread_id=eq.42`.
pub fn table_topic(table: &str, filter: Option<&EventFilter>) -> String {
    match filter {
        Some(filter) => format!("{table}:{filter}"),
        None => table.to_string(),
    }
}

/// Table part of a topic name.
pub fn table_of(topic: &str) -> &str {
    topic.split(':').next().unwrap_or(topic)
}

// ───────────────────────────────────────────────────────────────────
// Change events
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Change notification exactly as a provider hands it over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub kind: ChangeKind,
    pub entity_id: String,
    pub new_record: Option<Record>,
    pub old_record: Option<Record>,
}

impl RawChange {
    pub fn insert(record: Record) -> Self {
        Self {
            kind: ChangeKind::Insert,
            entity_id: record_id(&record).unwrap_or_default().to_string(),
            new_record: Some(record),
            old_record: None,
        }
    }

    pub fn update(record: Record) -> Self {
        Self {
            kind: ChangeKind::Update,
            entity_id: record_id(&record).unwrap_or_default().to_string(),
            new_record: Some(record),
            old_record: None,
        }
    }

    pub fn delete(old: Record) -> Self {
        Self {
            kind: ChangeKind::Delete,
            entity_id: record_id(&old).unwrap_or_default().to_string(),
            new_record: None,
            old_record: Some(old),
        }
    }
}

/// A change notification after the channel layer has stamped it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entity_id: String,
    pub new_record: Option<Record>,
    pub old_record: Option<Record>,
    /// Topic of the channel that delivered the event.
    pub topic: String,
    /// Per-channel receipt counter, monotonic across reconnects.
    pub sequence: u64,
}

impl ChangeEvent {
    pub fn from_raw(raw: RawChange, topic: impl Into<String>, sequence: u64) -> Self {
        Self {
            kind: raw.kind,
            entity_id: raw.entity_id,
            new_record: raw.new_record,
            old_record: raw.old_record,
            topic: topic.into(),
            sequence,
        }
    }
}

/// Column equality filter (`column=eq.value`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventFilter {
    pub column: String,
    pub value: String,
}

impl EventFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Whether a record satisfies the filter. Numbers and booleans compare
    /// by their JSON text.
    pub fn matches(&self, record: &Record) -> bool {
        match record.get(&self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }

    /// Whether either side of a change satisfies the filter.
    pub fn matches_change(&self, change: &RawChange) -> bool {
        change.new_record.as_ref().is_some_and(|r| self.matches(r))
            || change.old_record.as_ref().is_some_and(|r| self.matches(r))
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

// ───────────────────────────────────────────────────────────────────
// Provider frames
// ───────────────────────────────────────────────────────────────────

/// Subscription status reported by the change-feed provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

/// One peer's presence payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub peer_id: String,
    /// Fresh for every join; heartbeat counters restart with it.
    pub epoch: Uuid,
    pub metadata: BTreeMap<String, String>,
    /// Sender-side heartbeat counter; increases on every track.
    pub heartbeat: u64,
}

/// Presence control messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceMessage {
    /// Full roster as the provider currently knows it.
    Sync(Vec<PresenceState>),
    Join(Vec<PresenceState>),
    /// Peer ids that left.
    Leave(Vec<String>),
}

/// Everything a provider subscription can yield.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFrame {
    Status(ProviderStatus),
    Change(RawChange),
    Broadcast { event: String, payload: Vec<u8> },
    Presence(PresenceMessage),
}

/// The local user of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewer {
    pub id: String,
    pub display_name: String,
}

impl Viewer {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Broadcast event name used for typing signals.
pub const TYPING_EVENT: &str = "typing";

/// Typing broadcast payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub user_id: String,
    pub display_name: String,
    /// `true` for "typing start", `false` for "typing stop".
    pub typing: bool,
}

impl TypingPayload {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_bincode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_bincode(bytes)
    }
}

// ───────────────────────────────────────────────────────────────────
// Websocket envelope
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Client → server: join a topic; payload is `Option<EventFilter>`
    Subscribe = 1,
    /// Client → server: leave a topic
    Unsubscribe = 2,
    /// Server → client: subscription status
    Status = 3,
    /// Either direction: a row change (JSON payload)
    Change = 4,
    /// Either direction: ephemeral broadcast
    Broadcast = 5,
    /// Client → server: presence heartbeat
    Track = 6,
    /// Client → server: presence removal; payload is the peer id
    Untrack = 7,
    /// Server → client: presence control message
    Presence = 8,
}

/// Top-level websocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    pub topic: String,
    /// Broadcast event name, empty for other kinds.
    pub event: String,
    pub payload: Vec<u8>,
}

impl Frame {
    fn new(kind: FrameKind, topic: &str, payload: Vec<u8>) -> Self {
        Self {
            kind,
            topic: topic.to_string(),
            event: String::new(),
            payload,
        }
    }

    pub fn subscribe(topic: &str, filter: Option<&EventFilter>) -> Result<Self, ProtocolError> {
        Ok(Self::new(FrameKind::Subscribe, topic, encode_bincode(&filter)?))
    }

    pub fn unsubscribe(topic: &str) -> Self {
        Self::new(FrameKind::Unsubscribe, topic, Vec::new())
    }

    pub fn status(topic: &str, status: &ProviderStatus) -> Result<Self, ProtocolError> {
        Ok(Self::new(FrameKind::Status, topic, encode_bincode(status)?))
    }

    pub fn change(topic: &str, change: &RawChange) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(change)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(FrameKind::Change, topic, payload))
    }

    pub fn broadcast(topic: &str, event: &str, payload: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Broadcast,
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        }
    }

    pub fn track(topic: &str, state: &PresenceState) -> Result<Self, ProtocolError> {
        Ok(Self::new(FrameKind::Track, topic, encode_bincode(state)?))
    }

    pub fn untrack(topic: &str, peer_id: &str) -> Self {
        Self::new(FrameKind::Untrack, topic, peer_id.as_bytes().to_vec())
    }

    pub fn presence(topic: &str, message: &PresenceMessage) -> Result<Self, ProtocolError> {
        Ok(Self::new(FrameKind::Presence, topic, encode_bincode(message)?))
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_bincode(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_bincode(bytes)
    }

    /// Parse the subscribe filter payload.
    pub fn filter(&self) -> Result<Option<EventFilter>, ProtocolError> {
        if self.kind != FrameKind::Subscribe {
            return Err(ProtocolError::InvalidFrameKind);
        }
        decode_bincode(&self.payload)
    }

    /// Parse the track payload.
    pub fn presence_state(&self) -> Result<PresenceState, ProtocolError> {
        if self.kind != FrameKind::Track {
            return Err(ProtocolError::InvalidFrameKind);
        }
        decode_bincode(&self.payload)
    }

    /// Convert a server → client frame into what the channel layer consumes.
    pub fn into_provider_frame(self) -> Result<ProviderFrame, ProtocolError> {
        match self.kind {
            FrameKind::Status => Ok(ProviderFrame::Status(decode_bincode(&self.payload)?)),
            FrameKind::Change => {
                let change = serde_json::from_slice(&self.payload)
                    .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
                Ok(ProviderFrame::Change(change))
            }
            FrameKind::Broadcast => Ok(ProviderFrame::Broadcast {
                event: self.event,
                payload: self.payload,
            }),
            FrameKind::Presence => Ok(ProviderFrame::Presence(decode_bincode(&self.payload)?)),
            FrameKind::Subscribe | FrameKind::Unsubscribe | FrameKind::Track | FrameKind::Untrack => {
                Err(ProtocolError::InvalidFrameKind)
            }
        }
    }
}

fn encode_bincode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_bincode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidFrameKind,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidFrameKind => write!(f, "Invalid frame kind"),
        }
    }
}

impl std::error::Error for ProtocolError {}
