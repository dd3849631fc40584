//! Envelope — the wire unit exchanged over the chat socket.
//!
//! ARCHITECTURE
//! ============
//! Every frame in either direction is one JSON envelope:
//! `{"type", "payload", "timestamp", "request_id"}`. The outer envelope is
//! always decoded first; the payload stays an opaque JSON value until the
//! handler for that `type` asks for its concrete shape via [`Request::decode`].
//!
//! DESIGN
//! ======
//! - `type` is a closed enum. Inbound and outbound kinds share one namespace.
//! - `request_id` is opaque. It is echoed on the ack or error that answers a
//!   request and never interpreted by the server.
//! - Construction always stamps `timestamp`; inbound frames may omit it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Numeric error code plus client-facing text for error envelopes.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> u16;

    /// Text sent to the client. Defaults to the `Display` form.
    fn client_message(&self) -> String {
        self.to_string()
    }
}

pub const CODE_BAD_REQUEST: u16 = 400;
pub const CODE_FORBIDDEN: u16 = 403;
pub const CODE_INTERNAL: u16 = 500;

/// Protocol-level decode and validation failures. Never close the socket.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Envelope(serde_json::Error),
    #[error("invalid {kind:?} payload: {source}")]
    Payload { kind: Kind, source: serde_json::Error },
    #[error("unsupported message type: {0:?}")]
    Unsupported(Kind),
    #[error("binary frames are not supported")]
    Binary,
    #[error("{0}")]
    Invalid(String),
}

impl ErrorCode for ProtocolError {
    fn error_code(&self) -> u16 {
        CODE_BAD_REQUEST
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Closed set of message kinds, inbound first then outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    JoinRoom,
    LeaveRoom,
    SendMessage,
    SendDirectMessage,
    Typing,
    StopTyping,
    MarkRead,
    Ping,

    RoomJoined,
    RoomLeft,
    NewMessage,
    UserTyping,
    UserStopTyping,
    Pong,
    UserOnline,
    UserOffline,
    Error,
    Ack,
    NewDirectMessage,
    DirectMessageRead,
}

impl Kind {
    /// Kinds a client is allowed to send.
    #[must_use]
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            Self::JoinRoom
                | Self::LeaveRoom
                | Self::SendMessage
                | Self::SendDirectMessage
                | Self::Typing
                | Self::StopTyping
                | Self::MarkRead
                | Self::Ping
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Envelope {
    /// Build an outbound envelope stamped with the current time.
    pub fn new(kind: Kind, payload: impl Serialize) -> Self {
        Self {
            kind,
            payload: serde_json::to_value(payload).unwrap_or_default(),
            timestamp: OffsetDateTime::now_utc(),
            request_id: None,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Acknowledge a request, echoing its correlation id.
    #[must_use]
    pub fn ack(request_id: Option<String>, message_id: Option<Uuid>) -> Self {
        let payload = Ack { request_id: request_id.clone(), success: true, message_id };
        Self::new(Kind::Ack, payload).with_request_id(request_id)
    }

    #[must_use]
    pub fn pong(request_id: Option<String>) -> Self {
        Self::new(Kind::Pong, serde_json::json!({})).with_request_id(request_id)
    }

    /// Build an error envelope from a typed error.
    #[must_use]
    pub fn error_from(err: &(impl ErrorCode + ?Sized), request_id: Option<String>) -> Self {
        let payload = ErrorPayload { code: err.error_code(), message: err.client_message() };
        Self::new(Kind::Error, payload).with_request_id(request_id)
    }

    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Envelope)
    }

    /// Best-effort recovery of `request_id` from a frame that failed to
    /// parse, so the error reply can still be correlated.
    #[must_use]
    pub fn salvage_request_id(text: &str) -> Option<String> {
        #[derive(Deserialize)]
        struct Loose {
            #[serde(default)]
            request_id: Option<String>,
        }

        serde_json::from_str::<Loose>(text).ok().and_then(|loose| loose.request_id)
    }

    /// Decode the opaque payload into the shape for this kind.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.payload).map_err(|source| ProtocolError::Payload { kind: self.kind, source })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// INBOUND PAYLOADS
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

impl MessageType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRef {
    pub room_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessage {
    pub room_id: Uuid,
    pub content: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub reply_to_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendDirectMessage {
    pub receiver_id: Uuid,
    pub content: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkRead {
    #[serde(default)]
    pub room_id: Option<Uuid>,
    #[serde(default)]
    pub sender_id: Option<Uuid>,
}

/// Reject blank bodies and bodies longer than `max_chars`.
pub fn validate_content(content: &str, max_chars: usize) -> Result<(), ProtocolError> {
    if content.trim().is_empty() {
        return Err(ProtocolError::Invalid("content must not be empty".into()));
    }
    if content.chars().count() > max_chars {
        return Err(ProtocolError::Invalid(format!("content exceeds {max_chars} characters")));
    }
    Ok(())
}

/// A decoded client request. Payload shape follows from the envelope kind.
#[derive(Debug, Clone)]
pub enum Request {
    JoinRoom(RoomRef),
    LeaveRoom(RoomRef),
    SendMessage(SendMessage),
    SendDirectMessage(SendDirectMessage),
    Typing { room_id: Uuid, typing: bool },
    MarkRead(MarkRead),
    Ping,
}

impl Request {
    /// Decode the payload of an already-parsed inbound envelope.
    pub fn decode(envelope: &Envelope) -> Result<Self, ProtocolError> {
        if !envelope.kind.is_inbound() {
            return Err(ProtocolError::Unsupported(envelope.kind));
        }
        let request = match envelope.kind {
            Kind::JoinRoom => Self::JoinRoom(envelope.payload_as()?),
            Kind::LeaveRoom => Self::LeaveRoom(envelope.payload_as()?),
            Kind::SendMessage => Self::SendMessage(envelope.payload_as()?),
            Kind::SendDirectMessage => Self::SendDirectMessage(envelope.payload_as()?),
            Kind::Typing | Kind::StopTyping => {
                let room: RoomRef = envelope.payload_as()?;
                Self::Typing { room_id: room.room_id, typing: envelope.kind == Kind::Typing }
            }
            Kind::MarkRead => Self::MarkRead(envelope.payload_as()?),
            Kind::Ping => Self::Ping,
            other => return Err(ProtocolError::Unsupported(other)),
        };
        Ok(request)
    }
}

// =============================================================================
// OUTBOUND PAYLOADS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub request_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomJoined {
    pub room_id: Uuid,
    pub name: String,
    pub member_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDirectMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTyping {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMessageRead {
    pub reader_id: Uuid,
    pub sender_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub read_at: OffsetDateTime,
}

#[cfg(test)]
#[path = "envelope_test.rs"]
mod tests;
