use parley_crypto::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A participant as seen on the wire: client-generated id plus a
/// self-asserted display name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
}

/// Every message exchanged between a client and the relay.
///
/// The `type` tag is snake_case, fields are camelCase. Negotiation frames
/// (offer/answer/ice_candidate/chat_message) are relayed verbatim, so the
/// same shapes travel in both directions; SDP and candidate payloads stay
/// opaque `Value`s at this layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    #[serde(rename_all = "camelCase")]
    Join { room_id: String, user: UserInfo },
    #[serde(rename_all = "camelCase")]
    RoomJoined { room_id: String, is_initiator: bool },
    #[serde(rename_all = "camelCase")]
    UserJoined { user: UserInfo, room_id: String },
    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: String, room_id: String },
    #[serde(rename_all = "camelCase")]
    Offer {
        offer: Value,
        room_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        answer: Value,
        room_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: Option<Value>,
        room_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        encrypted: Envelope,
        room_id: String,
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Leave { room_id: String, user_id: String },
    Error { message: String },
}

const KNOWN_TYPES: &[&str] = &[
    "join",
    "room_joined",
    "user_joined",
    "user_left",
    "offer",
    "answer",
    "ice_candidate",
    "chat_message",
    "leave",
    "error",
];

impl Frame {
    /// The wire value of the `type` tag, for logging and error echoes.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Join { .. } => "join",
            Frame::RoomJoined { .. } => "room_joined",
            Frame::UserJoined { .. } => "user_joined",
            Frame::UserLeft { .. } => "user_left",
            Frame::Offer { .. } => "offer",
            Frame::Answer { .. } => "answer",
            Frame::IceCandidate { .. } => "ice_candidate",
            Frame::ChatMessage { .. } => "chat_message",
            Frame::Leave { .. } => "leave",
            Frame::Error { .. } => "error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame is missing a type tag")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    /// The type tag is known but the fields do not deserialize, so the
    /// receiver can report the failure against the specific frame kind.
    #[error("invalid {kind} frame: {detail}")]
    InvalidFields { kind: &'static str, detail: String },
}

/// Parse one inbound text frame, failing closed.
///
/// An unrecognized `type` tag is reported as `UnknownType` so the relay can
/// echo an error to the sender only. A known tag whose fields do not
/// deserialize is `InvalidFields` carrying the tag; non-JSON input is
/// `Malformed`.
pub fn parse_frame(text: &str) -> Result<Frame, WireError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| WireError::Malformed(err.to_string()))?;

    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(WireError::MissingType)?;
    let Some(kind) = KNOWN_TYPES.iter().copied().find(|known| *known == tag) else {
        return Err(WireError::UnknownType(tag.to_string()));
    };

    serde_json::from_value(value).map_err(|err| WireError::InvalidFields {
        kind,
        detail: err.to_string(),
    })
}
