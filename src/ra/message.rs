use serde::{Deserialize, Serialize};

use crate::error::CodecError;

use super::{NodeId, Timestamp};

/// Protocol messages exchanged between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Permission request for the critical section.
    Request {
        /// Requesting node.
        sender_id: NodeId,
        /// Lamport timestamp of the request.
        timestamp: Timestamp,
    },

    /// Permission grant.
    Reply {
        /// Granting node.
        sender_id: NodeId,
        /// Timestamp of the REQUEST being granted. Peers may instead send
        /// their current clock, or nothing. Either way a value below the
        /// requester's current request timestamp marks a stale grant.
        timestamp: Option<Timestamp>,
    },
}

impl Message {
    /// Node that sent this message.
    pub fn sender(&self) -> NodeId {
        match self {
            Message::Request { sender_id, .. } | Message::Reply { sender_id, .. } => *sender_id,
        }
    }

    /// Timestamp carried by the message, if any.
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Message::Request { timestamp, .. } => Some(*timestamp),
            Message::Reply { timestamp, .. } => *timestamp,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request { .. } => MessageKind::Request,
            Message::Reply { .. } => MessageKind::Reply,
        }
    }
}

/// Message type tag as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Request,
    Reply,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Request => f.write_str("REQUEST"),
            MessageKind::Reply => f.write_str("REPLY"),
        }
    }
}

/// Flat, language-neutral text representation:
/// `{"type": "REQUEST"|"REPLY", "sender_id": n, "timestamp": n}`.
///
/// `timestamp` is mandatory for REQUEST and optional for REPLY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sender_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        WireMessage {
            kind: message.kind(),
            sender_id: message.sender(),
            timestamp: message.timestamp(),
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = CodecError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        match wire.kind {
            MessageKind::Request => {
                let timestamp = wire.timestamp.ok_or(CodecError::MissingTimestamp {
                    sender_id: wire.sender_id,
                })?;
                Ok(Message::Request {
                    sender_id: wire.sender_id,
                    timestamp,
                })
            }
            MessageKind::Reply => Ok(Message::Reply {
                sender_id: wire.sender_id,
                timestamp: wire.timestamp,
            }),
        }
    }
}

/// Frame encoding used by a [`Messenger`](super::messenger::Messenger).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// JSON text of a [`WireMessage`].
    #[default]
    Json,
    /// bincode of a [`Message`].
    Binary,
}

impl Codec {
    /// Encode a message into a frame.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(&WireMessage::from(*message))?),
            Codec::Binary => Ok(bincode::serialize(message)?),
        }
    }

    /// Decode a frame. Any failure means the frame is dropped.
    pub fn decode(&self, frame: &[u8]) -> Result<Message, CodecError> {
        match self {
            Codec::Json => serde_json::from_slice::<WireMessage>(frame)?.try_into(),
            Codec::Binary => Ok(bincode::deserialize(frame)?),
        }
    }
}
