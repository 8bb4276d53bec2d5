//! Push-channel wire protocol.
//!
//! Events cross a trust boundary, so the set of kinds is closed and every
//! frame carries a protocol version. Incoming frames are parsed and
//! validated here before anything is applied to a cache; unknown versions
//! and malformed payloads are rejected, never partially applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ConversationKey, Message, UserId};

/// Version stamped on every frame. Bumped on any payload shape change.
pub const PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unsupported protocol version {0} (expected {PROTOCOL_VERSION})")]
    UnsupportedVersion(u16),

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Events pushed server → client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PushEvent {
    /// A message addressed to this connection's user was persisted.
    MessageDelivered { message: Message },
    /// Echo of this user's own send, for their other open handles.
    MessageSent { message: Message },
    /// A user went online or offline.
    PresenceChanged {
        user: UserId,
        online: bool,
        last_active: DateTime<Utc>,
    },
    /// This user tombstoned a conversation on another device.
    ConversationDeleted {
        key: ConversationKey,
        hidden_for: UserId,
    },
}

impl PushEvent {
    /// The event's wire kind, used as the listener-registry key.
    pub fn kind(&self) -> &'static str {
        match self {
            PushEvent::MessageDelivered { .. } => "message-delivered",
            PushEvent::MessageSent { .. } => "message-sent",
            PushEvent::PresenceChanged { .. } => "presence-changed",
            PushEvent::ConversationDeleted { .. } => "conversation-deleted",
        }
    }
}

/// Frames sent client → server over the push connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Mandatory first frame after every (re)connect; restores the user's
    /// presence handle server-side.
    Join { user: UserId },
    /// Keeps the handle out of the reaper's reach.
    Heartbeat,
    /// Explicit logout; presence goes offline without waiting for a timeout.
    SetOffline,
}

#[derive(Debug, Serialize, Deserialize)]
struct EventEnvelope {
    v: u16,
    event: PushEvent,
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameEnvelope {
    v: u16,
    frame: ClientFrame,
}

pub fn encode_event(event: &PushEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(&EventEnvelope {
        v: PROTOCOL_VERSION,
        event: event.clone(),
    })
}

pub fn decode_event(raw: &str) -> Result<PushEvent, ProtocolError> {
    let envelope: EventEnvelope = serde_json::from_str(raw)?;
    if envelope.v != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(envelope.v));
    }
    Ok(envelope.event)
}

pub fn encode_frame(frame: &ClientFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(&FrameEnvelope {
        v: PROTOCOL_VERSION,
        frame: frame.clone(),
    })
}

pub fn decode_frame(raw: &str) -> Result<ClientFrame, ProtocolError> {
    let envelope: FrameEnvelope = serde_json::from_str(raw)?;
    if envelope.v != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(envelope.v));
    }
    Ok(envelope.frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageBody;
    use uuid::Uuid;

    fn sample_message() -> Message {
        let sender = UserId::parse("alice").unwrap();
        let receiver = UserId::parse("bruno").unwrap();
        Message {
            id: Uuid::new_v4(),
            conversation: ConversationKey::between(&sender, &receiver),
            sender,
            receiver,
            body: MessageBody::Text { text: "salut".into() },
            created_at: Utc::now(),
            read: false,
            hidden_for: vec![],
        }
    }

    #[test]
    fn event_round_trip() {
        let event = PushEvent::MessageDelivered {
            message: sample_message(),
        };
        let raw = encode_event(&event).unwrap();
        let decoded = decode_event(&raw).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn frame_round_trip() {
        let frame = ClientFrame::Join {
            user: UserId::parse("alice").unwrap(),
        };
        let raw = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&raw).unwrap(), frame);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let raw = r#"{"v":99,"frame":{"kind":"heartbeat"}}"#;
        match decode_frame(raw) {
            Err(ProtocolError::UnsupportedVersion(99)) => {}
            other => panic!("expected version rejection, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(decode_event("not json").is_err());
        // Right shape, unknown kind.
        let raw = r#"{"v":1,"event":{"kind":"mystery"}}"#;
        assert!(decode_event(raw).is_err());
    }

    #[test]
    fn kind_matches_wire_tag() {
        let event = PushEvent::PresenceChanged {
            user: UserId::parse("alice").unwrap(),
            online: true,
            last_active: Utc::now(),
        };
        let raw = encode_event(&event).unwrap();
        assert!(raw.contains(r#""kind":"presence-changed""#));
        assert_eq!(event.kind(), "presence-changed");
    }
}
