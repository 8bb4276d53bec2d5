use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    CONVERSATION_KEY_SEPARATOR, IMAGE_PREVIEW, IMAGE_SEND_COST, PREVIEW_MAX_LEN, TEXT_SEND_COST,
};
use crate::error::SendError;

// ---------------------------------------------------------------------------
// UserId
// ---------------------------------------------------------------------------

/// Opaque stable user identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
    /// Validate and wrap a raw id string.
    ///
    /// Rejects empty ids and ids containing the conversation-key separator;
    /// the latter would break injectivity of [`ConversationKey::between`].
    pub fn parse(raw: impl Into<String>) -> Result<Self, SendError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(SendError::Validation("user id must not be empty".into()));
        }
        if raw.contains(CONVERSATION_KEY_SEPARATOR) {
            return Err(SendError::Validation(format!(
                "user id must not contain '{CONVERSATION_KEY_SEPARATOR}'"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ConversationKey
// ---------------------------------------------------------------------------

/// Deterministic, order-independent identifier for a pair of participants.
///
/// Both sides derive it independently: `between(a, b) == between(b, a)`, and
/// distinct unordered pairs never collide (the separator cannot appear in a
/// validated [`UserId`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn between(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{lo}{CONVERSATION_KEY_SEPARATOR}{hi}"))
    }

    /// Validate a raw key received from the outside (path parameters, stored
    /// rows). Must be two non-empty, sorted halves around the separator.
    pub fn parse(raw: impl Into<String>) -> Result<Self, SendError> {
        let raw = raw.into();
        match raw.split_once(CONVERSATION_KEY_SEPARATOR) {
            Some((lo, hi))
                if !lo.is_empty()
                    && !hi.is_empty()
                    && lo <= hi
                    && !hi.contains(CONVERSATION_KEY_SEPARATOR) =>
            {
                Ok(Self(raw))
            }
            _ => Err(SendError::Validation("malformed conversation key".into())),
        }
    }

    /// The two participants, in the key's sorted order.
    pub fn participants(&self) -> (UserId, UserId) {
        let (lo, hi) = self
            .0
            .split_once(CONVERSATION_KEY_SEPARATOR)
            .unwrap_or((self.0.as_str(), ""));
        (UserId(lo.to_string()), UserId(hi.to_string()))
    }

    /// The participant that is not `me`, if `me` is part of this key.
    pub fn other(&self, me: &UserId) -> Option<UserId> {
        let (a, b) = self.participants();
        if &a == me {
            Some(b)
        } else if &b == me {
            Some(a)
        } else {
            None
        }
    }

    pub fn involves(&self, user: &UserId) -> bool {
        let (a, b) = self.participants();
        &a == user || &b == user
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Message content. Text and image sends have different diamond costs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageBody {
    Text { text: String },
    Image {
        /// Opaque reference to an already-uploaded image blob.
        image_ref: String,
        caption: Option<String>,
    },
}

impl MessageBody {
    /// Diamond cost of sending this body.
    pub fn cost(&self) -> u64 {
        match self {
            MessageBody::Text { .. } => TEXT_SEND_COST,
            MessageBody::Image { .. } => IMAGE_SEND_COST,
        }
    }

    /// Chat-list preview text, truncated to [`PREVIEW_MAX_LEN`] characters.
    pub fn preview(&self) -> String {
        let raw = match self {
            MessageBody::Text { text } => text.as_str(),
            MessageBody::Image { .. } => IMAGE_PREVIEW,
        };
        raw.chars().take(PREVIEW_MAX_LEN).collect()
    }

    pub fn validate(&self) -> Result<(), SendError> {
        match self {
            MessageBody::Text { text } => {
                if text.trim().is_empty() {
                    return Err(SendError::Validation("message text is empty".into()));
                }
                if text.chars().count() > crate::constants::MAX_MESSAGE_LEN {
                    return Err(SendError::Validation("message text too long".into()));
                }
            }
            MessageBody::Image { image_ref, .. } => {
                if image_ref.trim().is_empty() {
                    return Err(SendError::Validation("image reference is empty".into()));
                }
            }
        }
        Ok(())
    }
}

/// A single one-to-one message.
///
/// Immutable once created except for `read` (flipped in bulk by a read
/// acknowledgment) and `hidden_for` membership (per-user soft delete — the
/// message stays visible to the other participant).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation: ConversationKey,
    pub sender: UserId,
    pub receiver: UserId,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    /// Participants who have tombstoned this message for themselves.
    pub hidden_for: Vec<UserId>,
}

impl Message {
    pub fn is_hidden_for(&self, user: &UserId) -> bool {
        self.hidden_for.contains(user)
    }
}

// ---------------------------------------------------------------------------
// ConversationSummary
// ---------------------------------------------------------------------------

/// One row per unordered pair that has ever exchanged a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub key: ConversationKey,
    pub participant_a: UserId,
    pub participant_b: UserId,
    pub last_message_preview: String,
    /// Monotonically non-decreasing.
    pub last_message_at: DateTime<Utc>,
    /// Per-participant unread counter. Always >= 0 and, in durable storage,
    /// equal to the number of unread, not-hidden messages addressed to that
    /// participant; the chat-list fetch recomputes it from the messages
    /// rather than trusting a cached delta.
    pub unread: HashMap<UserId, u32>,
}

impl ConversationSummary {
    pub fn new(key: ConversationKey, last_message_at: DateTime<Utc>) -> Self {
        let (participant_a, participant_b) = key.participants();
        Self {
            key,
            participant_a,
            participant_b,
            last_message_preview: String::new(),
            last_message_at,
            unread: HashMap::new(),
        }
    }

    pub fn unread_for(&self, user: &UserId) -> u32 {
        self.unread.get(user).copied().unwrap_or(0)
    }

    pub fn other_participant(&self, me: &UserId) -> Option<UserId> {
        self.key.other(me)
    }
}

// ---------------------------------------------------------------------------
// BlockRelationship
// ---------------------------------------------------------------------------

/// A directional block. Unique per ordered `(blocker, blocked)` pair.
/// Delivery suppression is symmetric: a block in either direction halts
/// messaging both ways. Only the original blocker can remove it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockRelationship {
    pub blocker: UserId,
    pub blocked: UserId,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Both directions of a block relationship, for UI labeling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BlockStatus {
    pub blocked_by_me: bool,
    pub blocked_by_them: bool,
}

impl BlockStatus {
    pub fn any(&self) -> bool {
        self.blocked_by_me || self.blocked_by_them
    }
}

// ---------------------------------------------------------------------------
// UserRecord / presence
// ---------------------------------------------------------------------------

/// Durable user record. Display attributes decorate list views only; the
/// presence flags are written back by the registry so REST polling observes
/// the same state the push channel broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub display_name: Option<String>,
    pub avatar_ref: Option<String>,
    pub is_online: bool,
    pub last_active: DateTime<Utc>,
}

impl UserRecord {
    pub fn new(id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            display_name: None,
            avatar_ref: None,
            is_online: false,
            last_active: now,
        }
    }
}

/// What the wire carries when presence changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub user: UserId,
    pub online: bool,
    pub last_active: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Chat list wire shape
// ---------------------------------------------------------------------------

/// The counterpart of a conversation as the chat list renders it. Decorated
/// server-side with profile, live presence, and block labeling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerSummary {
    pub id: UserId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub online: bool,
    pub last_active: Option<DateTime<Utc>>,
    pub blocked: BlockStatus,
}

/// One chat-list row. Unread counts are recounted from the message store on
/// every fetch — this response is the self-healing path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatListEntry {
    pub key: ConversationKey,
    pub peer: PeerSummary,
    pub last_message_preview: String,
    pub last_message_at: DateTime<Utc>,
    pub unread: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    #[test]
    fn conversation_key_is_commutative() {
        let a = uid("alice");
        let b = uid("bruno");
        assert_eq!(ConversationKey::between(&a, &b), ConversationKey::between(&b, &a));
    }

    #[test]
    fn conversation_key_is_injective_for_distinct_pairs() {
        let a = uid("alice");
        let b = uid("bruno");
        let c = uid("chloe");
        assert_ne!(ConversationKey::between(&a, &b), ConversationKey::between(&a, &c));
        assert_ne!(ConversationKey::between(&a, &b), ConversationKey::between(&b, &c));
    }

    #[test]
    fn conversation_key_round_trips_participants() {
        let a = uid("alice");
        let b = uid("bruno");
        let key = ConversationKey::between(&b, &a);
        let (lo, hi) = key.participants();
        assert_eq!(lo, a);
        assert_eq!(hi, b);
        assert_eq!(key.other(&a), Some(b.clone()));
        assert_eq!(key.other(&b), Some(a));
        assert_eq!(key.other(&uid("mallory")), None);
    }

    #[test]
    fn conversation_key_parse_validates_shape() {
        let key = ConversationKey::between(&uid("alice"), &uid("bruno"));
        assert_eq!(ConversationKey::parse(key.as_str()).unwrap(), key);

        assert!(ConversationKey::parse("alice").is_err());
        assert!(ConversationKey::parse(":bruno").is_err());
        assert!(ConversationKey::parse("alice:").is_err());
        // Unsorted halves can never come out of `between`.
        assert!(ConversationKey::parse("bruno:alice").is_err());
        assert!(ConversationKey::parse("a:b:c").is_err());
    }

    #[test]
    fn user_id_rejects_separator_and_empty() {
        assert!(UserId::parse("").is_err());
        assert!(UserId::parse("   ").is_err());
        assert!(UserId::parse("a:b").is_err());
        assert!(UserId::parse("alice").is_ok());
    }

    #[test]
    fn body_costs_and_previews() {
        let text = MessageBody::Text { text: "salut".into() };
        assert_eq!(text.cost(), TEXT_SEND_COST);
        assert_eq!(text.preview(), "salut");

        let image = MessageBody::Image {
            image_ref: "blob-1".into(),
            caption: None,
        };
        assert_eq!(image.cost(), IMAGE_SEND_COST);
        assert_eq!(image.preview(), IMAGE_PREVIEW);

        let long = MessageBody::Text {
            text: "x".repeat(500),
        };
        assert_eq!(long.preview().chars().count(), PREVIEW_MAX_LEN);
    }

    #[test]
    fn body_validation() {
        assert!(MessageBody::Text { text: "  ".into() }.validate().is_err());
        assert!(MessageBody::Image {
            image_ref: "".into(),
            caption: None
        }
        .validate()
        .is_err());
        assert!(MessageBody::Text { text: "ok".into() }.validate().is_ok());
    }
}
