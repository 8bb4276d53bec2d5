//! Storage contracts consumed by the relay core.
//!
//! Each trait covers one document family. Implementations must make every
//! method atomic with respect to concurrent calls touching the same key —
//! in particular [`SummaryStore::apply_send`], which is a read-modify-write
//! on the conversation row, and must never lose an unread increment under
//! two near-simultaneous sends into the same conversation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use etincelle_shared::{
    BlockRelationship, BlockStatus, ConversationKey, ConversationSummary, Message, UserId,
    UserRecord,
};

use crate::error::Result;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new message. Message ids are caller-generated; persist
    /// order within a conversation is the order delivery events fan out.
    async fn insert(&self, message: Message) -> Result<()>;

    /// One page of a conversation's history as seen by `viewer` (messages
    /// tombstoned for the viewer are excluded). Page 0 is the newest page;
    /// higher pages walk backward in time. Messages within a page are in
    /// chronological order. Returns `(messages, has_more)`.
    async fn conversation_page(
        &self,
        key: &ConversationKey,
        viewer: &UserId,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Message>, bool)>;

    /// Flip `read = true` on every message in the conversation addressed to
    /// `reader`. Idempotent. Returns how many messages changed.
    async fn mark_read(&self, key: &ConversationKey, reader: &UserId) -> Result<u32>;

    /// Tombstone the whole conversation for one participant. Existing
    /// messages gain `user` in `hidden_for`; future messages are unaffected.
    async fn hide_all(&self, key: &ConversationKey, user: &UserId) -> Result<u32>;

    /// Recount unread from the source of truth: messages addressed to
    /// `receiver` that are unread and not tombstoned for them.
    async fn unread_count(&self, key: &ConversationKey, receiver: &UserId) -> Result<u32>;
}

#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Upsert the conversation summary for a freshly persisted message:
    /// refresh preview and `last_message_at` (monotonically non-decreasing),
    /// increment the receiver's unread counter, zero the sender's. Atomic
    /// per conversation key.
    async fn apply_send(&self, message: &Message) -> Result<ConversationSummary>;

    /// Zero one participant's unread counter (read acknowledgment).
    async fn zero_unread(&self, key: &ConversationKey, reader: &UserId) -> Result<()>;

    /// Overwrite one participant's unread counter with a recounted value
    /// (the self-healing path).
    async fn set_unread(&self, key: &ConversationKey, user: &UserId, count: u32) -> Result<()>;

    async fn get(&self, key: &ConversationKey) -> Result<Option<ConversationSummary>>;

    /// All summaries `user` participates in, newest first, excluding
    /// conversations whose entire history is tombstoned for `user`.
    async fn list_for(&self, user: &UserId) -> Result<Vec<ConversationSummary>>;
}

#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Record a block. Returns `false` if the ordered pair already existed.
    async fn put(&self, block: BlockRelationship) -> Result<bool>;

    /// Remove a block. Only the original blocker's own record is removable.
    /// Returns `false` if no such block existed.
    async fn remove(&self, blocker: &UserId, blocked: &UserId) -> Result<bool>;

    /// Whether a block exists in either direction between the two users.
    async fn exists_either(&self, a: &UserId, b: &UserId) -> Result<bool>;

    /// Both directions, from `me`'s point of view, for UI labeling.
    async fn status(&self, me: &UserId, other: &UserId) -> Result<BlockStatus>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn upsert(&self, record: UserRecord) -> Result<()>;

    async fn get_user(&self, id: &UserId) -> Result<Option<UserRecord>>;

    /// Presence write-back from the registry, so REST polling observes the
    /// same online state the push channel broadcasts. Creates the record if
    /// it does not exist yet.
    async fn set_presence(
        &self,
        id: &UserId,
        online: bool,
        last_active: DateTime<Utc>,
    ) -> Result<()>;
}

/// The full store surface the relay server is wired against.
pub trait Store: MessageStore + SummaryStore + BlockStore + UserStore {}

impl<T: MessageStore + SummaryStore + BlockStore + UserStore> Store for T {}
