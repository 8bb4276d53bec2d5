//! In-memory reference implementation of the store contracts.
//!
//! Every conversation's messages and summary live behind one
//! `tokio::sync::Mutex`, so all mutations touching a conversation are
//! serialized per key: two near-simultaneous sends into the same
//! conversation cannot lose an unread increment, and insertion order is
//! exactly the order delivery events fan out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use async_trait::async_trait;
use etincelle_shared::{
    BlockRelationship, BlockStatus, ConversationKey, ConversationSummary, Message, UserId,
    UserRecord,
};

use crate::error::Result;
use crate::traits::{BlockStore, MessageStore, SummaryStore, UserStore};

#[derive(Default)]
struct ConversationSlot {
    /// Chronological (insertion == persist) order.
    messages: Vec<Message>,
    summary: Option<ConversationSummary>,
}

impl ConversationSlot {
    fn has_visible_messages(&self, user: &UserId) -> bool {
        self.messages.iter().any(|m| !m.is_hidden_for(user))
    }
}

/// DashMap-backed store honoring the per-document consistency contract.
#[derive(Default)]
pub struct MemoryStore {
    conversations: DashMap<ConversationKey, Arc<Mutex<ConversationSlot>>>,
    blocks: DashMap<(UserId, UserId), BlockRelationship>,
    users: DashMap<UserId, UserRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &ConversationKey) -> Arc<Mutex<ConversationSlot>> {
        self.conversations.entry(key.clone()).or_default().clone()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert(&self, message: Message) -> Result<()> {
        let slot = self.slot(&message.conversation);
        let mut slot = slot.lock().await;
        slot.messages.push(message);
        Ok(())
    }

    async fn conversation_page(
        &self,
        key: &ConversationKey,
        viewer: &UserId,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Message>, bool)> {
        let slot = self.slot(key);
        let slot = slot.lock().await;

        let visible: Vec<&Message> = slot
            .messages
            .iter()
            .filter(|m| !m.is_hidden_for(viewer))
            .collect();

        let page_size = page_size.max(1) as usize;
        let total = visible.len();
        let skip_from_end = page as usize * page_size;
        if skip_from_end >= total {
            return Ok((Vec::new(), false));
        }
        let end = total - skip_from_end;
        let begin = end.saturating_sub(page_size);
        let messages = visible[begin..end].iter().map(|m| (*m).clone()).collect();
        Ok((messages, begin > 0))
    }

    async fn mark_read(&self, key: &ConversationKey, reader: &UserId) -> Result<u32> {
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        let mut changed = 0;
        for message in &mut slot.messages {
            if &message.receiver == reader && !message.read {
                message.read = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn hide_all(&self, key: &ConversationKey, user: &UserId) -> Result<u32> {
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        let mut changed = 0;
        for message in &mut slot.messages {
            if !message.is_hidden_for(user) {
                message.hidden_for.push(user.clone());
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn unread_count(&self, key: &ConversationKey, receiver: &UserId) -> Result<u32> {
        let slot = self.slot(key);
        let slot = slot.lock().await;
        let count = slot
            .messages
            .iter()
            .filter(|m| &m.receiver == receiver && !m.read && !m.is_hidden_for(receiver))
            .count();
        Ok(count as u32)
    }
}

#[async_trait]
impl SummaryStore for MemoryStore {
    async fn apply_send(&self, message: &Message) -> Result<ConversationSummary> {
        let slot = self.slot(&message.conversation);
        let mut slot = slot.lock().await;

        let summary = slot.summary.get_or_insert_with(|| {
            ConversationSummary::new(message.conversation.clone(), message.created_at)
        });

        summary.last_message_preview = message.body.preview();
        // Monotonically non-decreasing even if a clock skews backward.
        if message.created_at > summary.last_message_at {
            summary.last_message_at = message.created_at;
        }
        *summary.unread.entry(message.receiver.clone()).or_insert(0) += 1;
        summary.unread.insert(message.sender.clone(), 0);

        Ok(summary.clone())
    }

    async fn zero_unread(&self, key: &ConversationKey, reader: &UserId) -> Result<()> {
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        if let Some(summary) = slot.summary.as_mut() {
            summary.unread.insert(reader.clone(), 0);
        }
        Ok(())
    }

    async fn set_unread(&self, key: &ConversationKey, user: &UserId, count: u32) -> Result<()> {
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        if let Some(summary) = slot.summary.as_mut() {
            summary.unread.insert(user.clone(), count);
        }
        Ok(())
    }

    async fn get(&self, key: &ConversationKey) -> Result<Option<ConversationSummary>> {
        let slot = self.slot(key);
        let slot = slot.lock().await;
        Ok(slot.summary.clone())
    }

    async fn list_for(&self, user: &UserId) -> Result<Vec<ConversationSummary>> {
        // Snapshot the slot handles first; shard locks are never held
        // across an await.
        let slots: Vec<Arc<Mutex<ConversationSlot>>> = self
            .conversations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut summaries = Vec::new();
        for slot in slots {
            let slot = slot.lock().await;
            let Some(summary) = slot.summary.as_ref() else {
                continue;
            };
            if !summary.key.involves(user) {
                continue;
            }
            // A fully tombstoned conversation stays hidden until the other
            // participant sends something new.
            if !slot.has_visible_messages(user) {
                continue;
            }
            summaries.push(summary.clone());
        }
        summaries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(summaries)
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn put(&self, block: BlockRelationship) -> Result<bool> {
        let key = (block.blocker.clone(), block.blocked.clone());
        match self.blocks.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(block);
                Ok(true)
            }
        }
    }

    async fn remove(&self, blocker: &UserId, blocked: &UserId) -> Result<bool> {
        Ok(self
            .blocks
            .remove(&(blocker.clone(), blocked.clone()))
            .is_some())
    }

    async fn exists_either(&self, a: &UserId, b: &UserId) -> Result<bool> {
        Ok(self.blocks.contains_key(&(a.clone(), b.clone()))
            || self.blocks.contains_key(&(b.clone(), a.clone())))
    }

    async fn status(&self, me: &UserId, other: &UserId) -> Result<BlockStatus> {
        Ok(BlockStatus {
            blocked_by_me: self.blocks.contains_key(&(me.clone(), other.clone())),
            blocked_by_them: self.blocks.contains_key(&(other.clone(), me.clone())),
        })
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn upsert(&self, record: UserRecord) -> Result<()> {
        self.users.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<UserRecord>> {
        Ok(self.users.get(id).map(|r| r.clone()))
    }

    async fn set_presence(
        &self,
        id: &UserId,
        online: bool,
        last_active: DateTime<Utc>,
    ) -> Result<()> {
        let mut record = self
            .users
            .entry(id.clone())
            .or_insert_with(|| UserRecord::new(id.clone(), last_active));
        record.is_online = online;
        record.last_active = last_active;
        Ok(())
    }
}
