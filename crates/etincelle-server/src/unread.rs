//! Unread counter ledger.
//!
//! The summary row carries a cached per-participant unread counter that the
//! relay increments on the fast path. That cache can drift if a push event
//! is lost, so the counter recomputed from the message store is the
//! authoritative value: every full chat-list fetch recounts and heals the
//! cached number instead of trusting it.

use std::sync::Arc;

use tracing::debug;

use etincelle_shared::{ConversationKey, ConversationSummary, UserId};
use etincelle_store::Store;

use crate::error::ServerError;

pub struct UnreadLedger {
    store: Arc<dyn Store>,
}

impl UnreadLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Read acknowledgment: zero the cached counter and flip `read = true`
    /// on every message in the conversation addressed to the reader.
    /// Idempotent — acknowledging twice yields the same zero state.
    pub async fn mark_read(
        &self,
        reader: &UserId,
        key: &ConversationKey,
    ) -> Result<(), ServerError> {
        let changed = self.store.mark_read(key, reader).await?;
        self.store.zero_unread(key, reader).await?;
        debug!(reader = %reader, key = %key, changed, "Conversation acknowledged");
        Ok(())
    }

    /// Recount one conversation's unread from the source of truth and heal
    /// the cached counter.
    pub async fn recount(
        &self,
        reader: &UserId,
        key: &ConversationKey,
    ) -> Result<u32, ServerError> {
        let count = self.store.unread_count(key, reader).await?;
        self.store.set_unread(key, reader, count).await?;
        Ok(count)
    }

    /// The reader's chat list with every unread counter recounted. This is
    /// the self-healing path list views are served from.
    pub async fn healed_list(
        &self,
        reader: &UserId,
    ) -> Result<Vec<ConversationSummary>, ServerError> {
        let mut summaries = self.store.list_for(reader).await?;
        for summary in &mut summaries {
            let count = self.recount(reader, &summary.key).await?;
            summary.unread.insert(reader.clone(), count);
        }
        Ok(summaries)
    }

    /// App-wide badge: unread summed across every conversation the reader
    /// participates in, recounted from source.
    pub async fn total(&self, reader: &UserId) -> Result<u32, ServerError> {
        let mut total = 0;
        for summary in self.store.list_for(reader).await? {
            total += self.store.unread_count(&summary.key, reader).await?;
        }
        Ok(total)
    }
}
