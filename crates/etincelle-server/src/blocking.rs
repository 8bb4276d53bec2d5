//! Blocking guard.
//!
//! Blocking is directional as a record but symmetric in effect: a block in
//! either direction halts messaging both ways. History is never deleted —
//! the guard only suppresses new delivery and feeds the UI relabeling.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use etincelle_shared::{BlockRelationship, BlockStatus, SendError, UserId};
use etincelle_store::BlockStore;

use crate::error::ServerError;

pub struct BlockingGuard {
    blocks: Arc<dyn BlockStore>,
}

impl BlockingGuard {
    pub fn new(blocks: Arc<dyn BlockStore>) -> Self {
        Self { blocks }
    }

    /// True iff no block exists in either direction. Consulted before relay
    /// and before list materialization.
    pub async fn can_deliver(&self, sender: &UserId, receiver: &UserId) -> Result<bool, ServerError> {
        Ok(!self.blocks.exists_either(sender, receiver).await?)
    }

    /// Both directions from `me`'s point of view, for UI labeling.
    pub async fn status(&self, me: &UserId, other: &UserId) -> Result<BlockStatus, ServerError> {
        Ok(self.blocks.status(me, other).await?)
    }

    /// Record a block. Self-blocks are rejected; re-blocking an already
    /// blocked user is a no-op.
    pub async fn block(
        &self,
        blocker: &UserId,
        blocked: &UserId,
        reason: Option<String>,
    ) -> Result<(), ServerError> {
        if blocker == blocked {
            return Err(SendError::Validation("cannot block yourself".into()).into());
        }
        let created = self
            .blocks
            .put(BlockRelationship {
                blocker: blocker.clone(),
                blocked: blocked.clone(),
                reason,
                created_at: Utc::now(),
            })
            .await?;
        if created {
            info!(blocker = %blocker, blocked = %blocked, "Block recorded");
        }
        Ok(())
    }

    /// Remove a block. Only the original blocker's record is removable; the
    /// blocked party calling this simply finds nothing to remove.
    pub async fn unblock(&self, blocker: &UserId, blocked: &UserId) -> Result<(), ServerError> {
        if !self.blocks.remove(blocker, blocked).await? {
            return Err(SendError::NotFound("no block to remove".into()).into());
        }
        info!(blocker = %blocker, blocked = %blocked, "Block removed");
        Ok(())
    }
}
