//! Presence registry.
//!
//! Tracks which users currently hold live push connections. A user may hold
//! several handles at once (phone + tablet); online flips on the first
//! handle and offline only when the count reaches zero. Every transition is
//! written back to the durable user record, so REST polling observes the
//! same state the push channel broadcasts, and is announced to all other
//! live connections — any open chat list may need to repaint a status dot.
//!
//! A handle that dies without a clean disconnect keeps its user online
//! until the heartbeat reaper evicts it: bounded staleness, not a bug.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use etincelle_shared::protocol::PushEvent;
use etincelle_shared::UserId;
use etincelle_store::{StoreError, UserStore};

/// One live push connection belonging to a user.
struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::Sender<PushEvent>,
    last_heartbeat: Instant,
}

/// In-memory registry of live connections, keyed by user.
pub struct PresenceRegistry {
    handles: DashMap<UserId, Vec<ConnectionHandle>>,
    /// Reverse index: connection id -> owning user.
    owners: DashMap<Uuid, UserId>,
    users: Arc<dyn UserStore>,
}

impl PresenceRegistry {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self {
            handles: DashMap::new(),
            owners: DashMap::new(),
            users,
        }
    }

    /// Register a handle for `user`. If it is the user's first live handle,
    /// mark them online durably and broadcast the change to everyone else.
    pub async fn join(
        &self,
        user: UserId,
        conn_id: Uuid,
        tx: mpsc::Sender<PushEvent>,
    ) -> Result<(), StoreError> {
        let was_first = {
            let mut entry = self.handles.entry(user.clone()).or_default();
            let was_first = entry.is_empty();
            // A rejoin with the same connection id replaces the old handle.
            entry.retain(|h| h.id != conn_id);
            entry.push(ConnectionHandle {
                id: conn_id,
                tx,
                last_heartbeat: Instant::now(),
            });
            was_first
        };
        self.owners.insert(conn_id, user.clone());

        debug!(user = %user, conn = %conn_id, first = was_first, "Presence handle joined");

        if was_first {
            let now = Utc::now();
            self.users.set_presence(&user, true, now).await?;
            info!(user = %user, "User online");
            self.broadcast_except(
                &user,
                PushEvent::PresenceChanged {
                    user: user.clone(),
                    online: true,
                    last_active: now,
                },
            );
        }
        Ok(())
    }

    /// Remove a handle. If it was the user's last one, mark them offline,
    /// stamp `last_active`, and broadcast the change.
    pub async fn leave(&self, conn_id: Uuid) -> Result<(), StoreError> {
        let Some((_, user)) = self.owners.remove(&conn_id) else {
            return Ok(());
        };

        let went_offline = {
            let mut empty = false;
            if let Some(mut entry) = self.handles.get_mut(&user) {
                entry.retain(|h| h.id != conn_id);
                empty = entry.is_empty();
            }
            if empty {
                self.handles.remove_if(&user, |_, handles| handles.is_empty());
            }
            empty
        };

        debug!(user = %user, conn = %conn_id, last = went_offline, "Presence handle left");

        if went_offline {
            let now = Utc::now();
            self.users.set_presence(&user, false, now).await?;
            info!(user = %user, "User offline");
            self.broadcast_except(
                &user,
                PushEvent::PresenceChanged {
                    user: user.clone(),
                    online: false,
                    last_active: now,
                },
            );
        }
        Ok(())
    }

    /// Refresh a handle's heartbeat deadline.
    pub fn touch(&self, conn_id: Uuid) {
        let Some(user) = self.owners.get(&conn_id).map(|u| u.clone()) else {
            return;
        };
        if let Some(mut entry) = self.handles.get_mut(&user) {
            if let Some(handle) = entry.iter_mut().find(|h| h.id == conn_id) {
                handle.last_heartbeat = Instant::now();
            }
        }
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.handles.get(user).map(|h| !h.is_empty()).unwrap_or(false)
    }

    /// Push an event to every handle of one user, in order, on each
    /// connection's single queue. Returns how many handles accepted it.
    /// A connection whose queue is full is skipped; its cache self-heals on
    /// the next full refetch.
    pub fn push_to(&self, user: &UserId, event: PushEvent) -> usize {
        let Some(entry) = self.handles.get(user) else {
            return 0;
        };
        let mut delivered = 0;
        for handle in entry.iter() {
            match handle.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(user = %user, conn = %handle.id, error = %e, "Push queue rejected event");
                }
            }
        }
        delivered
    }

    /// Broadcast to every live connection except those owned by `skip`.
    fn broadcast_except(&self, skip: &UserId, event: PushEvent) {
        for entry in self.handles.iter() {
            if entry.key() == skip {
                continue;
            }
            for handle in entry.value().iter() {
                if let Err(e) = handle.tx.try_send(event.clone()) {
                    warn!(conn = %handle.id, error = %e, "Broadcast queue rejected event");
                }
            }
        }
    }

    /// Evict handles silent for longer than `timeout`, treating each
    /// eviction as a `leave`. Returns how many handles were reaped.
    pub async fn reap_stale(&self, timeout: Duration) -> Result<usize, StoreError> {
        let now = Instant::now();
        let stale: Vec<Uuid> = self
            .handles
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|h| now.duration_since(h.last_heartbeat) > timeout)
                    .map(|h| h.id)
                    .collect::<Vec<_>>()
            })
            .collect();

        let count = stale.len();
        for conn_id in stale {
            warn!(conn = %conn_id, "Reaping silent presence handle");
            self.leave(conn_id).await?;
        }
        Ok(count)
    }
}
