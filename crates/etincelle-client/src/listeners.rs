//! Listener registry for push events.
//!
//! Callbacks are keyed by event kind plus a registry-issued id, so removal
//! targets exactly one registration and repeated reconnects can never
//! double-register anything: the registry survives the transport, and the
//! session manager re-binds the *dispatch*, never the listeners themselves.
//! Registration works in any session state — listeners added while
//! disconnected simply start firing once a connection is joined.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use etincelle_shared::protocol::PushEvent;

pub const EVENT_MESSAGE_DELIVERED: &str = "message-delivered";
pub const EVENT_MESSAGE_SENT: &str = "message-sent";
pub const EVENT_PRESENCE_CHANGED: &str = "presence-changed";
pub const EVENT_CONVERSATION_DELETED: &str = "conversation-deleted";

pub type Listener = Arc<dyn Fn(&PushEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<String, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one event kind. The returned id is the only
    /// way to remove it again.
    pub fn on(&self, kind: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock().expect("listener registry poisoned");
        listeners
            .entry(kind.to_string())
            .or_default()
            .push((id, listener));
        debug!(kind, id = id.0, "Listener registered");
        id
    }

    /// Remove one registration. Returns whether anything was removed.
    pub fn off(&self, kind: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().expect("listener registry poisoned");
        let Some(entries) = listeners.get_mut(kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        before != entries.len()
    }

    /// Invoke every listener registered for this event's kind.
    pub fn dispatch(&self, event: &PushEvent) {
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.lock().expect("listener registry poisoned");
            listeners
                .get(event.kind())
                .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn count(&self, kind: &str) -> usize {
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .get(kind)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}
