//! Client synchronization cache.
//!
//! Single-owner, in-memory mirror of everything the chat screens render:
//! the chat list, per-conversation message windows, the presence map, and
//! the unread map. Screens only read through accessors and every mutation
//! funnels through these methods — a mediator, not ambient global state.
//!
//! Optimistic sends are a write-ahead log: each pending action gets a
//! locally-unique id, and confirmation replaces the *oldest* pending entry
//! from this sender (FIFO), never matching by content — duplicate text is
//! legal. Push-event unread increments are a fast path only; the
//! authoritative counts arrive with every full chat-list refetch.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::debug;

use etincelle_shared::constants::MESSAGE_WINDOW_CAP;
use etincelle_shared::protocol::PushEvent;
use etincelle_shared::{
    BlockStatus, ChatListEntry, ConversationKey, Message, MessageBody, PeerSummary,
    PresenceSnapshot, UserId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    /// Optimistic placeholder, not yet acknowledged by the relay.
    Pending,
    Confirmed,
}

/// One row of a conversation window: either a server-confirmed message or
/// an optimistic placeholder awaiting reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    /// Server uuid string, or the `local-<n>` placeholder id.
    pub id: String,
    pub sender: UserId,
    pub receiver: UserId,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub delivery: DeliveryState,
}

impl CachedMessage {
    fn confirmed(message: Message) -> Self {
        Self {
            id: message.id.to_string(),
            sender: message.sender,
            receiver: message.receiver,
            body: message.body,
            created_at: message.created_at,
            read: message.read,
            delivery: DeliveryState::Confirmed,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery == DeliveryState::Pending
    }
}

/// In-memory window over one conversation's history. Pages prepend older
/// messages; the cap evicts from the oldest end.
#[derive(Debug, Default)]
pub struct MessageWindow {
    messages: VecDeque<CachedMessage>,
    pub has_more: bool,
    /// Next *older* page to request from the relay.
    pub next_older_page: u32,
}

impl MessageWindow {
    pub fn messages(&self) -> impl Iterator<Item = &CachedMessage> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn contains_id(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    fn evict_to(&mut self, cap: usize) {
        while self.messages.len() > cap {
            let evicted = self.messages.pop_front();
            if let Some(evicted) = evicted {
                debug!(id = %evicted.id, "Window cap reached, evicting oldest");
            }
        }
    }
}

pub struct ChatCache {
    me: UserId,
    chat_list: Vec<ChatListEntry>,
    windows: HashMap<ConversationKey, MessageWindow>,
    presence: HashMap<UserId, PresenceSnapshot>,
    unread: HashMap<ConversationKey, u32>,
    pending_seq: u64,
    window_cap: usize,
}

impl ChatCache {
    pub fn new(me: UserId) -> Self {
        Self::with_window_cap(me, MESSAGE_WINDOW_CAP)
    }

    pub fn with_window_cap(me: UserId, window_cap: usize) -> Self {
        Self {
            me,
            chat_list: Vec::new(),
            windows: HashMap::new(),
            presence: HashMap::new(),
            unread: HashMap::new(),
            pending_seq: 0,
            window_cap,
        }
    }

    // -----------------------------------------------------------------------
    // Optimistic send log
    // -----------------------------------------------------------------------

    /// Append an optimistic placeholder before the network call, so the UI
    /// never stalls on the relay round-trip. Returns the placeholder id.
    pub fn begin_send(&mut self, receiver: &UserId, body: MessageBody) -> String {
        let local_id = format!("local-{}", self.pending_seq);
        self.pending_seq += 1;

        let key = ConversationKey::between(&self.me, receiver);
        let now = Utc::now();
        let preview = body.preview();

        let window = self.windows.entry(key.clone()).or_default();
        window.messages.push_back(CachedMessage {
            id: local_id.clone(),
            sender: self.me.clone(),
            receiver: receiver.clone(),
            body,
            created_at: now,
            read: false,
            delivery: DeliveryState::Pending,
        });
        window.evict_to(self.window_cap);

        // A sender's own send always clears their own badge for the thread.
        self.unread.insert(key.clone(), 0);
        self.upsert_chat_entry(&key, receiver, preview, now, Some(0));

        debug!(id = %local_id, key = %key, "Optimistic placeholder appended");
        local_id
    }

    /// Reconcile a server-confirmed message against the pending log: the
    /// oldest placeholder from this sender is replaced in place. Matching is
    /// positional (FIFO), never by content. A confirmation that finds no
    /// placeholder (another device's send, or a replay) appends instead,
    /// deduplicated by server id.
    pub fn confirm_send(&mut self, message: Message) {
        let key = message.conversation.clone();
        let server_id = message.id.to_string();
        let preview = message.body.preview();
        let at = message.created_at;
        let other = message.receiver.clone();

        let window = self.windows.entry(key.clone()).or_default();
        if window.contains_id(&server_id) {
            return;
        }

        let confirmed = CachedMessage::confirmed(message);
        let oldest_pending = window
            .messages
            .iter()
            .position(|m| m.is_pending() && m.sender == confirmed.sender);
        match oldest_pending {
            Some(index) => {
                debug!(local = %window.messages[index].id, server = %server_id, "Placeholder reconciled");
                window.messages[index] = confirmed;
            }
            None => {
                window.messages.push_back(confirmed);
                window.evict_to(self.window_cap);
            }
        }

        self.unread.insert(key.clone(), 0);
        self.upsert_chat_entry(&key, &other, preview, at, Some(0));
    }

    /// Roll back a failed send. Returns the placeholder's body so the UI
    /// can restore the typed text into the input.
    pub fn fail_send(&mut self, key: &ConversationKey, local_id: &str) -> Option<MessageBody> {
        let (removed_body, tail) = {
            let window = self.windows.get_mut(key)?;
            let index = window
                .messages
                .iter()
                .position(|m| m.is_pending() && m.id == local_id)?;
            let removed = window.messages.remove(index)?;
            let tail = window
                .messages
                .back()
                .map(|last| (last.body.preview(), last.created_at));
            (removed.body, tail)
        };

        // The preview may have been showing the failed text; fall back to
        // whatever is left (the list self-heals fully on the next refetch).
        match tail {
            Some((preview, at)) => {
                if let Some(entry) = self.chat_list.iter_mut().find(|e| &e.key == key) {
                    entry.last_message_preview = preview;
                    entry.last_message_at = at;
                }
                self.sort_chat_list();
            }
            None => {
                self.chat_list.retain(|e| &e.key != key);
            }
        }

        debug!(id = %local_id, key = %key, "Placeholder rolled back");
        Some(removed_body)
    }

    // -----------------------------------------------------------------------
    // Push event application
    // -----------------------------------------------------------------------

    /// Apply one validated push event. Events for conversations the cache
    /// does not hold update the chat list without needing a full refetch.
    pub fn apply_event(&mut self, event: &PushEvent) {
        match event {
            PushEvent::MessageDelivered { message } => {
                if message.receiver != self.me {
                    return;
                }
                self.apply_delivered(message.clone());
            }
            PushEvent::MessageSent { message } => {
                if message.sender != self.me {
                    return;
                }
                self.confirm_send(message.clone());
            }
            PushEvent::PresenceChanged {
                user,
                online,
                last_active,
            } => {
                // Only the presence map; screens read through it.
                self.presence.insert(
                    user.clone(),
                    PresenceSnapshot {
                        user: user.clone(),
                        online: *online,
                        last_active: *last_active,
                    },
                );
            }
            PushEvent::ConversationDeleted { key, hidden_for } => {
                if hidden_for != &self.me {
                    return;
                }
                self.windows.remove(key);
                self.unread.remove(key);
                self.chat_list.retain(|e| &e.key != key);
            }
        }
    }

    fn apply_delivered(&mut self, message: Message) {
        let key = message.conversation.clone();
        let sender = message.sender.clone();
        let preview = message.body.preview();
        let at = message.created_at;
        let server_id = message.id.to_string();

        // Append to the window if one is loaded; a reconnect replay of the
        // same id is dropped.
        if let Some(window) = self.windows.get_mut(&key) {
            if window.contains_id(&server_id) {
                return;
            }
            window.messages.push_back(CachedMessage::confirmed(message));
            window.evict_to(self.window_cap);
        }

        // Fast-path unread bump; the refetch recount is authoritative.
        let unread = self.unread.entry(key.clone()).or_insert(0);
        *unread += 1;
        let unread = *unread;
        self.upsert_chat_entry(&key, &sender, preview, at, Some(unread));
    }

    // -----------------------------------------------------------------------
    // Authoritative refetch paths
    // -----------------------------------------------------------------------

    /// Replace the chat list with a server response. Rebuilds the unread
    /// mirror from the recounted values and folds peer presence into the
    /// presence map.
    pub fn replace_chat_list(&mut self, entries: Vec<ChatListEntry>) {
        self.unread = entries.iter().map(|e| (e.key.clone(), e.unread)).collect();
        for entry in &entries {
            self.presence.insert(
                entry.peer.id.clone(),
                PresenceSnapshot {
                    user: entry.peer.id.clone(),
                    online: entry.peer.online,
                    last_active: entry.peer.last_active.unwrap_or_else(Utc::now),
                },
            );
        }
        self.chat_list = entries;
        self.sort_chat_list();
    }

    /// Replace a conversation's window with a fresh page 0. Pending
    /// placeholders survive the refetch — they are still in flight.
    pub fn replace_window(&mut self, key: &ConversationKey, messages: Vec<Message>, has_more: bool) {
        let old = self.windows.remove(key).unwrap_or_default();
        let mut window = MessageWindow {
            messages: messages.into_iter().map(CachedMessage::confirmed).collect(),
            has_more,
            next_older_page: 1,
        };
        for pending in old.messages.into_iter().filter(CachedMessage::is_pending) {
            window.messages.push_back(pending);
        }
        window.evict_to(self.window_cap);
        self.windows.insert(key.clone(), window);
    }

    /// Prepend one older page. `messages` is chronological, as served by
    /// the relay. The cap still evicts from the oldest end.
    pub fn extend_older(&mut self, key: &ConversationKey, messages: Vec<Message>, has_more: bool) {
        let window = self.windows.entry(key.clone()).or_default();
        for message in messages.into_iter().rev() {
            let id = message.id.to_string();
            if !window.contains_id(&id) {
                window.messages.push_front(CachedMessage::confirmed(message));
            }
        }
        window.has_more = has_more;
        window.next_older_page += 1;
        window.evict_to(self.window_cap);
    }

    /// Local mirror of a read acknowledgment.
    pub fn mark_read_local(&mut self, key: &ConversationKey) {
        self.unread.insert(key.clone(), 0);
        if let Some(entry) = self.chat_list.iter_mut().find(|e| &e.key == key) {
            entry.unread = 0;
        }
        if let Some(window) = self.windows.get_mut(key) {
            for message in &mut window.messages {
                if message.receiver == self.me {
                    message.read = true;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Read accessors
    // -----------------------------------------------------------------------

    pub fn chat_list(&self) -> &[ChatListEntry] {
        &self.chat_list
    }

    pub fn window(&self, key: &ConversationKey) -> Option<&MessageWindow> {
        self.windows.get(key)
    }

    /// Presence read-through; never cached by callers.
    pub fn is_online(&self, user: &UserId) -> bool {
        self.presence.get(user).map(|p| p.online).unwrap_or(false)
    }

    pub fn last_seen(&self, user: &UserId) -> Option<DateTime<Utc>> {
        self.presence.get(user).map(|p| p.last_active)
    }

    pub fn unread_for(&self, key: &ConversationKey) -> u32 {
        self.unread.get(key).copied().unwrap_or(0)
    }

    /// App-wide badge mirror.
    pub fn total_unread(&self) -> u32 {
        self.unread.values().sum()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn upsert_chat_entry(
        &mut self,
        key: &ConversationKey,
        peer: &UserId,
        preview: String,
        at: DateTime<Utc>,
        unread: Option<u32>,
    ) {
        match self.chat_list.iter().position(|e| &e.key == key) {
            Some(index) => {
                let entry = &mut self.chat_list[index];
                entry.last_message_preview = preview;
                if at > entry.last_message_at {
                    entry.last_message_at = at;
                }
                if let Some(unread) = unread {
                    entry.unread = unread;
                }
            }
            None => {
                // Placeholder decoration until the next list refetch brings
                // the profile.
                let online = self.is_online(peer);
                let last_active = self.last_seen(peer);
                self.chat_list.push(ChatListEntry {
                    key: key.clone(),
                    peer: PeerSummary {
                        id: peer.clone(),
                        display_name: peer.as_str().to_string(),
                        avatar_ref: None,
                        online,
                        last_active,
                        blocked: BlockStatus::default(),
                    },
                    last_message_preview: preview,
                    last_message_at: at,
                    unread: unread.unwrap_or(0),
                });
            }
        }
        self.sort_chat_list();
    }

    fn sort_chat_list(&mut self) {
        self.chat_list
            .sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn text(t: &str) -> MessageBody {
        MessageBody::Text { text: t.into() }
    }

    fn server_message(sender: &UserId, receiver: &UserId, t: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation: ConversationKey::between(sender, receiver),
            sender: sender.clone(),
            receiver: receiver.clone(),
            body: text(t),
            created_at: Utc::now(),
            read: false,
            hidden_for: vec![],
        }
    }

    fn cache() -> (ChatCache, UserId, UserId, ConversationKey) {
        let me = uid("alice");
        let other = uid("bruno");
        let key = ConversationKey::between(&me, &other);
        (ChatCache::new(me.clone()), me, other, key)
    }

    #[test]
    fn optimistic_placeholder_appears_before_any_network_activity() {
        let (mut cache, _, bruno, key) = cache();

        let local_id = cache.begin_send(&bruno, text("salut"));
        let window = cache.window(&key).unwrap();
        assert_eq!(window.len(), 1);
        let entry = window.messages().next().unwrap();
        assert_eq!(entry.id, local_id);
        assert!(entry.is_pending());

        // The chat list preview updated too, with my own badge at zero.
        assert_eq!(cache.chat_list().len(), 1);
        assert_eq!(cache.chat_list()[0].last_message_preview, "salut");
        assert_eq!(cache.unread_for(&key), 0);
    }

    #[test]
    fn reconciliation_is_fifo_even_with_duplicate_text() {
        let (mut cache, me, bruno, key) = cache();

        let first = cache.begin_send(&bruno, text("hi"));
        let second = cache.begin_send(&bruno, text("hi"));

        let confirmed = server_message(&me, &bruno, "hi");
        cache.confirm_send(confirmed.clone());

        let window = cache.window(&key).unwrap();
        let rows: Vec<&CachedMessage> = window.messages().collect();
        assert_eq!(rows.len(), 2);
        // The OLDEST placeholder was replaced, not the newest.
        assert_eq!(rows[0].id, confirmed.id.to_string());
        assert!(!rows[0].is_pending());
        assert_eq!(rows[1].id, second);
        assert!(rows[1].is_pending());
        assert_ne!(rows[1].id, first);
    }

    #[test]
    fn confirmation_replay_is_deduplicated_by_server_id() {
        let (mut cache, me, bruno, key) = cache();

        cache.begin_send(&bruno, text("salut"));
        let confirmed = server_message(&me, &bruno, "salut");
        cache.confirm_send(confirmed.clone());
        // The same ack again (REST response + message-sent echo).
        cache.confirm_send(confirmed);

        assert_eq!(cache.window(&key).unwrap().len(), 1);
    }

    #[test]
    fn failed_send_rolls_back_and_returns_the_draft() {
        let (mut cache, _, bruno, key) = cache();

        let local_id = cache.begin_send(&bruno, text("brouillon"));
        let restored = cache.fail_send(&key, &local_id).unwrap();
        assert_eq!(restored, text("brouillon"));

        assert!(cache.window(&key).unwrap().is_empty());
        // Nothing else ever happened in this thread: the list entry is gone.
        assert!(cache.chat_list().is_empty());
    }

    #[test]
    fn delivered_event_updates_list_without_a_loaded_window() {
        let (mut cache, me, bruno, key) = cache();

        let incoming = server_message(&bruno, &me, "coucou");
        cache.apply_event(&PushEvent::MessageDelivered { message: incoming });

        assert_eq!(cache.chat_list().len(), 1);
        assert_eq!(cache.chat_list()[0].last_message_preview, "coucou");
        assert_eq!(cache.unread_for(&key), 1);
        assert_eq!(cache.total_unread(), 1);
        // No window was created as a side effect.
        assert!(cache.window(&key).is_none());
    }

    #[test]
    fn delivered_event_appends_to_a_loaded_window_and_dedups_replays() {
        let (mut cache, me, bruno, key) = cache();
        cache.replace_window(&key, vec![], false);

        let incoming = server_message(&bruno, &me, "coucou");
        cache.apply_event(&PushEvent::MessageDelivered {
            message: incoming.clone(),
        });
        // Reconnect replay of the same event.
        cache.apply_event(&PushEvent::MessageDelivered { message: incoming });

        assert_eq!(cache.window(&key).unwrap().len(), 1);
        assert_eq!(cache.unread_for(&key), 1);
    }

    #[test]
    fn presence_event_touches_only_the_presence_map() {
        let (mut cache, me, bruno, key) = cache();

        // Seed a chat list entry via a delivered message.
        let incoming = server_message(&bruno, &me, "coucou");
        cache.apply_event(&PushEvent::MessageDelivered { message: incoming });
        assert!(!cache.chat_list()[0].peer.online);

        cache.apply_event(&PushEvent::PresenceChanged {
            user: bruno.clone(),
            online: true,
            last_active: Utc::now(),
        });

        // Read-through sees the change; the stale list snapshot does not.
        assert!(cache.is_online(&bruno));
        assert!(!cache.chat_list()[0].peer.online);
        assert_eq!(cache.unread_for(&key), 1);
    }

    #[test]
    fn conversation_deleted_clears_local_state() {
        let (mut cache, me, bruno, key) = cache();
        let incoming = server_message(&bruno, &me, "coucou");
        cache.replace_window(&key, vec![incoming.clone()], false);
        cache.apply_event(&PushEvent::MessageDelivered { message: incoming });

        cache.apply_event(&PushEvent::ConversationDeleted {
            key: key.clone(),
            hidden_for: me.clone(),
        });

        assert!(cache.window(&key).is_none());
        assert!(cache.chat_list().is_empty());
        assert_eq!(cache.unread_for(&key), 0);

        // Someone else's tombstone is not ours to apply.
        cache.apply_event(&PushEvent::ConversationDeleted {
            key,
            hidden_for: bruno,
        });
    }

    #[test]
    fn older_pages_prepend_and_the_cap_evicts_from_the_oldest_end() {
        let me = uid("alice");
        let bruno = uid("bruno");
        let key = ConversationKey::between(&me, &bruno);
        let mut cache = ChatCache::with_window_cap(me.clone(), 5);

        let newest: Vec<Message> = (0..3)
            .map(|i| server_message(&bruno, &me, &format!("new{i}")))
            .collect();
        cache.replace_window(&key, newest, true);
        assert_eq!(cache.window(&key).unwrap().next_older_page, 1);

        let older: Vec<Message> = (0..4)
            .map(|i| server_message(&bruno, &me, &format!("old{i}")))
            .collect();
        cache.extend_older(&key, older, false);

        let window = cache.window(&key).unwrap();
        // 7 loaded, cap 5: the two oldest were evicted.
        assert_eq!(window.len(), 5);
        assert!(!window.has_more);
        assert_eq!(window.next_older_page, 2);
        let first_text = match &window.messages().next().unwrap().body {
            MessageBody::Text { text } => text.clone(),
            _ => unreachable!(),
        };
        assert_eq!(first_text, "old2");
    }

    #[test]
    fn window_refetch_preserves_in_flight_placeholders() {
        let (mut cache, me, bruno, key) = cache();

        let local_id = cache.begin_send(&bruno, text("en vol"));
        let history = vec![server_message(&bruno, &me, "avant")];
        cache.replace_window(&key, history, false);

        let window = cache.window(&key).unwrap();
        assert_eq!(window.len(), 2);
        let last = window.messages().last().unwrap();
        assert_eq!(last.id, local_id);
        assert!(last.is_pending());
    }

    #[test]
    fn replace_chat_list_rebuilds_unread_and_presence() {
        let (mut cache, me, bruno, key) = cache();

        // Drifted fast-path counter.
        for _ in 0..3 {
            let incoming = server_message(&bruno, &me, "spam");
            cache.apply_event(&PushEvent::MessageDelivered { message: incoming });
        }
        assert_eq!(cache.unread_for(&key), 3);

        let entries = vec![ChatListEntry {
            key: key.clone(),
            peer: PeerSummary {
                id: bruno.clone(),
                display_name: "Bruno".into(),
                avatar_ref: None,
                online: true,
                last_active: Some(Utc::now()),
                blocked: BlockStatus::default(),
            },
            last_message_preview: "spam".into(),
            last_message_at: Utc::now(),
            unread: 1,
        }];
        cache.replace_chat_list(entries);

        assert_eq!(cache.unread_for(&key), 1);
        assert_eq!(cache.total_unread(), 1);
        assert!(cache.is_online(&bruno));
    }

    #[test]
    fn mark_read_local_zeroes_the_mirror() {
        let (mut cache, me, bruno, key) = cache();
        let incoming = server_message(&bruno, &me, "coucou");
        cache.replace_window(&key, vec![incoming.clone()], false);
        cache.apply_event(&PushEvent::MessageDelivered { message: incoming });

        cache.mark_read_local(&key);
        assert_eq!(cache.unread_for(&key), 0);
        assert_eq!(cache.chat_list()[0].unread, 0);
        assert!(cache.window(&key).unwrap().messages().all(|m| m.read));
    }
}
