//! Message relay — the only write path for messages.
//!
//! A send is validated, checked against the blocking guard, debited, then
//! persisted and fanned out. Validation, blocking, and balance rejections
//! happen before any persistence, so a rejected send is never partially
//! applied. Persist + summary upsert + fan-out run under a per-conversation
//! lock: delivery events leave in persist order on each connection's single
//! queue, and two near-simultaneous sends into one conversation cannot lose
//! an unread increment.
//!
//! Identical repeated sends are *not* deduplicated here — each is a new
//! message. Visual dedup is the client cache's optimistic-id
//! reconciliation, not the relay's job.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use etincelle_shared::protocol::PushEvent;
use etincelle_shared::{ConversationKey, Message, MessageBody, SendError, UserId};
use etincelle_store::Store;

use crate::billing::TokenLedger;
use crate::blocking::BlockingGuard;
use crate::collab::PushNotifier;
use crate::error::ServerError;
use crate::presence::PresenceRegistry;

pub struct MessageRelay {
    store: Arc<dyn Store>,
    presence: Arc<PresenceRegistry>,
    guard: Arc<BlockingGuard>,
    ledger: Arc<dyn TokenLedger>,
    notifier: Arc<dyn PushNotifier>,
    /// Serializes persist + summary + fan-out per conversation.
    conversation_locks: DashMap<ConversationKey, Arc<Mutex<()>>>,
}

impl MessageRelay {
    pub fn new(
        store: Arc<dyn Store>,
        presence: Arc<PresenceRegistry>,
        guard: Arc<BlockingGuard>,
        ledger: Arc<dyn TokenLedger>,
        notifier: Arc<dyn PushNotifier>,
    ) -> Self {
        Self {
            store,
            presence,
            guard,
            ledger,
            notifier,
            conversation_locks: DashMap::new(),
        }
    }

    fn conversation_lock(&self, key: &ConversationKey) -> Arc<Mutex<()>> {
        self.conversation_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Accept, persist, and fan out one message.
    pub async fn send(
        &self,
        sender: &UserId,
        receiver: &UserId,
        body: MessageBody,
    ) -> Result<Message, ServerError> {
        // 1. Validation — rejected before anything happens.
        if sender == receiver {
            return Err(SendError::Validation("cannot message yourself".into()).into());
        }
        body.validate().map_err(ServerError::Send)?;

        // 2. Blocking, either direction.
        if !self.guard.can_deliver(sender, receiver).await? {
            return Err(SendError::Blocked.into());
        }

        // 3. Atomic balance check + debit.
        let cost = body.cost();
        let balance = self
            .ledger
            .debit(sender, cost)
            .await
            .map_err(|e| SendError::insufficient(cost, e.balance))?;

        let key = ConversationKey::between(sender, receiver);
        let message = Message {
            id: Uuid::new_v4(),
            conversation: key.clone(),
            sender: sender.clone(),
            receiver: receiver.clone(),
            body,
            created_at: Utc::now(),
            read: false,
            hidden_for: vec![],
        };

        // 4-6. Persist, upsert the summary, fan out — serialized per
        // conversation so push order matches persist order.
        let lock = self.conversation_lock(&key);
        let delivered = {
            let _guard = lock.lock().await;

            self.store.insert(message.clone()).await?;
            self.store.apply_send(&message).await?;

            let delivered = self.presence.push_to(
                receiver,
                PushEvent::MessageDelivered {
                    message: message.clone(),
                },
            );
            // Echo to the sender's own other handles so a second open
            // device sees the message without re-fetching.
            self.presence.push_to(
                sender,
                PushEvent::MessageSent {
                    message: message.clone(),
                },
            );
            delivered
        };

        info!(
            id = %message.id,
            conversation = %key,
            sender = %sender,
            cost,
            balance,
            delivered,
            "Message relayed"
        );

        // 7. No live handle: hand off to the out-of-band notifier.
        // Fire-and-forget; the message is durable either way.
        if delivered == 0 {
            let notifier = self.notifier.clone();
            let receiver = receiver.clone();
            let title = sender.to_string();
            let preview = message.body.preview();
            tokio::spawn(async move {
                notifier.notify(&receiver, &title, &preview).await;
            });
        }

        Ok(message)
    }

    /// Tombstone a conversation for the caller only. History stays intact
    /// for the other participant; a new inbound message un-hides the
    /// thread.
    pub async fn delete_conversation(
        &self,
        caller: &UserId,
        key: &ConversationKey,
    ) -> Result<(), ServerError> {
        if !key.involves(caller) {
            return Err(SendError::Validation("not a participant of this conversation".into()).into());
        }
        if self.store.get(key).await?.is_none() {
            return Err(SendError::NotFound("conversation".into()).into());
        }

        let lock = self.conversation_lock(key);
        let _guard = lock.lock().await;

        let hidden = self.store.hide_all(key, caller).await?;
        // Hidden messages no longer count as unread for the caller.
        let recount = self.store.unread_count(key, caller).await?;
        self.store.set_unread(key, caller, recount).await?;

        debug!(caller = %caller, key = %key, hidden, "Conversation tombstoned");

        self.presence.push_to(
            caller,
            PushEvent::ConversationDeleted {
                key: key.clone(),
                hidden_for: caller.clone(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::billing::MemoryLedger;
    use etincelle_store::{MemoryStore, MessageStore, SummaryStore};

    struct CountingNotifier {
        count: AtomicUsize,
    }

    #[async_trait]
    impl PushNotifier for CountingNotifier {
        async fn notify(&self, _user: &UserId, _title: &str, _body: &str) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        relay: MessageRelay,
        store: Arc<MemoryStore>,
        presence: Arc<PresenceRegistry>,
        ledger: Arc<MemoryLedger>,
        guard: Arc<BlockingGuard>,
        notifications: Arc<CountingNotifier>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(PresenceRegistry::new(store.clone()));
        let guard = Arc::new(BlockingGuard::new(store.clone()));
        let ledger = Arc::new(MemoryLedger::new(0));
        let notifications = Arc::new(CountingNotifier {
            count: AtomicUsize::new(0),
        });
        let relay = MessageRelay::new(
            store.clone(),
            presence.clone(),
            guard.clone(),
            ledger.clone(),
            notifications.clone(),
        );
        Fixture {
            relay,
            store,
            presence,
            ledger,
            guard,
            notifications,
        }
    }

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn text(t: &str) -> MessageBody {
        MessageBody::Text { text: t.into() }
    }

    #[tokio::test]
    async fn balance_scenario_text_then_unaffordable_image() {
        let f = fixture();
        let (alice, bruno) = (uid("alice"), uid("bruno"));
        f.ledger.set_balance(&alice, 150).await;

        // Text costs 100: goes through, balance 50, unread 1 for bruno.
        f.relay.send(&alice, &bruno, text("salut")).await.unwrap();
        assert_eq!(f.ledger.balance(&alice).await, 50);
        let key = ConversationKey::between(&alice, &bruno);
        let summary = f.store.get(&key).await.unwrap().unwrap();
        assert_eq!(summary.unread_for(&bruno), 1);
        assert_eq!(summary.unread_for(&alice), 0);

        // Image costs 500: rejected with shortfall 450, balance untouched.
        let image = MessageBody::Image {
            image_ref: "blob-1".into(),
            caption: None,
        };
        match f.relay.send(&alice, &bruno, image).await {
            Err(ServerError::Send(SendError::InsufficientBalance {
                required,
                balance,
                shortfall,
            })) => {
                assert_eq!(required, 500);
                assert_eq!(balance, 50);
                assert_eq!(shortfall, 450);
            }
            other => panic!("expected insufficient balance, got {other:?}"),
        }
        assert_eq!(f.ledger.balance(&alice).await, 50);
        // Nothing new was persisted.
        let (messages, _) = f.store.conversation_page(&key, &bruno, 0, 50).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn self_send_and_empty_text_are_rejected_without_side_effects() {
        let f = fixture();
        let alice = uid("alice");
        f.ledger.set_balance(&alice, 1_000).await;

        assert!(f.relay.send(&alice, &alice, text("moi")).await.is_err());
        assert!(f.relay.send(&alice, &uid("bruno"), text("  ")).await.is_err());
        assert_eq!(f.ledger.balance(&alice).await, 1_000);
    }

    #[tokio::test]
    async fn blocked_send_is_rejected_before_debit_in_both_directions() {
        let f = fixture();
        let (alice, bruno) = (uid("alice"), uid("bruno"));
        f.ledger.set_balance(&alice, 1_000).await;
        f.ledger.set_balance(&bruno, 1_000).await;

        f.guard.block(&alice, &bruno, None).await.unwrap();

        for (from, to) in [(&alice, &bruno), (&bruno, &alice)] {
            match f.relay.send(from, to, text("hé")).await {
                Err(ServerError::Send(SendError::Blocked)) => {}
                other => panic!("expected blocked, got {other:?}"),
            }
        }
        assert_eq!(f.ledger.balance(&alice).await, 1_000);
        assert_eq!(f.ledger.balance(&bruno).await, 1_000);

        // Unblock by the original blocker restores delivery.
        f.guard.unblock(&alice, &bruno).await.unwrap();
        assert!(f.relay.send(&bruno, &alice, text("enfin")).await.is_ok());
    }

    #[tokio::test]
    async fn online_receiver_gets_delivery_push_within_the_send_call() {
        let f = fixture();
        let (alice, bruno) = (uid("alice"), uid("bruno"));
        f.ledger.set_balance(&alice, 1_000).await;

        let (tx, mut rx) = mpsc::channel(8);
        f.presence
            .join(bruno.clone(), Uuid::new_v4(), tx)
            .await
            .unwrap();

        let sent = f.relay.send(&alice, &bruno, text("salut")).await.unwrap();
        match rx.try_recv().unwrap() {
            PushEvent::MessageDelivered { message } => assert_eq!(message.id, sent.id),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(f.notifications.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn senders_other_handles_receive_the_echo() {
        let f = fixture();
        let (alice, bruno) = (uid("alice"), uid("bruno"));
        f.ledger.set_balance(&alice, 1_000).await;

        let (tx, mut rx) = mpsc::channel(8);
        f.presence
            .join(alice.clone(), Uuid::new_v4(), tx)
            .await
            .unwrap();

        let sent = f.relay.send(&alice, &bruno, text("salut")).await.unwrap();
        match rx.try_recv().unwrap() {
            PushEvent::MessageSent { message } => assert_eq!(message.id, sent.id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn offline_receiver_gets_no_push_and_messages_wait_unread() {
        let f = fixture();
        let (alice, bruno) = (uid("alice"), uid("bruno"));
        f.ledger.set_balance(&alice, 1_000).await;

        for i in 0..3 {
            f.relay
                .send(&alice, &bruno, text(&format!("m{i}")))
                .await
                .unwrap();
        }

        let key = ConversationKey::between(&alice, &bruno);
        let (messages, has_more) = f.store.conversation_page(&key, &bruno, 0, 50).await.unwrap();
        assert!(!has_more);
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| !m.read));
        // Chronological order within the page.
        assert!(messages.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        // The out-of-band notifier took over for each send.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(f.notifications.count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn concurrent_whole_balance_sends_allow_exactly_one() {
        let f = fixture();
        let f = Arc::new(f);
        let (alice, bruno) = (uid("alice"), uid("bruno"));
        f.ledger.set_balance(&alice, 100).await;

        let spawn_send = |f: Arc<Fixture>, from: UserId, to: UserId| {
            tokio::spawn(async move { f.relay.send(&from, &to, text("tout")).await })
        };
        let a = spawn_send(f.clone(), alice.clone(), bruno.clone());
        let b = spawn_send(f.clone(), alice.clone(), bruno.clone());

        let outcomes = [a.await.unwrap(), b.await.unwrap()];
        let successes = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert_eq!(f.ledger.balance(&alice).await, 0);

        let key = ConversationKey::between(&alice, &bruno);
        let (messages, _) = f.store.conversation_page(&key, &bruno, 0, 50).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn delete_tombstones_for_the_caller_only() {
        let f = fixture();
        let (alice, bruno) = (uid("alice"), uid("bruno"));
        f.ledger.set_balance(&alice, 1_000).await;
        f.ledger.set_balance(&bruno, 1_000).await;

        f.relay.send(&alice, &bruno, text("salut")).await.unwrap();
        let key = ConversationKey::between(&alice, &bruno);

        f.relay.delete_conversation(&alice, &key).await.unwrap();

        let (for_alice, _) = f.store.conversation_page(&key, &alice, 0, 50).await.unwrap();
        assert!(for_alice.is_empty());
        let (for_bruno, _) = f.store.conversation_page(&key, &bruno, 0, 50).await.unwrap();
        assert_eq!(for_bruno.len(), 1);

        // A new message from bruno un-hides the thread for alice.
        f.relay.send(&bruno, &alice, text("reviens")).await.unwrap();
        let (for_alice, _) = f.store.conversation_page(&key, &alice, 0, 50).await.unwrap();
        assert_eq!(for_alice.len(), 1);

        // A non-participant cannot tombstone someone else's thread.
        assert!(f.relay.delete_conversation(&uid("mallory"), &key).await.is_err());
    }
}
