//! # etincelle-client
//!
//! Device-side core for the Étincelle messaging app: the client
//! synchronization cache, the connection session manager, and the REST/
//! WebSocket plumbing that ties them to the relay. No UI — the app shell
//! consumes [`EtincelleClient`] and renders from the cache accessors.

pub mod api;
pub mod cache;
pub mod listeners;
pub mod session;
pub mod transport;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};
use tracing_subscriber::{fmt, EnvFilter};

use etincelle_shared::constants::READ_ACK_TIMEOUT_MS;
use etincelle_shared::protocol::PushEvent;
use etincelle_shared::{ConversationKey, Message, MessageBody, SendError, UserId};

use crate::api::{HttpRelayApi, RelayApi};
use crate::cache::ChatCache;
use crate::listeners::{
    ListenerRegistry, EVENT_CONVERSATION_DELETED, EVENT_MESSAGE_DELIVERED, EVENT_MESSAGE_SENT,
    EVENT_PRESENCE_CHANGED,
};
use crate::session::{SessionConfig, SessionManager, SessionState};
use crate::transport::{Transport, WsTransport};

/// Initialize tracing for the client process (respects RUST_LOG).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("etincelle_client=debug,warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// A failed send, rolled back. `draft` is the typed content restored for
/// the input field; an `InsufficientBalance` error additionally carries the
/// shortfall for the purchase prompt.
#[derive(Debug)]
pub struct SendFailure {
    pub error: SendError,
    pub draft: Option<MessageBody>,
}

impl std::fmt::Display for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for SendFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Facade over the device-side core. All cache mutations funnel through
/// here or through the push-event wiring installed at construction.
pub struct EtincelleClient {
    me: UserId,
    api: Arc<dyn RelayApi>,
    cache: Arc<Mutex<ChatCache>>,
    session: Arc<SessionManager>,
    read_ack_timeout: Duration,
}

impl EtincelleClient {
    /// Production wiring: HTTP API plus WebSocket transport.
    pub fn new(base_url: &str, ws_url: &str, me: UserId) -> Arc<Self> {
        let api = Arc::new(HttpRelayApi::new(base_url, me.clone()));
        let transport = Arc::new(WsTransport::new(ws_url));
        Self::with_parts(
            me,
            api,
            transport,
            SessionConfig::default(),
            Duration::from_millis(READ_ACK_TIMEOUT_MS),
        )
    }

    /// Dependency-injected wiring, used by tests and alternative shells.
    pub fn with_parts(
        me: UserId,
        api: Arc<dyn RelayApi>,
        transport: Arc<dyn Transport>,
        session_config: SessionConfig,
        read_ack_timeout: Duration,
    ) -> Arc<Self> {
        let listeners = Arc::new(ListenerRegistry::new());
        let session = SessionManager::new(me.clone(), transport, listeners.clone(), session_config);
        let cache = Arc::new(Mutex::new(ChatCache::new(me.clone())));

        // Push events feed the cache through one funnel.
        for kind in [
            EVENT_MESSAGE_DELIVERED,
            EVENT_MESSAGE_SENT,
            EVENT_PRESENCE_CHANGED,
            EVENT_CONVERSATION_DELETED,
        ] {
            let cache = cache.clone();
            listeners.on(
                kind,
                Arc::new(move |event| {
                    cache.lock().expect("cache poisoned").apply_event(event);
                }),
            );
        }

        Arc::new(Self {
            me,
            api,
            cache,
            session,
            read_ack_timeout,
        })
    }

    pub fn me(&self) -> &UserId {
        &self.me
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// External trigger: login or app foreground.
    pub fn connect(&self) {
        self.session.connect();
    }

    pub async fn logout(&self) {
        self.session.logout().await;
    }

    pub fn connection_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    pub async fn send_text(
        &self,
        receiver: &UserId,
        text: impl Into<String>,
    ) -> Result<Message, SendFailure> {
        self.send(receiver, MessageBody::Text { text: text.into() })
            .await
    }

    pub async fn send_image(
        &self,
        receiver: &UserId,
        image_ref: impl Into<String>,
        caption: Option<String>,
    ) -> Result<Message, SendFailure> {
        self.send(
            receiver,
            MessageBody::Image {
                image_ref: image_ref.into(),
                caption,
            },
        )
        .await
    }

    /// Optimistic send: the placeholder lands in the cache before the
    /// network call; the REST response (or failure) reconciles it.
    async fn send(&self, receiver: &UserId, body: MessageBody) -> Result<Message, SendFailure> {
        let key = ConversationKey::between(&self.me, receiver);
        let local_id = self
            .cache
            .lock()
            .expect("cache poisoned")
            .begin_send(receiver, body.clone());

        match self.api.send_message(receiver, &body).await {
            Ok(message) => {
                self.cache
                    .lock()
                    .expect("cache poisoned")
                    .confirm_send(message.clone());
                Ok(message)
            }
            Err(error) => {
                let draft = self
                    .cache
                    .lock()
                    .expect("cache poisoned")
                    .fail_send(&key, &local_id);
                warn!(receiver = %receiver, error = %error, "Send failed, rolled back");
                Err(SendFailure { error, draft })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Fetching / refreshing
    // -----------------------------------------------------------------------

    /// Authoritative chat-list refetch: recounted unread values overwrite
    /// the fast-path mirror.
    pub async fn refresh_conversations(&self) -> Result<(), SendError> {
        let entries = self.api.fetch_conversations().await?;
        self.cache
            .lock()
            .expect("cache poisoned")
            .replace_chat_list(entries);
        Ok(())
    }

    /// Load page 0 of a conversation into the window.
    pub async fn open_conversation(&self, other: &UserId) -> Result<(), SendError> {
        let (messages, has_more) = self.api.fetch_page(other, 0).await?;
        let key = ConversationKey::between(&self.me, other);
        self.cache
            .lock()
            .expect("cache poisoned")
            .replace_window(&key, messages, has_more);
        Ok(())
    }

    /// Load the next older page, if any. Returns whether a page was loaded.
    pub async fn load_older(&self, other: &UserId) -> Result<bool, SendError> {
        let key = ConversationKey::between(&self.me, other);
        let next_page = {
            let cache = self.cache.lock().expect("cache poisoned");
            match cache.window(&key) {
                Some(window) if window.has_more => window.next_older_page,
                _ => return Ok(false),
            }
        };

        let (messages, has_more) = self.api.fetch_page(other, next_page).await?;
        self.cache
            .lock()
            .expect("cache poisoned")
            .extend_older(&key, messages, has_more);
        Ok(true)
    }

    /// Acknowledge a conversation as read. The local mirror zeroes
    /// immediately; the server call runs under a short hard timeout and is
    /// abandoned — not retried — on expiry, since the durable state heals
    /// on the next full refetch anyway.
    pub async fn mark_read(&self, other: &UserId) {
        let key = ConversationKey::between(&self.me, other);
        self.cache
            .lock()
            .expect("cache poisoned")
            .mark_read_local(&key);

        match tokio::time::timeout(self.read_ack_timeout, self.api.mark_read(other)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(other = %other, error = %e, "Read acknowledgment failed"),
            Err(_) => debug!(other = %other, "Read acknowledgment timed out, abandoned"),
        }
    }

    pub async fn delete_conversation(&self, other: &UserId) -> Result<(), SendError> {
        let key = ConversationKey::between(&self.me, other);
        self.api.delete_conversation(&key).await?;
        // Same cleanup the push event would perform on another device.
        self.cache
            .lock()
            .expect("cache poisoned")
            .apply_event(&PushEvent::ConversationDeleted {
                key,
                hidden_for: self.me.clone(),
            });
        Ok(())
    }

    pub async fn block(&self, other: &UserId, reason: Option<String>) -> Result<(), SendError> {
        self.api.block(other, reason).await
    }

    pub async fn unblock(&self, other: &UserId) -> Result<(), SendError> {
        self.api.unblock(other).await
    }

    // -----------------------------------------------------------------------
    // Cache reads
    // -----------------------------------------------------------------------

    /// Read a snapshot out of the cache. Screens call this; they never hold
    /// references into the cache across awaits.
    pub fn with_cache<R>(&self, f: impl FnOnce(&ChatCache) -> R) -> R {
        f(&self.cache.lock().expect("cache poisoned"))
    }

    /// App-wide unread badge, from the local mirror.
    pub fn badge_total(&self) -> u32 {
        self.with_cache(|cache| cache.total_unread())
    }
}
