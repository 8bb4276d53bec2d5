//! Connection session manager.
//!
//! Owns the single logical push connection:
//! `Disconnected → Connecting → Joined → (Disconnected on drop) → …`
//!
//! Entering Joined *always* emits a `join` frame first — after every
//! reconnect, not just the first connect — because that is what restores
//! the server-side presence handle. Drops retry with bounded exponential
//! backoff; exhausting the attempt budget parks the manager in
//! Disconnected until the next external trigger (foreground, login).
//! Logout pushes an explicit `set-offline` before teardown so presence does
//! not have to wait for the server's heartbeat reaper.
//!
//! Event listeners live in the [`ListenerRegistry`], which survives the
//! transport: reconnects re-bind the dispatch loop, never the listeners,
//! so nothing is ever double-registered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use etincelle_shared::constants::{
    HEARTBEAT_INTERVAL_SECS, RECONNECT_BASE_DELAY_MS, RECONNECT_MAX_ATTEMPTS,
    RECONNECT_MAX_DELAY_MS,
};
use etincelle_shared::protocol::{self, ClientFrame};
use etincelle_shared::UserId;

use crate::listeners::{Listener, ListenerId, ListenerRegistry};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Joined,
}

/// Tunables for the reconnect loop. Defaults come from the shared
/// constants; tests shrink them.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            backoff_base: Duration::from_millis(RECONNECT_BASE_DELAY_MS),
            backoff_max: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
            max_attempts: RECONNECT_MAX_ATTEMPTS,
        }
    }
}

pub struct SessionManager {
    user: UserId,
    transport: Arc<dyn Transport>,
    listeners: Arc<ListenerRegistry>,
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    /// Live outgoing channel while Joined.
    frames: Mutex<Option<mpsc::Sender<ClientFrame>>>,
    /// Bumped by every external trigger; a run loop whose generation is
    /// stale stops instead of fighting its replacement.
    generation: AtomicU64,
}

impl SessionManager {
    pub fn new(
        user: UserId,
        transport: Arc<dyn Transport>,
        listeners: Arc<ListenerRegistry>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Arc::new(Self {
            user,
            transport,
            listeners,
            config,
            state_tx,
            frames: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// For UI code that renders a passive "reconnecting" indicator.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn on(&self, kind: &str, listener: Listener) -> ListenerId {
        self.listeners.on(kind, listener)
    }

    pub fn off(&self, kind: &str, id: ListenerId) -> bool {
        self.listeners.off(kind, id)
    }

    /// External trigger: app foreground or login. No-op while a session is
    /// already connecting or joined.
    pub fn connect(self: &Arc<Self>) {
        if self.state() != SessionState::Disconnected {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run(generation).await;
        });
    }

    /// Explicit logout: announce offline, then tear down. The run loop
    /// observes the stale generation and stops retrying.
    pub async fn logout(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(frames) = self.frames.lock().await.take() {
            if frames.send(ClientFrame::SetOffline).await.is_err() {
                debug!("Connection already gone at logout");
            }
        }
        self.set_state(SessionState::Disconnected);
        info!(user = %self.user, "Logged out");
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    fn stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_base
            .saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.config.backoff_max);
        // Jitter spreads reconnect stampedes after a relay restart.
        let jitter = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4 + 1);
        capped + Duration::from_millis(jitter)
    }

    async fn run(self: Arc<Self>, generation: u64) {
        loop {
            if self.stale(generation) {
                return;
            }
            self.set_state(SessionState::Connecting);

            // --- Bounded backoff connect ---
            let mut connection = None;
            for attempt in 0..self.config.max_attempts {
                if self.stale(generation) {
                    return;
                }
                match self.transport.connect().await {
                    Ok(conn) => {
                        connection = Some(conn);
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "Connect attempt failed");
                        if attempt + 1 < self.config.max_attempts {
                            tokio::time::sleep(self.backoff_delay(attempt)).await;
                        }
                    }
                }
            }
            let Some(mut connection) = connection else {
                // Retries exhausted: park until the next external trigger.
                warn!(user = %self.user, "Reconnect attempts exhausted");
                self.set_state(SessionState::Disconnected);
                return;
            };

            // --- Mandatory join on every (re)connect ---
            if connection
                .frames
                .send(ClientFrame::Join {
                    user: self.user.clone(),
                })
                .await
                .is_err()
            {
                // Died before joining; run another connect cycle.
                continue;
            }

            *self.frames.lock().await = Some(connection.frames.clone());
            self.set_state(SessionState::Joined);
            info!(user = %self.user, "Session joined");

            // --- Pump events and heartbeats until the connection drops ---
            let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            heartbeat.tick().await; // first tick fires immediately; skip it

            loop {
                tokio::select! {
                    raw = connection.events.recv() => {
                        match raw {
                            Some(raw) => match protocol::decode_event(&raw) {
                                Ok(event) => self.listeners.dispatch(&event),
                                Err(e) => {
                                    // Trust boundary: invalid frames never
                                    // reach the cache.
                                    warn!(error = %e, "Dropping invalid push event");
                                }
                            },
                            None => {
                                debug!("Push connection dropped");
                                break;
                            }
                        }
                    }
                    _ = heartbeat.tick() => {
                        if connection.frames.send(ClientFrame::Heartbeat).await.is_err() {
                            break;
                        }
                    }
                }
            }

            *self.frames.lock().await = None;
            self.set_state(SessionState::Disconnected);
            if self.stale(generation) {
                return;
            }
            // Detected drop: go around and reconnect.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::time::timeout;

    use crate::transport::TransportConnection;
    use etincelle_shared::protocol::PushEvent;
    use etincelle_shared::SendError;

    /// Test-side handles for one accepted connection.
    struct FakeConn {
        frames: mpsc::Receiver<ClientFrame>,
        events: mpsc::Sender<String>,
    }

    struct FakeTransport {
        /// Fail this many connects before accepting.
        fail_first: usize,
        connects: AtomicUsize,
        accepted: StdMutex<VecDeque<FakeConn>>,
    }

    impl FakeTransport {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                connects: AtomicUsize::new(0),
                accepted: StdMutex::new(VecDeque::new()),
            })
        }

        async fn take_conn(&self) -> FakeConn {
            for _ in 0..200 {
                if let Some(conn) = self.accepted.lock().unwrap().pop_front() {
                    return conn;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("no connection accepted in time");
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&self) -> Result<TransportConnection, SendError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(SendError::Transport("refused".into()));
            }
            let (frame_tx, frame_rx) = mpsc::channel(32);
            let (event_tx, event_rx) = mpsc::channel(32);
            self.accepted.lock().unwrap().push_back(FakeConn {
                frames: frame_rx,
                events: event_tx,
            });
            Ok(TransportConnection {
                frames: frame_tx,
                events: event_rx,
            })
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_secs(60),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            max_attempts: 3,
        }
    }

    fn manager(transport: Arc<FakeTransport>) -> Arc<SessionManager> {
        SessionManager::new(
            UserId::parse("alice").unwrap(),
            transport,
            Arc::new(ListenerRegistry::new()),
            test_config(),
        )
    }

    async fn expect_frame(conn: &mut FakeConn) -> ClientFrame {
        timeout(Duration::from_secs(2), conn.frames.recv())
            .await
            .expect("frame in time")
            .expect("channel open")
    }

    async fn wait_for_state(session: &SessionManager, expected: SessionState) {
        for _ in 0..200 {
            if session.state() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never reached {expected:?}");
    }

    #[tokio::test]
    async fn join_is_emitted_on_every_reconnect() {
        let transport = FakeTransport::new(0);
        let session = manager(transport.clone());

        session.connect();
        let mut first = transport.take_conn().await;
        assert_eq!(
            expect_frame(&mut first).await,
            ClientFrame::Join {
                user: UserId::parse("alice").unwrap()
            }
        );
        wait_for_state(&session, SessionState::Joined).await;

        // Simulate a transport drop; the manager must rejoin, not just
        // reconnect.
        drop(first);
        let mut second = transport.take_conn().await;
        assert_eq!(
            expect_frame(&mut second).await,
            ClientFrame::Join {
                user: UserId::parse("alice").unwrap()
            }
        );
        wait_for_state(&session, SessionState::Joined).await;
    }

    #[tokio::test]
    async fn listeners_fire_once_per_event_across_reconnects() {
        let transport = FakeTransport::new(0);
        let session = manager(transport.clone());

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        // Registered while Disconnected; must work after (re)connects
        // without double-firing.
        session.on(
            "presence-changed",
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        session.connect();
        let mut conn = transport.take_conn().await;
        expect_frame(&mut conn).await; // join

        let event = PushEvent::PresenceChanged {
            user: UserId::parse("bruno").unwrap(),
            online: true,
            last_active: Utc::now(),
        };
        let raw = protocol::encode_event(&event).unwrap();
        conn.events.send(raw.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Reconnect, then deliver once more: exactly one more hit.
        drop(conn);
        let mut conn = transport.take_conn().await;
        expect_frame(&mut conn).await; // join again
        conn.events.send(raw).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_events_are_dropped_before_dispatch() {
        let transport = FakeTransport::new(0);
        let session = manager(transport.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        session.on(
            "presence-changed",
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        session.connect();
        let mut conn = transport.take_conn().await;
        expect_frame(&mut conn).await;

        conn.events.send("not json".into()).await.unwrap();
        // Valid shape, wrong version: also rejected at the boundary.
        conn.events
            .send(r#"{"v":99,"event":{"kind":"presence-changed","user":"x","online":true,"last_active":"2026-01-01T00:00:00Z"}}"#.into())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        // The connection survived the garbage.
        assert_eq!(session.state(), SessionState::Joined);
    }

    #[tokio::test]
    async fn exhausted_retries_park_in_disconnected() {
        let transport = FakeTransport::new(usize::MAX);
        let session = manager(transport.clone());

        session.connect();
        for _ in 0..200 {
            if session.state() == SessionState::Disconnected
                && transport.connects.load(Ordering::SeqCst) >= 3
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);

        // No background retry loop keeps running.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);

        // The next external trigger starts a fresh cycle.
        session.connect();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(transport.connects.load(Ordering::SeqCst) > 3);
    }

    #[tokio::test]
    async fn logout_sends_set_offline_and_stops_reconnecting() {
        let transport = FakeTransport::new(0);
        let session = manager(transport.clone());

        session.connect();
        let mut conn = transport.take_conn().await;
        expect_frame(&mut conn).await; // join
        wait_for_state(&session, SessionState::Joined).await;

        session.logout().await;
        assert_eq!(expect_frame(&mut conn).await, ClientFrame::SetOffline);
        assert_eq!(session.state(), SessionState::Disconnected);

        // The dropped connection must not trigger a reconnect after logout.
        drop(conn);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn heartbeats_flow_while_joined() {
        let transport = FakeTransport::new(0);
        let session = SessionManager::new(
            UserId::parse("alice").unwrap(),
            transport.clone(),
            Arc::new(ListenerRegistry::new()),
            SessionConfig {
                heartbeat_interval: Duration::from_millis(10),
                ..test_config()
            },
        );

        session.connect();
        let mut conn = transport.take_conn().await;
        expect_frame(&mut conn).await; // join
        assert_eq!(expect_frame(&mut conn).await, ClientFrame::Heartbeat);
        assert_eq!(expect_frame(&mut conn).await, ClientFrame::Heartbeat);
    }
}
