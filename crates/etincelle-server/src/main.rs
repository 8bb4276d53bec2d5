//! # etincelle-server
//!
//! Relay server for the Étincelle messaging core.
//!
//! This binary provides:
//! - **REST API** (axum) for sends, history pages, read acknowledgments,
//!   conversation tombstoning, blocking, and unread badges
//! - **WebSocket push** fan-out of `message-delivered` / `message-sent` /
//!   `presence-changed` / `conversation-deleted` events
//! - **Presence registry** with multi-device handles, durable write-back,
//!   and a heartbeat reaper for silently dead connections
//! - **Per-caller rate limiting** to protect against abuse

mod api;
mod billing;
mod blocking;
mod collab;
mod config;
mod error;
mod presence;
mod rate_limit;
mod relay;
mod unread;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::billing::MemoryLedger;
use crate::blocking::BlockingGuard;
use crate::collab::{LogNotifier, StoreProfileDirectory};
use crate::config::ServerConfig;
use crate::presence::PresenceRegistry;
use crate::rate_limit::RateLimiter;
use crate::relay::MessageRelay;
use crate::unread::UnreadLedger;

use etincelle_store::MemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,etincelle_server=debug")),
        )
        .init();

    info!("Starting Étincelle relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store = Arc::new(MemoryStore::new());
    let presence = Arc::new(PresenceRegistry::new(store.clone()));
    let guard = Arc::new(BlockingGuard::new(store.clone()));
    let ledger = Arc::new(MemoryLedger::new(config.starting_balance));
    let relay = Arc::new(MessageRelay::new(
        store.clone(),
        presence.clone(),
        guard.clone(),
        ledger.clone(),
        Arc::new(LogNotifier),
    ));
    let unread = Arc::new(UnreadLedger::new(store.clone()));
    let profiles = Arc::new(StoreProfileDirectory::new(store.clone()));

    // Rate limiter: 10 req/s sustained, burst of 30
    let rate_limiter = RateLimiter::default();

    let config = Arc::new(config);
    let app_state = AppState {
        store,
        presence: presence.clone(),
        relay,
        unread,
        guard,
        ledger,
        profiles,
        rate_limiter: rate_limiter.clone(),
        config: config.clone(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Heartbeat reaper: a handle that dies without a clean disconnect keeps
    // its user online until this evicts it (bounded staleness).
    let reaper_presence = presence.clone();
    let handle_timeout = Duration::from_secs(config.handle_timeout_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(handle_timeout / 3);
        loop {
            interval.tick().await;
            match reaper_presence.reap_stale(handle_timeout).await {
                Ok(0) => {}
                Ok(reaped) => info!(reaped, "Reaped silent presence handles"),
                Err(e) => error!(error = %e, "Presence reaper failed"),
            }
        }
    });

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
