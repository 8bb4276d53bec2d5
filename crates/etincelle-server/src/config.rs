//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the relay can start with zero
//! configuration for local development.

use std::net::SocketAddr;

use etincelle_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_PAGE_SIZE, HANDLE_TIMEOUT_SECS};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Human-readable name for this relay instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Étincelle Relay"`
    pub instance_name: String,

    /// Seconds a presence handle may stay silent before the reaper evicts
    /// it. Until eviction the user is shown online — bounded staleness.
    /// Env: `HANDLE_TIMEOUT_SECS`
    /// Default: `90`
    pub handle_timeout_secs: u64,

    /// Messages per history page.
    /// Env: `PAGE_SIZE`
    /// Default: `50`
    pub page_size: u32,

    /// Diamonds credited to an account the first time the ledger sees it.
    /// Development convenience; the production token/billing collaborator
    /// replaces the in-memory ledger entirely.
    /// Env: `STARTING_BALANCE`
    /// Default: `1000`
    pub starting_balance: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            instance_name: "Étincelle Relay".to_string(),
            handle_timeout_secs: HANDLE_TIMEOUT_SECS,
            page_size: DEFAULT_PAGE_SIZE,
            starting_balance: 1_000,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(name) = std::env::var("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Ok(val) = std::env::var("HANDLE_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.handle_timeout_secs = secs,
                _ => {
                    tracing::warn!(value = %val, "Invalid HANDLE_TIMEOUT_SECS, using default");
                }
            }
        }

        if let Ok(val) = std::env::var("PAGE_SIZE") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.page_size = n,
                _ => tracing::warn!(value = %val, "Invalid PAGE_SIZE, using default"),
            }
        }

        if let Ok(val) = std::env::var("STARTING_BALANCE") {
            match val.parse::<u64>() {
                Ok(n) => config.starting_balance = n,
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid STARTING_BALANCE, using default");
                }
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}
