use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method},
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use etincelle_shared::{
    ChatListEntry, ConversationKey, Message, MessageBody, PeerSummary, SendError, UserId,
};
use etincelle_store::Store;

use crate::billing::TokenLedger;
use crate::blocking::BlockingGuard;
use crate::collab::{Profile, ProfileDirectory};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::presence::PresenceRegistry;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::relay::MessageRelay;
use crate::unread::UnreadLedger;
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub presence: Arc<PresenceRegistry>,
    pub relay: Arc<MessageRelay>,
    pub unread: Arc<UnreadLedger>,
    pub guard: Arc<BlockingGuard>,
    pub ledger: Arc<dyn TokenLedger>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/messages", post(send_message))
        .route("/conversations", get(list_conversations))
        .route("/conversations/:peer/messages", get(conversation_page))
        .route("/conversations/:peer/read", post(mark_read))
        .route("/conversations/:peer", delete(delete_conversation))
        .route("/blocks", post(block_user))
        .route("/blocks/:other", delete(unblock_user))
        .route("/unread", get(unread_total))
        .route("/balance", get(balance))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Caller identity. Authentication itself is an upstream concern; by the
/// time a request reaches the relay the gateway has put the verified id in
/// this header.
fn caller(headers: &HeaderMap) -> Result<UserId, ServerError> {
    let raw = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    UserId::parse(raw)
        .map_err(|_| SendError::Validation("missing or invalid x-user-id header".into()).into())
}

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    page_size: u32,
}

#[derive(Deserialize)]
struct SendRequest {
    receiver: String,
    text: Option<String>,
    image_ref: Option<String>,
    caption: Option<String>,
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<u32>,
}

#[derive(Serialize)]
struct PageResponse {
    messages: Vec<Message>,
    has_more: bool,
}

#[derive(Deserialize)]
struct BlockRequest {
    user: String,
    reason: Option<String>,
}

#[derive(Serialize)]
struct UnreadTotalResponse {
    total: u32,
}

#[derive(Serialize)]
struct BalanceResponse {
    balance: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        page_size: state.config.page_size,
    })
}

async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SendRequest>,
) -> Result<Json<Message>, ServerError> {
    let sender = caller(&headers)?;
    let receiver = UserId::parse(req.receiver).map_err(ServerError::Send)?;

    let body = match (req.text, req.image_ref) {
        (Some(text), None) => MessageBody::Text { text },
        (None, Some(image_ref)) => MessageBody::Image {
            image_ref,
            caption: req.caption,
        },
        _ => {
            return Err(
                SendError::Validation("exactly one of text or image_ref is required".into()).into(),
            )
        }
    };

    let message = state.relay.send(&sender, &receiver, body).await?;
    Ok(Json(message))
}

async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatListEntry>>, ServerError> {
    let me = caller(&headers)?;

    let summaries = state.unread.healed_list(&me).await?;
    let mut entries = Vec::with_capacity(summaries.len());
    for summary in summaries {
        let Some(other) = summary.other_participant(&me) else {
            continue;
        };
        let blocked = state.guard.status(&me, &other).await?;
        // A blocked counterpart is relabeled, not removed; history stays.
        let profile = if blocked.blocked_by_me {
            Profile {
                display_name: "Profil bloqué".to_string(),
                avatar_ref: None,
            }
        } else {
            state.profiles.profile(&other).await
        };
        let last_active = state
            .store
            .get_user(&other)
            .await?
            .map(|record| record.last_active);

        entries.push(ChatListEntry {
            unread: summary.unread_for(&me),
            key: summary.key,
            peer: PeerSummary {
                online: state.presence.is_online(&other),
                id: other,
                display_name: profile.display_name,
                avatar_ref: profile.avatar_ref,
                last_active,
                blocked,
            },
            last_message_preview: summary.last_message_preview,
            last_message_at: summary.last_message_at,
        });
    }
    Ok(Json(entries))
}

async fn conversation_page(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(other): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<PageResponse>, ServerError> {
    let me = caller(&headers)?;
    let other = UserId::parse(other).map_err(ServerError::Send)?;
    let key = ConversationKey::between(&me, &other);

    let (messages, has_more) = state
        .store
        .conversation_page(&key, &me, query.page.unwrap_or(0), state.config.page_size)
        .await?;
    Ok(Json(PageResponse { messages, has_more }))
}

async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(other): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let me = caller(&headers)?;
    let other = UserId::parse(other).map_err(ServerError::Send)?;
    let key = ConversationKey::between(&me, &other);

    state.unread.mark_read(&me, &key).await?;
    Ok(Json(serde_json::json!({ "read": true })))
}

/// Accepts either a full conversation key (contains the separator, possibly
/// percent-encoded) or the other participant's id; both name the same
/// conversation since the key derivation is deterministic.
async fn delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(target): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let me = caller(&headers)?;
    let key = match ConversationKey::parse(target.clone()) {
        Ok(key) => key,
        Err(_) => {
            let other = UserId::parse(target).map_err(ServerError::Send)?;
            ConversationKey::between(&me, &other)
        }
    };

    state.relay.delete_conversation(&me, &key).await?;
    info!(caller = %me, key = %key, "Conversation deleted (tombstoned)");
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn block_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BlockRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let me = caller(&headers)?;
    let other = UserId::parse(req.user).map_err(ServerError::Send)?;

    state.guard.block(&me, &other, req.reason).await?;
    Ok(Json(serde_json::json!({ "blocked": true })))
}

async fn unblock_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(other): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let me = caller(&headers)?;
    let other = UserId::parse(other).map_err(ServerError::Send)?;

    state.guard.unblock(&me, &other).await?;
    Ok(Json(serde_json::json!({ "blocked": false })))
}

async fn unread_total(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UnreadTotalResponse>, ServerError> {
    let me = caller(&headers)?;
    let total = state.unread.total(&me).await?;
    Ok(Json(UnreadTotalResponse { total }))
}

async fn balance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BalanceResponse>, ServerError> {
    let me = caller(&headers)?;
    Ok(Json(BalanceResponse {
        balance: state.ledger.balance(&me).await,
    }))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::MemoryLedger;
    use crate::collab::{LogNotifier, StoreProfileDirectory};
    use etincelle_store::MemoryStore;
    use tower::ServiceExt;

    fn app_state() -> AppState {
        let config = Arc::new(ServerConfig::default());
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
        AppState {
            store,
            presence,
            relay,
            unread,
            guard,
            ledger,
            profiles,
            rate_limiter: RateLimiter::default(),
            config,
        }
    }

    #[tokio::test]
    async fn router_builds_and_serves_health() {
        let app = build_router(app_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn send_and_fetch_round_trip_over_http() {
        let app = build_router(app_state());

        let send = axum::http::Request::builder()
            .method("POST")
            .uri("/messages")
            .header("content-type", "application/json")
            .header("x-user-id", "alice")
            .body(axum::body::Body::from(
                serde_json::json!({ "receiver": "bruno", "text": "salut" }).to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(send).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let fetch = axum::http::Request::builder()
            .uri("/conversations/alice/messages")
            .header("x-user-id", "bruno")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(fetch).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let page: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(page["messages"].as_array().unwrap().len(), 1);
        assert_eq!(page["has_more"], false);
    }

    #[tokio::test]
    async fn missing_identity_header_is_a_validation_error() {
        let app = build_router(app_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/conversations")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
