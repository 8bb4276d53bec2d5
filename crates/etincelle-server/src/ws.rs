//! WebSocket push endpoint.
//!
//! Each socket is one presence handle. The first frame must be `join`;
//! after that the connection settles into a single `tokio::select!` loop
//! forwarding queued push events out and handling heartbeat / set-offline
//! frames in. Leaving the loop for any reason — clean close, transport
//! error, explicit logout — releases the presence handle.

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use etincelle_shared::protocol::{self, ClientFrame, PushEvent};
use etincelle_shared::UserId;

use crate::api::AppState;

/// How long a fresh socket may stall before sending its `join` frame.
const JOIN_DEADLINE: Duration = Duration::from_secs(10);

/// Queued events per connection; a client that cannot drain this many is
/// skipped and self-heals on its next refetch.
const EVENT_QUEUE_DEPTH: usize = 256;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();

    // The join frame is mandatory on every connect, not just the first —
    // it is what restores this user's presence handle after a reconnect.
    let Some(user) = wait_for_join(&mut stream).await else {
        debug!(conn = %conn_id, "Socket closed before joining");
        return;
    };

    let (tx, mut rx) = mpsc::channel::<PushEvent>(EVENT_QUEUE_DEPTH);
    if let Err(e) = state.presence.join(user.clone(), conn_id, tx).await {
        error!(user = %user, error = %e, "Failed to register presence handle");
        return;
    }

    debug!(user = %user, conn = %conn_id, "Push connection joined");

    loop {
        tokio::select! {
            // --- Outgoing push events, in queue order ---
            event = rx.recv() => {
                let Some(event) = event else { break };
                match protocol::encode_event(&event) {
                    Ok(raw) => {
                        if sink.send(WsMessage::Text(raw)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to encode push event"),
                }
            }

            // --- Incoming client frames ---
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(raw))) => match protocol::decode_frame(&raw) {
                        Ok(ClientFrame::Heartbeat) => state.presence.touch(conn_id),
                        Ok(ClientFrame::Join { user: rejoin }) => {
                            // A duplicate join on a live socket is harmless
                            // for the same user, suspicious otherwise.
                            if rejoin == user {
                                state.presence.touch(conn_id);
                            } else {
                                warn!(conn = %conn_id, user = %user, rejoin = %rejoin,
                                    "Join for a different user on a live socket, closing");
                                break;
                            }
                        }
                        Ok(ClientFrame::SetOffline) => {
                            debug!(user = %user, "Explicit set-offline, closing handle");
                            break;
                        }
                        Err(e) => {
                            warn!(conn = %conn_id, error = %e, "Dropping invalid client frame");
                        }
                    },
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                        state.presence.touch(conn_id);
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames are not part of the protocol
                    Some(Err(e)) => {
                        debug!(conn = %conn_id, error = %e, "Socket error");
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = state.presence.leave(conn_id).await {
        error!(conn = %conn_id, error = %e, "Failed to release presence handle");
    }
    debug!(user = %user, conn = %conn_id, "Push connection closed");

    // Try to close the sink cleanly; the handle is already released.
    let _ = sink.close().await;
}

/// Read frames until a valid `join` arrives or the deadline passes.
async fn wait_for_join(stream: &mut SplitStream<WebSocket>) -> Option<UserId> {
    let deadline = tokio::time::sleep(JOIN_DEADLINE);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!("Socket never sent a join frame");
                return None;
            }
            incoming = stream.next() => {
                match incoming? {
                    Ok(WsMessage::Text(raw)) => match protocol::decode_frame(&raw) {
                        Ok(ClientFrame::Join { user }) => return Some(user),
                        Ok(other) => {
                            warn!(frame = ?other, "Expected join as the first frame");
                        }
                        Err(e) => {
                            warn!(error = %e, "Invalid frame before join");
                        }
                    },
                    Ok(WsMessage::Close(_)) => return None,
                    Ok(_) => {}
                    Err(_) => return None,
                }
            }
        }
    }
}
