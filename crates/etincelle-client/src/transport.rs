//! Push-connection transport.
//!
//! The session manager owns exactly one logical connection at a time and
//! talks to it through a channel pair: outgoing [`ClientFrame`]s in, raw
//! incoming text frames out. The trait seam keeps the state machine
//! unit-testable without a network; [`WsTransport`] is the real WebSocket
//! implementation.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use etincelle_shared::protocol::{self, ClientFrame};
use etincelle_shared::SendError;

/// One live connection. Dropping `frames` closes the connection; the
/// `events` receiver yielding `None` means the transport dropped.
pub struct TransportConnection {
    pub frames: mpsc::Sender<ClientFrame>,
    pub events: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<TransportConnection, SendError>;
}

/// WebSocket transport against the relay's `/ws` endpoint.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    /// `url` is the full ws(s):// endpoint, e.g. `wss://relay.example/ws`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<TransportConnection, SendError> {
        let (socket, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| SendError::Transport(format!("websocket connect: {e}")))?;
        debug!(url = %self.url, "WebSocket connected");

        let (mut sink, mut stream) = socket.split();
        let (frame_tx, mut frame_rx) = mpsc::channel::<ClientFrame>(32);
        let (event_tx, event_rx) = mpsc::channel::<String>(256);

        // Socket pump: one task owns both halves so outgoing frames and
        // incoming events stay on a single path per connection.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = frame_rx.recv() => {
                        let Some(frame) = frame else {
                            // Session dropped its sender: clean teardown.
                            let _ = sink.close().await;
                            break;
                        };
                        match protocol::encode_frame(&frame) {
                            Ok(raw) => {
                                if sink.send(WsMessage::Text(raw.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "Failed to encode client frame"),
                        }
                    }
                    incoming = stream.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Text(raw))) => {
                                if event_tx.send(raw.as_str().to_string()).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {} // binary frames are not part of the protocol
                            Some(Err(e)) => {
                                debug!(error = %e, "WebSocket error");
                                break;
                            }
                        }
                    }
                }
            }
            debug!("WebSocket pump ended");
            // event_tx drops here; the session manager sees the connection die.
        });

        Ok(TransportConnection {
            frames: frame_tx,
            events: event_rx,
        })
    }
}
