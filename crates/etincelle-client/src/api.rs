//! REST client for the relay.
//!
//! Everything network-shaped hides behind [`RelayApi`] so the cache and the
//! facade are testable against an in-crate fake. [`HttpRelayApi`] is the
//! real implementation; it decodes the server's typed error body back into
//! [`SendError`], so UI code switches on variants, never on strings.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use etincelle_shared::{
    ChatListEntry, ConversationKey, ErrorBody, Message, MessageBody, SendError, UserId,
};

#[async_trait]
pub trait RelayApi: Send + Sync {
    async fn send_message(
        &self,
        receiver: &UserId,
        body: &MessageBody,
    ) -> Result<Message, SendError>;

    async fn fetch_conversations(&self) -> Result<Vec<ChatListEntry>, SendError>;

    /// Page 0 is the newest page; higher pages walk backward in time.
    async fn fetch_page(
        &self,
        other: &UserId,
        page: u32,
    ) -> Result<(Vec<Message>, bool), SendError>;

    async fn mark_read(&self, other: &UserId) -> Result<(), SendError>;

    async fn delete_conversation(&self, key: &ConversationKey) -> Result<(), SendError>;

    async fn block(&self, other: &UserId, reason: Option<String>) -> Result<(), SendError>;

    async fn unblock(&self, other: &UserId) -> Result<(), SendError>;

    async fn unread_total(&self) -> Result<u32, SendError>;
}

pub struct HttpRelayApi {
    base_url: String,
    me: UserId,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct SendPayload<'a> {
    receiver: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_ref: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
}

#[derive(Serialize)]
struct BlockPayload<'a> {
    user: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

#[derive(serde::Deserialize)]
struct PageResponse {
    messages: Vec<Message>,
    has_more: bool,
}

#[derive(serde::Deserialize)]
struct UnreadTotalResponse {
    total: u32,
}

impl HttpRelayApi {
    pub fn new(base_url: impl Into<String>, me: UserId) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            me,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn transport_err(e: reqwest::Error) -> SendError {
        SendError::Transport(e.to_string())
    }

    /// Decode a response: success body as JSON, failure body as the typed
    /// error contract.
    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, SendError> {
        if response.status().is_success() {
            return response.json::<T>().await.map_err(Self::transport_err);
        }
        let status = response.status();
        match response.json::<ErrorBody>().await {
            Ok(body) => Err(body.into_send_error()),
            Err(_) => Err(SendError::Transport(format!("http status {status}"))),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, SendError> {
        let response = self
            .http
            .get(self.url(path))
            .header("x-user-id", self.me.as_str())
            .send()
            .await
            .map_err(Self::transport_err)?;
        Self::decode(response).await
    }
}

#[async_trait]
impl RelayApi for HttpRelayApi {
    async fn send_message(
        &self,
        receiver: &UserId,
        body: &MessageBody,
    ) -> Result<Message, SendError> {
        let payload = match body {
            MessageBody::Text { text } => SendPayload {
                receiver: receiver.as_str(),
                text: Some(text),
                image_ref: None,
                caption: None,
            },
            MessageBody::Image { image_ref, caption } => SendPayload {
                receiver: receiver.as_str(),
                text: None,
                image_ref: Some(image_ref),
                caption: caption.as_deref(),
            },
        };

        debug!(receiver = %receiver, "POST /messages");
        let response = self
            .http
            .post(self.url("/messages"))
            .header("x-user-id", self.me.as_str())
            .json(&payload)
            .send()
            .await
            .map_err(Self::transport_err)?;
        Self::decode(response).await
    }

    async fn fetch_conversations(&self) -> Result<Vec<ChatListEntry>, SendError> {
        self.get("/conversations").await
    }

    async fn fetch_page(
        &self,
        other: &UserId,
        page: u32,
    ) -> Result<(Vec<Message>, bool), SendError> {
        let page: PageResponse = self
            .get(&format!("/conversations/{other}/messages?page={page}"))
            .await?;
        Ok((page.messages, page.has_more))
    }

    async fn mark_read(&self, other: &UserId) -> Result<(), SendError> {
        let response = self
            .http
            .post(self.url(&format!("/conversations/{other}/read")))
            .header("x-user-id", self.me.as_str())
            .send()
            .await
            .map_err(Self::transport_err)?;
        Self::decode::<serde_json::Value>(response).await.map(|_| ())
    }

    async fn delete_conversation(&self, key: &ConversationKey) -> Result<(), SendError> {
        // The separator is percent-encoded so the key travels as one path
        // segment.
        let encoded = key.as_str().replace(':', "%3A");
        let response = self
            .http
            .delete(self.url(&format!("/conversations/{encoded}")))
            .header("x-user-id", self.me.as_str())
            .send()
            .await
            .map_err(Self::transport_err)?;
        Self::decode::<serde_json::Value>(response).await.map(|_| ())
    }

    async fn block(&self, other: &UserId, reason: Option<String>) -> Result<(), SendError> {
        let payload = BlockPayload {
            user: other.as_str(),
            reason: reason.as_deref(),
        };
        let response = self
            .http
            .post(self.url("/blocks"))
            .header("x-user-id", self.me.as_str())
            .json(&payload)
            .send()
            .await
            .map_err(Self::transport_err)?;
        Self::decode::<serde_json::Value>(response).await.map(|_| ())
    }

    async fn unblock(&self, other: &UserId) -> Result<(), SendError> {
        let response = self
            .http
            .delete(self.url(&format!("/blocks/{other}")))
            .header("x-user-id", self.me.as_str())
            .send()
            .await
            .map_err(Self::transport_err)?;
        Self::decode::<serde_json::Value>(response).await.map(|_| ())
    }

    async fn unread_total(&self) -> Result<u32, SendError> {
        let response: UnreadTotalResponse = self.get("/unread").await?;
        Ok(response.total)
    }
}
