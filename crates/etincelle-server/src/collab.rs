//! External collaborator contracts: out-of-band notification sender and the
//! identity/profile directory.
//!
//! Both are fire-and-forget from the core's point of view. Notification
//! failures are logged, never surfaced to the sender; a missing profile
//! degrades to a placeholder instead of blocking delivery.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use etincelle_shared::UserId;
use etincelle_store::UserStore;

/// Out-of-band push notification sender. Invoked only when the receiver has
/// no live presence handle.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, user: &UserId, title: &str, body: &str);
}

/// Default notifier: records the decision in the log. The real sender (APNs
/// / FCM gateway) is an external service.
pub struct LogNotifier;

#[async_trait]
impl PushNotifier for LogNotifier {
    async fn notify(&self, user: &UserId, title: &str, body: &str) {
        info!(user = %user, title, body, "Offline receiver, notification dispatched");
    }
}

/// Display decoration for list views.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Profile {
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl Profile {
    /// Fallback when the directory has nothing: the raw id stands in so the
    /// UI always has something to render.
    pub fn placeholder(user: &UserId) -> Self {
        Self {
            display_name: user.as_str().to_string(),
            avatar_ref: None,
        }
    }
}

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    /// Infallible by contract: lookups that fail fall back to a placeholder.
    async fn profile(&self, user: &UserId) -> Profile;
}

/// Directory backed by the durable user records.
pub struct StoreProfileDirectory {
    users: Arc<dyn UserStore>,
}

impl StoreProfileDirectory {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl ProfileDirectory for StoreProfileDirectory {
    async fn profile(&self, user: &UserId) -> Profile {
        match self.users.get_user(user).await {
            Ok(Some(record)) => Profile {
                display_name: record
                    .display_name
                    .unwrap_or_else(|| user.as_str().to_string()),
                avatar_ref: record.avatar_ref,
            },
            _ => Profile::placeholder(user),
        }
    }
}
