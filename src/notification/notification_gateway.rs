use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::notification_models::{NewNotification, Notification};

/// Capacity of a live subscription channel. A slow consumer makes the
/// producer wait instead of dropping events.
pub const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Receiving end of a live notification feed scoped to one user.
///
/// Dropping it unsubscribes: producers watch for the closed channel and stop.
pub struct Subscription {
    events: mpsc::Receiver<Notification>,
}

impl Subscription {
    /// Creates a linked producer/subscription pair.
    pub fn channel() -> (mpsc::Sender<Notification>, Subscription) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        (tx, Subscription { events: rx })
    }

    pub async fn next(&mut self) -> Option<Notification> {
        self.events.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.events.close();
    }
}

/// Boundary to the backing store. Returns plain data; never touches the
/// reconciler's local state.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// Newest first, limited to one page.
    async fn list_notifications(&self, user_id: Uuid) -> GatewayResult<Vec<Notification>>;

    async fn count_unread(&self, user_id: Uuid) -> GatewayResult<u64>;

    async fn mark_read(&self, notification_id: Uuid) -> GatewayResult<()>;

    async fn mark_all_read(&self, user_id: Uuid) -> GatewayResult<()>;

    async fn delete(&self, notification_id: Uuid) -> GatewayResult<()>;

    async fn create(&self, notification: NewNotification) -> GatewayResult<Notification>;

    async fn subscribe(&self, user_id: Uuid) -> GatewayResult<Subscription>;
}

pub type DynNotificationGateway = Arc<dyn NotificationGateway>;
