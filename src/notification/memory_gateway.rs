use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use super::{
    notification_gateway::{GatewayResult, NotificationGateway, Subscription},
    notification_models::{NewNotification, Notification},
};

/// Process-local backing store for development and tests.
#[derive(Clone)]
pub struct InMemoryGateway {
    notifications: Arc<DashMap<Uuid, Notification>>,
    created_tx: broadcast::Sender<Notification>,
    page_size: usize,
}

impl InMemoryGateway {
    pub fn new(page_size: usize) -> Self {
        let (created_tx, _) = broadcast::channel(100);
        Self {
            notifications: Arc::new(DashMap::new()),
            created_tx,
            page_size,
        }
    }

    /// Inserts a record as-is without publishing it to subscribers.
    pub fn seed(&self, notification: Notification) {
        self.notifications.insert(notification.id, notification);
    }

    pub fn get(&self, id: Uuid) -> Option<Notification> {
        self.notifications.get(&id).map(|entry| entry.value().clone())
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new(50)
    }
}

#[async_trait]
impl NotificationGateway for InMemoryGateway {
    async fn list_notifications(&self, user_id: Uuid) -> GatewayResult<Vec<Notification>> {
        let mut notifications: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        notifications.truncate(self.page_size);

        Ok(notifications)
    }

    async fn count_unread(&self, user_id: Uuid) -> GatewayResult<u64> {
        let count = self
            .notifications
            .iter()
            .filter(|entry| entry.user_id == user_id && !entry.is_read)
            .count();

        Ok(count as u64)
    }

    async fn mark_read(&self, notification_id: Uuid) -> GatewayResult<()> {
        if let Some(mut entry) = self.notifications.get_mut(&notification_id) {
            entry.is_read = true;
        }
        Ok(())
    }

    async fn mark_all_read(&self, user_id: Uuid) -> GatewayResult<()> {
        self.notifications
            .iter_mut()
            .filter(|entry| entry.user_id == user_id)
            .for_each(|mut entry| entry.is_read = true);
        Ok(())
    }

    async fn delete(&self, notification_id: Uuid) -> GatewayResult<()> {
        self.notifications.remove(&notification_id);
        Ok(())
    }

    async fn create(&self, notification: NewNotification) -> GatewayResult<Notification> {
        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: notification.user_id,
            kind: notification.kind,
            title: notification.title,
            message: notification.message,
            action_url: notification.action_url,
            is_read: false,
            created_at: Utc::now(),
        };
        self.notifications
            .insert(notification.id, notification.clone());

        // No subscribers is fine.
        let _ = self.created_tx.send(notification.clone());

        Ok(notification)
    }

    async fn subscribe(&self, user_id: Uuid) -> GatewayResult<Subscription> {
        let mut created_rx = self.created_tx.subscribe();
        let (tx, subscription) = Subscription::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = created_rx.recv() => match event {
                        Ok(notification) if notification.user_id == user_id => {
                            if tx.send(notification).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(%user_id, skipped, "In-memory subscription lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!(%user_id, "In-memory subscription closed");
        });

        Ok(subscription)
    }
}
