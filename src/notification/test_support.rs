//! Helpers shared by the notification tests.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex,
};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use uuid::Uuid;

use super::{
    notification_gateway::{GatewayError, GatewayResult, NotificationGateway, Subscription},
    notification_models::{NewNotification, Notification, NotificationType},
    notification_reconciler::NotificationSnapshot,
};

pub fn notification(user_id: Uuid, is_read: bool) -> Notification {
    Notification {
        id: Uuid::new_v4(),
        user_id,
        kind: NotificationType::OrderCompleted,
        title: "Order completed".to_string(),
        message: "Your will drafting package is confirmed".to_string(),
        action_url: Some("/dashboard/orders".to_string()),
        is_read,
        created_at: Utc::now(),
    }
}

/// Waits until the snapshot satisfies `predicate`, failing the test after a second.
pub async fn wait_for<F>(rx: &mut watch::Receiver<NotificationSnapshot>, predicate: F) -> NotificationSnapshot
where
    F: FnMut(&NotificationSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(1), rx.wait_for(predicate))
        .await
        .expect("timed out waiting for snapshot")
        .expect("reconciler dropped")
        .clone()
}

/// Gateway whose answers, failures and timing are controlled by the test.
pub struct ScriptedGateway {
    notifications: Mutex<Vec<Notification>>,
    unread: AtomicU64,
    fail_load: AtomicBool,
    fail_commands: AtomicBool,
    fail_subscribe: AtomicBool,
    hold_loads: AtomicBool,
    hold_commands: AtomicBool,
    load_gate: Semaphore,
    command_gate: Semaphore,
    calls: Mutex<Vec<String>>,
    subscribers: Mutex<Vec<(Uuid, mpsc::Sender<Notification>)>>,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self {
            notifications: Mutex::new(Vec::new()),
            unread: AtomicU64::new(0),
            fail_load: AtomicBool::new(false),
            fail_commands: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            hold_loads: AtomicBool::new(false),
            hold_commands: AtomicBool::new(false),
            load_gate: Semaphore::new(0),
            command_gate: Semaphore::new(0),
            calls: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedGateway {
    pub fn with_load(notifications: Vec<Notification>, unread: u64) -> Self {
        let gateway = Self::default();
        *gateway.notifications.lock().unwrap() = notifications;
        gateway.unread.store(unread, Ordering::SeqCst);
        gateway
    }

    pub fn set_load(&self, notifications: Vec<Notification>, unread: u64) {
        *self.notifications.lock().unwrap() = notifications;
        self.unread.store(unread, Ordering::SeqCst);
    }

    pub fn fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commands(&self, fail: bool) {
        self.fail_commands.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Loads block until `release_loads` is called.
    pub fn hold_loads(&self) {
        self.hold_loads.store(true, Ordering::SeqCst);
    }

    pub fn release_loads(&self) {
        self.hold_loads.store(false, Ordering::SeqCst);
        self.load_gate.add_permits(64);
    }

    /// Commands block until `release_commands` is called.
    pub fn hold_commands(&self) {
        self.hold_commands.store(true, Ordering::SeqCst);
    }

    pub fn release_commands(&self) {
        self.hold_commands.store(false, Ordering::SeqCst);
        self.command_gate.add_permits(64);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    /// Delivers a push event to every open subscription of the record's owner.
    pub async fn push(&self, notification: Notification) {
        let senders: Vec<mpsc::Sender<Notification>> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|(user_id, _)| *user_id == notification.user_id)
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in senders {
            let _ = tx.send(notification.clone()).await;
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn command(&self) -> GatewayResult<()> {
        if self.hold_commands.load(Ordering::SeqCst) {
            let _ = self.command_gate.acquire().await;
        }
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("scripted command failure".to_string()));
        }
        Ok(())
    }

    async fn load(&self) -> GatewayResult<()> {
        if self.hold_loads.load(Ordering::SeqCst) {
            let _ = self.load_gate.acquire().await;
        }
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("scripted load failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationGateway for ScriptedGateway {
    async fn list_notifications(&self, user_id: Uuid) -> GatewayResult<Vec<Notification>> {
        self.record(format!("list:{}", user_id));
        self.load().await?;
        Ok(self.notifications.lock().unwrap().clone())
    }

    async fn count_unread(&self, user_id: Uuid) -> GatewayResult<u64> {
        self.record(format!("count:{}", user_id));
        self.load().await?;
        Ok(self.unread.load(Ordering::SeqCst))
    }

    async fn mark_read(&self, notification_id: Uuid) -> GatewayResult<()> {
        self.record(format!("mark_read:{}", notification_id));
        self.command().await
    }

    async fn mark_all_read(&self, user_id: Uuid) -> GatewayResult<()> {
        self.record(format!("mark_all_read:{}", user_id));
        self.command().await
    }

    async fn delete(&self, notification_id: Uuid) -> GatewayResult<()> {
        self.record(format!("delete:{}", notification_id));
        self.command().await
    }

    async fn create(&self, notification: NewNotification) -> GatewayResult<Notification> {
        self.record(format!("create:{}", notification.user_id));
        self.command().await?;
        Ok(Notification {
            id: Uuid::new_v4(),
            user_id: notification.user_id,
            kind: notification.kind,
            title: notification.title,
            message: notification.message,
            action_url: notification.action_url,
            is_read: false,
            created_at: Utc::now(),
        })
    }

    async fn subscribe(&self, user_id: Uuid) -> GatewayResult<Subscription> {
        self.record(format!("subscribe:{}", user_id));
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("scripted subscribe failure".to_string()));
        }
        let (tx, subscription) = Subscription::channel();
        self.subscribers.lock().unwrap().push((user_id, tx));
        Ok(subscription)
    }
}
