use serde::Serialize;
use std::{
    collections::HashMap,
    future::Future,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    notification_gateway::{DynNotificationGateway, GatewayError, GatewayResult, Subscription},
    notification_models::Notification,
    notification_store::NotificationStore,
};
use crate::session::SessionBinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerPhase {
    Unbound,
    Loading,
    Active,
}

/// What to do with an optimistic local change whose persistence failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Keep the local change; the next full load resynchronizes.
    #[default]
    Diverge,
    /// Revert the command's local effect.
    Rollback,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "diverge" => Ok(FailurePolicy::Diverge),
            "rollback" => Ok(FailurePolicy::Rollback),
            other => Err(format!("unknown failure policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    MarkRead,
    MarkAllRead,
    Delete,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKind::MarkRead => write!(f, "mark_read"),
            CommandKind::MarkAllRead => write!(f, "mark_all_read"),
            CommandKind::Delete => write!(f, "delete"),
        }
    }
}

/// Failures caught at the reconciler boundary. They are logged, never returned.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Failed to load notifications for user {user_id}: {source}")]
    LoadFailure { user_id: Uuid, source: GatewayError },

    #[error("Command {command} failed after local apply: {source}")]
    CommandFailure {
        command: CommandKind,
        source: GatewayError,
    },

    #[error("Live subscription for user {user_id} unavailable: {source}")]
    SubscriptionFailure { user_id: Uuid, source: GatewayError },
}

/// Read-only view handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct NotificationSnapshot {
    pub user_id: Option<Uuid>,
    pub notifications: Vec<Notification>,
    pub unread_count: u64,
    pub loading: bool,
    pub phase: ReconcilerPhase,
    /// False while no live subscription is open.
    pub live: bool,
    pub pending_commands: usize,
}

impl Default for NotificationSnapshot {
    fn default() -> Self {
        Self {
            user_id: None,
            notifications: Vec::new(),
            unread_count: 0,
            loading: false,
            phase: ReconcilerPhase::Unbound,
            live: false,
            pending_commands: 0,
        }
    }
}

/// Local effect of a command, kept so it can be reverted.
///
/// Only meaningful against the store generation it was taken from; a full
/// load in between already carries the backend's view of the change.
enum Undo {
    MarkRead {
        notification_id: Uuid,
        changed: bool,
        decremented: bool,
    },
    MarkAllRead {
        previously_unread: Vec<Uuid>,
        previous_count: u64,
    },
    Delete(Option<(usize, Notification)>),
}

impl Undo {
    fn apply(self, store: &mut NotificationStore) {
        match self {
            Undo::MarkRead {
                notification_id,
                changed,
                decremented,
            } => {
                if changed {
                    store.mark_unread(notification_id, decremented);
                }
            }
            Undo::MarkAllRead {
                previously_unread,
                previous_count,
            } => store.restore_unread(&previously_unread, previous_count),
            Undo::Delete(Some((index, notification))) => store.restore(index, notification),
            Undo::Delete(None) => {}
        }
    }
}

/// Handle to the persistence half of a command. The local half has already
/// been applied by the time the handle is returned.
pub struct CommandHandle(Option<JoinHandle<()>>);

impl CommandHandle {
    fn noop() -> Self {
        Self(None)
    }

    /// Resolves once the backend call finished and its result was reconciled.
    pub async fn settled(self) {
        if let Some(handle) = self.0 {
            if let Err(e) = handle.await {
                warn!("Notification command task ended abnormally: {}", e);
            }
        }
    }
}

/// Bookkeeping for a command whose persistence call is in flight.
#[derive(Debug, Clone, Copy)]
struct PendingCommand {
    id: u64,
    kind: CommandKind,
    epoch: u64,
    generation: u64,
}

struct Inner {
    store: NotificationStore,
    user_id: Option<Uuid>,
    // Bumped on every rebind; results carrying an older epoch are dropped.
    epoch: u64,
    phase: ReconcilerPhase,
    loading: bool,
    live: bool,
    pump: Option<JoinHandle<()>>,
    next_command: u64,
    pending: HashMap<u64, CommandKind>,
}

impl Inner {
    fn new() -> Self {
        Self {
            store: NotificationStore::new(),
            user_id: None,
            epoch: 0,
            phase: ReconcilerPhase::Unbound,
            loading: false,
            live: false,
            pump: None,
            next_command: 0,
            pending: HashMap::new(),
        }
    }

    fn reset(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.epoch += 1;
        self.store.clear();
        self.user_id = None;
        self.phase = ReconcilerPhase::Unbound;
        self.loading = false;
        self.live = false;
        self.pending.clear();
    }

    fn begin(&mut self, kind: CommandKind) -> PendingCommand {
        self.next_command += 1;
        self.pending.insert(self.next_command, kind);
        PendingCommand {
            id: self.next_command,
            kind,
            epoch: self.epoch,
            generation: self.store.generation(),
        }
    }

    fn snapshot(&self) -> NotificationSnapshot {
        NotificationSnapshot {
            user_id: self.user_id,
            notifications: self.store.notifications().to_vec(),
            unread_count: self.store.unread_count(),
            loading: self.loading,
            phase: self.phase,
            live: self.live,
            pending_commands: self.pending.len(),
        }
    }
}

/// Sole owner of the session's notification store.
///
/// Local commands mutate the store synchronously when called and persist in
/// the background; push events from the live subscription are prepended as
/// they arrive. Every gateway failure is logged and swallowed.
#[derive(Clone)]
pub struct NotificationReconciler {
    gateway: DynNotificationGateway,
    policy: FailurePolicy,
    inner: Arc<Mutex<Inner>>,
    snapshot_tx: Arc<watch::Sender<NotificationSnapshot>>,
}

impl NotificationReconciler {
    pub fn new(gateway: DynNotificationGateway, policy: FailurePolicy) -> Self {
        let (snapshot_tx, _) = watch::channel(NotificationSnapshot::default());
        Self {
            gateway,
            policy,
            inner: Arc::new(Mutex::new(Inner::new())),
            snapshot_tx: Arc::new(snapshot_tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        self.snapshot_tx.send_replace(inner.snapshot());
    }

    pub fn snapshot(&self) -> NotificationSnapshot {
        self.lock().snapshot()
    }

    /// Change feed of snapshots for the presentation layer.
    pub fn watch(&self) -> watch::Receiver<NotificationSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.lock().user_id
    }

    /// Drops the current binding and scopes the store to `user_id`.
    fn bind(&self, user_id: Option<Uuid>) -> u64 {
        let mut inner = self.lock();
        inner.reset();
        if let Some(user_id) = user_id {
            inner.user_id = Some(user_id);
            inner.phase = ReconcilerPhase::Loading;
            inner.loading = true;
        }
        self.publish(&inner);
        inner.epoch
    }

    /// Binds to `user_id`, loads the first page with the unread count and opens
    /// the live subscription. `None` leaves the reconciler unbound and empty.
    pub async fn initialize(&self, user_id: Option<Uuid>) {
        let epoch = self.bind(user_id);
        if let Some(user_id) = user_id {
            self.activate(user_id, epoch).await;
        }
    }

    async fn activate(&self, user_id: Uuid, epoch: u64) {
        info!(%user_id, "Binding notifications to user");
        tokio::join!(
            self.open_subscription(user_id, epoch),
            self.load(user_id, epoch)
        );
    }

    /// Re-runs the full load and reopens the subscription if it is down.
    pub async fn refresh(&self) {
        let (user_id, epoch, live) = {
            let inner = self.lock();
            (inner.user_id, inner.epoch, inner.pump.is_some())
        };
        let Some(user_id) = user_id else {
            return;
        };

        if live {
            self.load(user_id, epoch).await;
        } else {
            tokio::join!(
                self.open_subscription(user_id, epoch),
                self.load(user_id, epoch)
            );
        }
    }

    /// Closes the subscription and clears the store. Anything still in flight
    /// resolves into the void.
    pub fn teardown(&self) {
        let mut inner = self.lock();
        if let Some(user_id) = inner.user_id {
            info!(%user_id, "Tearing down notifications");
        }
        inner.reset();
        self.publish(&inner);
    }

    async fn load(&self, user_id: Uuid, epoch: u64) {
        {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.loading = true;
            self.publish(&inner);
        }

        let (list, count) = tokio::join!(
            self.gateway.list_notifications(user_id),
            self.gateway.count_unread(user_id)
        );

        let mut inner = self.lock();
        if inner.epoch != epoch {
            debug!(%user_id, "Discarding load for a previous session");
            return;
        }
        inner.loading = false;
        inner.phase = ReconcilerPhase::Active;

        match list.and_then(|notifications| count.map(|unread| (notifications, unread))) {
            Ok((notifications, unread)) => {
                debug!(%user_id, loaded = notifications.len(), unread, "Notifications loaded");
                inner.store.replace(notifications, unread);
            }
            Err(source) => {
                let err = ReconcileError::LoadFailure { user_id, source };
                error!(%user_id, "{}", err);
            }
        }
        self.publish(&inner);
    }

    async fn open_subscription(&self, user_id: Uuid, epoch: u64) {
        match self.gateway.subscribe(user_id).await {
            Ok(subscription) => {
                let mut inner = self.lock();
                if inner.epoch != epoch || inner.pump.is_some() {
                    subscription.unsubscribe();
                    return;
                }
                let reconciler = self.clone();
                inner.pump = Some(tokio::spawn(reconciler.pump(subscription, user_id, epoch)));
                inner.live = true;
                self.publish(&inner);
            }
            Err(source) => {
                let err = ReconcileError::SubscriptionFailure { user_id, source };
                warn!(%user_id, "{}; continuing without live updates", err);
            }
        }
    }

    async fn pump(self, mut subscription: Subscription, user_id: Uuid, epoch: u64) {
        while let Some(notification) = subscription.next().await {
            if !self.apply_push(epoch, notification) {
                return;
            }
        }

        warn!(%user_id, "Live notification channel closed by the backend");
        let mut inner = self.lock();
        if inner.epoch == epoch {
            inner.pump = None;
            inner.live = false;
            self.publish(&inner);
        }
    }

    /// Returns false once the epoch is stale and the caller should stop.
    fn apply_push(&self, epoch: u64, notification: Notification) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        if inner.user_id != Some(notification.user_id) {
            warn!(
                notification_id = %notification.id,
                owner = %notification.user_id,
                "Ignoring push event for another user"
            );
            return true;
        }

        debug!(notification_id = %notification.id, "Push notification received");
        inner.store.prepend(notification);
        self.publish(&inner);
        true
    }

    /// Applies a push event to the current session.
    pub fn on_push_event(&self, notification: Notification) {
        let epoch = self.lock().epoch;
        self.apply_push(epoch, notification);
    }

    pub fn mark_as_read(&self, notification_id: Uuid) -> CommandHandle {
        let (command, undo) = {
            let mut inner = self.lock();
            let command = inner.begin(CommandKind::MarkRead);
            let before = inner.store.unread_count();
            let changed = inner.store.mark_read(notification_id);
            let undo = Undo::MarkRead {
                notification_id,
                changed,
                decremented: before != inner.store.unread_count(),
            };
            self.publish(&inner);
            (command, undo)
        };

        let gateway = self.gateway.clone();
        self.dispatch(command, undo, async move {
            gateway.mark_read(notification_id).await
        })
    }

    /// No-op while unbound.
    pub fn mark_all_as_read(&self) -> CommandHandle {
        let (user_id, command, undo) = {
            let mut inner = self.lock();
            let Some(user_id) = inner.user_id else {
                return CommandHandle::noop();
            };
            let command = inner.begin(CommandKind::MarkAllRead);
            let (previously_unread, previous_count) = inner.store.mark_all_read();
            self.publish(&inner);
            (
                user_id,
                command,
                Undo::MarkAllRead {
                    previously_unread,
                    previous_count,
                },
            )
        };

        let gateway = self.gateway.clone();
        self.dispatch(command, undo, async move {
            gateway.mark_all_read(user_id).await
        })
    }

    /// Removes the record locally. The unread counter is deliberately left
    /// alone, even for an unread record.
    pub fn delete_notification(&self, notification_id: Uuid) -> CommandHandle {
        let (command, undo) = {
            let mut inner = self.lock();
            let command = inner.begin(CommandKind::Delete);
            let removed = inner.store.remove(notification_id);
            self.publish(&inner);
            (command, Undo::Delete(removed))
        };

        let gateway = self.gateway.clone();
        self.dispatch(command, undo, async move {
            gateway.delete(notification_id).await
        })
    }

    fn dispatch<F>(&self, command: PendingCommand, undo: Undo, persist: F) -> CommandHandle
    where
        F: Future<Output = GatewayResult<()>> + Send + 'static,
    {
        let reconciler = self.clone();
        CommandHandle(Some(tokio::spawn(async move {
            let result = persist.await;
            reconciler.settle(command, undo, result);
        })))
    }

    fn settle(&self, command: PendingCommand, undo: Undo, result: GatewayResult<()>) {
        let kind = command.kind;
        let failed = match result {
            Ok(()) => false,
            Err(source) => {
                let err = ReconcileError::CommandFailure {
                    command: kind,
                    source,
                };
                error!("{}", err);
                true
            }
        };

        let mut inner = self.lock();
        if inner.epoch != command.epoch {
            debug!(command = %kind, "Ignoring command result for a previous session");
            return;
        }
        inner.pending.remove(&command.id);
        if failed && self.policy == FailurePolicy::Rollback {
            if inner.store.generation() == command.generation {
                info!(command = %kind, "Rolling back optimistic notification change");
                undo.apply(&mut inner.store);
            } else {
                // A full load landed meanwhile and already reflects the backend.
                debug!(command = %kind, "Store reloaded since the command began, not rolling back");
            }
        }
        self.publish(&inner);
    }

    /// Keeps the binding in step with the session: every identity transition
    /// tears down the old scope and, for a present identity, starts a new one.
    pub fn follow(&self, session: &SessionBinding) -> JoinHandle<()> {
        let reconciler = self.clone();
        let mut identity = session.watch();

        tokio::spawn(async move {
            loop {
                let user_id = *identity.borrow_and_update();
                let epoch = reconciler.bind(user_id);
                if let Some(user_id) = user_id {
                    let activating = reconciler.clone();
                    tokio::spawn(async move { activating.activate(user_id, epoch).await });
                }

                if identity.changed().await.is_err() {
                    break;
                }
            }
            reconciler.teardown();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::test_support::{notification, wait_for, ScriptedGateway};

    fn reconciler_with(gateway: &Arc<ScriptedGateway>, policy: FailurePolicy) -> NotificationReconciler {
        NotificationReconciler::new(gateway.clone(), policy)
    }

    #[tokio::test]
    async fn test_initialize_without_user_stays_empty() {
        let gateway = Arc::new(ScriptedGateway::default());
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);

        reconciler.initialize(None).await;

        let snapshot = reconciler.snapshot();
        assert!(snapshot.notifications.is_empty());
        assert_eq!(snapshot.unread_count, 0);
        assert_eq!(snapshot.phase, ReconcilerPhase::Unbound);
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_takes_count_from_count_query() {
        let user = Uuid::new_v4();
        let loaded = notification(user, false);
        let gateway = Arc::new(ScriptedGateway::with_load(vec![loaded.clone()], 3));
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);

        reconciler.initialize(Some(user)).await;

        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.notifications, vec![loaded]);
        assert_eq!(snapshot.unread_count, 3);
        assert_eq!(snapshot.phase, ReconcilerPhase::Active);
        assert!(!snapshot.loading);
        assert!(snapshot.live);
        assert_eq!(gateway.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_mark_as_read_decrements_once() {
        let user = Uuid::new_v4();
        let first = notification(user, false);
        let gateway = Arc::new(ScriptedGateway::with_load(vec![first.clone()], 1));
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);
        reconciler.initialize(Some(user)).await;

        reconciler.mark_as_read(first.id).settled().await;
        let snapshot = reconciler.snapshot();
        assert!(snapshot.notifications[0].is_read);
        assert_eq!(snapshot.unread_count, 0);

        reconciler.mark_as_read(first.id).settled().await;
        assert_eq!(reconciler.snapshot().unread_count, 0);
        assert_eq!(
            gateway
                .calls()
                .iter()
                .filter(|c| c.starts_with("mark_read:"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_local_update_happens_before_persistence() {
        let user = Uuid::new_v4();
        let first = notification(user, false);
        let gateway = Arc::new(ScriptedGateway::with_load(vec![first.clone()], 1));
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);
        reconciler.initialize(Some(user)).await;
        gateway.hold_commands();

        let handle = reconciler.mark_as_read(first.id);

        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.unread_count, 0);
        assert_eq!(snapshot.pending_commands, 1);

        gateway.release_commands();
        handle.settled().await;
        assert_eq!(reconciler.snapshot().pending_commands, 0);
    }

    #[tokio::test]
    async fn test_mark_all_as_read_zeroes_everything() {
        let user = Uuid::new_v4();
        let gateway = Arc::new(ScriptedGateway::with_load(
            vec![notification(user, false), notification(user, true), notification(user, false)],
            12,
        ));
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);
        reconciler.initialize(Some(user)).await;

        reconciler.mark_all_as_read().settled().await;

        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.unread_count, 0);
        assert!(snapshot.notifications.iter().all(|n| n.is_read));
        assert!(gateway.calls().contains(&format!("mark_all_read:{}", user)));
    }

    #[tokio::test]
    async fn test_mark_all_as_read_unbound_is_noop() {
        let gateway = Arc::new(ScriptedGateway::default());
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);

        reconciler.mark_all_as_read().settled().await;

        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_keeps_unread_count() {
        let user = Uuid::new_v4();
        let unread = notification(user, false);
        let gateway = Arc::new(ScriptedGateway::with_load(vec![unread.clone()], 1));
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);
        reconciler.initialize(Some(user)).await;

        reconciler.delete_notification(unread.id).settled().await;

        let snapshot = reconciler.snapshot();
        assert!(snapshot.notifications.is_empty());
        assert_eq!(snapshot.unread_count, 1);
    }

    #[tokio::test]
    async fn test_push_event_is_prepended() {
        let user = Uuid::new_v4();
        let existing = notification(user, true);
        let gateway = Arc::new(ScriptedGateway::with_load(vec![existing.clone()], 0));
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);
        reconciler.initialize(Some(user)).await;
        let mut rx = reconciler.watch();

        let mut pushed = notification(user, false);
        pushed.created_at = existing.created_at - chrono::Duration::days(1);
        gateway.push(pushed.clone()).await;

        let snapshot = wait_for(&mut rx, |s| s.notifications.len() == 2).await;
        assert_eq!(snapshot.notifications[0].id, pushed.id);
        assert_eq!(snapshot.notifications[1].id, existing.id);
        assert_eq!(snapshot.unread_count, 1);
    }

    #[tokio::test]
    async fn test_read_push_event_keeps_count() {
        let user = Uuid::new_v4();
        let gateway = Arc::new(ScriptedGateway::with_load(vec![], 2));
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);
        reconciler.initialize(Some(user)).await;

        reconciler.on_push_event(notification(user, true));

        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.notifications.len(), 1);
        assert_eq!(snapshot.unread_count, 2);
    }

    #[tokio::test]
    async fn test_push_for_other_user_is_ignored() {
        let user = Uuid::new_v4();
        let gateway = Arc::new(ScriptedGateway::default());
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);
        reconciler.initialize(Some(user)).await;

        reconciler.on_push_event(notification(Uuid::new_v4(), false));

        assert!(reconciler.snapshot().notifications.is_empty());
    }

    #[tokio::test]
    async fn test_failed_load_keeps_prior_state() {
        let user = Uuid::new_v4();
        let gateway = Arc::new(ScriptedGateway::with_load(vec![notification(user, false)], 1));
        gateway.fail_load(true);
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);

        reconciler.initialize(Some(user)).await;

        let snapshot = reconciler.snapshot();
        assert!(snapshot.notifications.is_empty());
        assert_eq!(snapshot.unread_count, 0);
        assert!(!snapshot.loading);
        assert_eq!(snapshot.phase, ReconcilerPhase::Active);

        gateway.fail_load(false);
        reconciler.refresh().await;
        assert_eq!(reconciler.snapshot().notifications.len(), 1);
        assert_eq!(reconciler.snapshot().unread_count, 1);
    }

    #[tokio::test]
    async fn test_subscription_failure_degrades_until_refresh() {
        let user = Uuid::new_v4();
        let gateway = Arc::new(ScriptedGateway::with_load(vec![notification(user, false)], 1));
        gateway.fail_subscribe(true);
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);

        reconciler.initialize(Some(user)).await;
        let snapshot = reconciler.snapshot();
        assert!(!snapshot.live);
        assert_eq!(snapshot.notifications.len(), 1);

        gateway.fail_subscribe(false);
        reconciler.refresh().await;
        assert!(reconciler.snapshot().live);
        assert_eq!(gateway.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_does_not_open_second_subscription() {
        let user = Uuid::new_v4();
        let gateway = Arc::new(ScriptedGateway::default());
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);
        reconciler.initialize(Some(user)).await;

        reconciler.refresh().await;

        assert_eq!(gateway.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_command_diverges_by_default() {
        let user = Uuid::new_v4();
        let first = notification(user, false);
        let gateway = Arc::new(ScriptedGateway::with_load(vec![first.clone()], 1));
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);
        reconciler.initialize(Some(user)).await;
        gateway.fail_commands(true);

        reconciler.mark_as_read(first.id).settled().await;

        let snapshot = reconciler.snapshot();
        assert!(snapshot.notifications[0].is_read);
        assert_eq!(snapshot.unread_count, 0);
        assert_eq!(snapshot.pending_commands, 0);
    }

    #[tokio::test]
    async fn test_failed_commands_roll_back_when_configured() {
        let user = Uuid::new_v4();
        let first = notification(user, false);
        let second = notification(user, false);
        let gateway = Arc::new(ScriptedGateway::with_load(vec![first.clone(), second.clone()], 5));
        let reconciler = reconciler_with(&gateway, FailurePolicy::Rollback);
        reconciler.initialize(Some(user)).await;
        gateway.fail_commands(true);

        reconciler.mark_as_read(first.id).settled().await;
        assert_eq!(reconciler.snapshot().unread_count, 5);
        assert!(!reconciler.snapshot().notifications[0].is_read);

        reconciler.mark_all_as_read().settled().await;
        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.unread_count, 5);
        assert!(snapshot.notifications.iter().all(|n| !n.is_read));

        reconciler.delete_notification(second.id).settled().await;
        let ids: Vec<Uuid> = reconciler.snapshot().notifications.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_rollback_after_refresh_keeps_reloaded_count() {
        let user = Uuid::new_v4();
        let first = notification(user, false);
        let second = notification(user, false);
        let gateway = Arc::new(ScriptedGateway::with_load(vec![first.clone(), second.clone()], 2));
        let reconciler = reconciler_with(&gateway, FailurePolicy::Rollback);
        reconciler.initialize(Some(user)).await;
        gateway.hold_commands();
        gateway.fail_commands(true);

        let mark_all = reconciler.mark_all_as_read();
        let mark_one = reconciler.mark_as_read(first.id);
        let delete = reconciler.delete_notification(second.id);
        assert_eq!(reconciler.snapshot().unread_count, 0);

        // The backend never applied anything, so the reload shows both unread.
        reconciler.refresh().await;
        assert_eq!(reconciler.snapshot().unread_count, 2);

        gateway.release_commands();
        mark_all.settled().await;
        mark_one.settled().await;
        delete.settled().await;

        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.unread_count, 2);
        assert_eq!(snapshot.pending_commands, 0);
        let ids: Vec<Uuid> = snapshot.notifications.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(snapshot.notifications.iter().all(|n| !n.is_read));
    }

    #[tokio::test]
    async fn test_late_command_result_after_teardown_is_ignored() {
        let user = Uuid::new_v4();
        let first = notification(user, false);
        let gateway = Arc::new(ScriptedGateway::with_load(vec![first.clone()], 1));
        let reconciler = reconciler_with(&gateway, FailurePolicy::Rollback);
        reconciler.initialize(Some(user)).await;
        gateway.hold_commands();
        gateway.fail_commands(true);

        let handle = reconciler.mark_as_read(first.id);
        reconciler.teardown();
        let before = reconciler.snapshot();

        gateway.release_commands();
        handle.settled().await;

        let after = reconciler.snapshot();
        assert_eq!(before, after);
        assert!(after.notifications.is_empty());
        assert_eq!(after.unread_count, 0);
        assert_eq!(after.phase, ReconcilerPhase::Unbound);
    }

    #[tokio::test]
    async fn test_late_load_for_previous_user_is_discarded() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let gateway = Arc::new(ScriptedGateway::with_load(vec![notification(alice, false)], 9));
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);
        gateway.hold_loads();

        let stale = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.initialize(Some(alice)).await })
        };
        // Let the first load reach the gateway before rebinding.
        while !gateway.calls().contains(&format!("list:{}", alice)) {
            tokio::task::yield_now().await;
        }
        reconciler.teardown();
        reconciler.on_push_event(notification(alice, false));

        gateway.release_loads();
        stale.await.unwrap();

        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.user_id, None);
        assert!(snapshot.notifications.is_empty());
        assert_eq!(snapshot.unread_count, 0);

        gateway.set_load(vec![notification(bob, false)], 1);
        reconciler.initialize(Some(bob)).await;
        assert_eq!(reconciler.snapshot().user_id, Some(bob));
        assert_eq!(reconciler.snapshot().unread_count, 1);
    }

    #[tokio::test]
    async fn test_teardown_closes_subscription() {
        let user = Uuid::new_v4();
        let gateway = Arc::new(ScriptedGateway::default());
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);
        reconciler.initialize(Some(user)).await;
        assert_eq!(gateway.subscriber_count(), 1);

        reconciler.teardown();
        // The aborted pump drops its receiver the next time the runtime polls it.
        for _ in 0..100 {
            if gateway.subscriber_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(gateway.subscriber_count(), 0);

        gateway.push(notification(user, false)).await;
        tokio::task::yield_now().await;

        assert!(reconciler.snapshot().notifications.is_empty());
        assert_eq!(reconciler.snapshot().unread_count, 0);
    }

    #[tokio::test]
    async fn test_follow_rescopes_on_identity_change() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let gateway = Arc::new(ScriptedGateway::with_load(vec![], 4));
        let reconciler = reconciler_with(&gateway, FailurePolicy::Diverge);
        let session = SessionBinding::new();
        let mut rx = reconciler.watch();
        let _follower = reconciler.follow(&session);

        session.login(alice);
        wait_for(&mut rx, |s| s.user_id == Some(alice) && s.phase == ReconcilerPhase::Active).await;

        session.login(bob);
        let snapshot = wait_for(&mut rx, |s| {
            s.user_id == Some(bob) && s.phase == ReconcilerPhase::Active && s.live
        })
        .await;
        assert_eq!(snapshot.unread_count, 4);

        session.logout();
        let snapshot = wait_for(&mut rx, |s| s.phase == ReconcilerPhase::Unbound).await;
        assert_eq!(snapshot.user_id, None);
        assert_eq!(snapshot.unread_count, 0);
    }

    #[tokio::test]
    async fn test_created_notification_arrives_through_subscription() {
        use crate::notification::{
            memory_gateway::InMemoryGateway,
            notification_gateway::NotificationGateway,
            notification_models::{NewNotification, NotificationType},
        };

        let gateway = Arc::new(InMemoryGateway::default());
        let user = Uuid::new_v4();
        gateway.seed(notification(user, true));
        let reconciler = NotificationReconciler::new(gateway.clone(), FailurePolicy::Diverge);
        reconciler.initialize(Some(user)).await;
        let mut rx = reconciler.watch();

        let created = gateway
            .create(NewNotification {
                user_id: user,
                kind: NotificationType::AppointmentReminder,
                title: "Appointment tomorrow".to_string(),
                message: "Consultation with your attorney at 10:00".to_string(),
                action_url: None,
            })
            .await
            .unwrap();

        let snapshot = wait_for(&mut rx, |s| s.notifications.len() == 2).await;
        assert_eq!(snapshot.notifications[0].id, created.id);
        assert_eq!(snapshot.unread_count, 1);
    }

    #[test]
    fn test_failure_policy_from_str() {
        assert_eq!("diverge".parse::<FailurePolicy>(), Ok(FailurePolicy::Diverge));
        assert_eq!("Rollback".parse::<FailurePolicy>(), Ok(FailurePolicy::Rollback));
        assert!("retry".parse::<FailurePolicy>().is_err());
    }
}
