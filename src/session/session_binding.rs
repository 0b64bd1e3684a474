use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Current authenticated identity and its login/logout transitions.
#[derive(Clone)]
pub struct SessionBinding {
    identity: Arc<watch::Sender<Option<Uuid>>>,
}

impl SessionBinding {
    pub fn new() -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            identity: Arc::new(identity),
        }
    }

    pub fn current(&self) -> Option<Uuid> {
        *self.identity.borrow()
    }

    /// Returns false if `user_id` was already the bound identity.
    pub fn login(&self, user_id: Uuid) -> bool {
        let changed = self.identity.send_if_modified(|current| {
            if *current == Some(user_id) {
                return false;
            }
            *current = Some(user_id);
            true
        });
        if changed {
            tracing::info!(%user_id, "Session bound");
        }
        changed
    }

    pub fn logout(&self) -> bool {
        let changed = self.identity.send_if_modified(|current| current.take().is_some());
        if changed {
            tracing::info!("Session unbound");
        }
        changed
    }

    pub fn watch(&self) -> watch::Receiver<Option<Uuid>> {
        self.identity.subscribe()
    }
}

impl Default for SessionBinding {
    fn default() -> Self {
        Self::new()
    }
}
