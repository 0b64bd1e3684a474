use uuid::Uuid;

use super::notification_models::Notification;

/// Ordered, most-recent-first collection of the bound user's notifications.
///
/// The unread counter is tracked incrementally and is seeded by the backend's
/// own count, so it can legitimately differ from the number of unread records
/// held here (the full load is page-limited).
#[derive(Debug, Default, Clone)]
pub struct NotificationStore {
    notifications: Vec<Notification>,
    unread_count: u64,
    // Bumped whenever the contents are replaced wholesale.
    generation: u64,
}

impl NotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn unread_count(&self) -> u64 {
        self.unread_count
    }

    /// Changes on every full replace or clear, never on incremental updates.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&Notification> {
        self.notifications.iter().find(|n| n.id == id)
    }

    /// Replace everything with a full load, keeping server order.
    pub fn replace(&mut self, notifications: Vec<Notification>, unread_count: u64) {
        self.notifications = notifications;
        self.unread_count = unread_count;
        self.generation += 1;
    }

    pub fn clear(&mut self) {
        self.notifications.clear();
        self.unread_count = 0;
        self.generation += 1;
    }

    /// Insert at the head in arrival order. No de-duplication.
    pub fn prepend(&mut self, notification: Notification) {
        if !notification.is_read {
            self.unread_count += 1;
        }
        self.notifications.insert(0, notification);
    }

    /// Returns true if the record existed and was unread, i.e. the counter moved.
    pub fn mark_read(&mut self, id: Uuid) -> bool {
        match self.notifications.iter_mut().find(|n| n.id == id) {
            Some(notification) if !notification.is_read => {
                notification.is_read = true;
                self.unread_count = self.unread_count.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    /// Marks everything read and zeroes the counter.
    ///
    /// Returns the ids that were unread and the counter value before the reset.
    pub fn mark_all_read(&mut self) -> (Vec<Uuid>, u64) {
        let previously_unread = self
            .notifications
            .iter_mut()
            .filter(|n| !n.is_read)
            .map(|n| {
                n.is_read = true;
                n.id
            })
            .collect();
        let previous_count = std::mem::replace(&mut self.unread_count, 0);

        (previously_unread, previous_count)
    }

    /// Removes the record and returns it with its former position.
    ///
    /// The unread counter is left untouched even when the removed record was
    /// unread; the next full load resynchronizes it.
    pub fn remove(&mut self, id: Uuid) -> Option<(usize, Notification)> {
        let index = self.notifications.iter().position(|n| n.id == id)?;
        Some((index, self.notifications.remove(index)))
    }

    /// Undo for `mark_read`.
    pub fn mark_unread(&mut self, id: Uuid, restore_count: bool) {
        if let Some(notification) = self.notifications.iter_mut().find(|n| n.id == id) {
            if notification.is_read {
                notification.is_read = false;
                if restore_count {
                    self.unread_count += 1;
                }
            }
        }
    }

    /// Undo for `mark_all_read`.
    pub fn restore_unread(&mut self, ids: &[Uuid], previous_count: u64) {
        for notification in self.notifications.iter_mut() {
            if ids.contains(&notification.id) {
                notification.is_read = false;
            }
        }
        self.unread_count += previous_count;
    }

    /// Undo for `remove`.
    pub fn restore(&mut self, index: usize, notification: Notification) {
        if self.get(notification.id).is_some() {
            return;
        }
        let index = index.min(self.notifications.len());
        self.notifications.insert(index, notification);
    }
}
