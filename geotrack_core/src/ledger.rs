//! Notification Ledger - bounded most-recent-first list of notifications.
//!
//! Recording a notification is decoupled from alerting on it; the ledger
//! only keeps history and an unread counter.

use crate::model::NotificationEvent;
use std::collections::VecDeque;

/// Default number of notifications retained.
pub const DEFAULT_LEDGER_CAPACITY: usize = 10;

/// Fixed-capacity ring of recent notifications, newest at index 0.
#[derive(Debug, Clone)]
pub struct NotificationLedger {
    entries: VecDeque<NotificationEvent>,
    capacity: usize,
    unread: usize,
}

impl NotificationLedger {
    /// Creates an empty ledger.
    ///
    /// # Arguments
    /// * `capacity` - Maximum entries kept (at least 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            unread: 0,
        }
    }

    /// Prepends `event`, evicting the oldest entry beyond capacity.
    pub fn push(&mut self, event: NotificationEvent) {
        self.entries.push_front(event);
        self.entries.truncate(self.capacity);
        self.unread = (self.unread + 1).min(self.capacity);
    }

    /// Removes the entry at `index`. Out of range is a no-op.
    pub fn clear(&mut self, index: usize) -> Option<NotificationEvent> {
        let removed = self.entries.remove(index)?;
        // Unread entries are the newest ones
        if index < self.unread {
            self.unread -= 1;
        }
        Some(removed)
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.unread = 0;
    }

    pub fn mark_read(&mut self) {
        self.unread = 0;
    }

    pub fn unread(&self) -> usize {
        self.unread
    }

    pub fn get(&self, index: usize) -> Option<&NotificationEvent> {
        self.entries.get(index)
    }

    /// Iterates newest first.
    pub fn iter(&self) -> impl Iterator<Item = &NotificationEvent> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for NotificationLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NotificationKind, ObjectId, UserId};

    fn event(n: i64) -> NotificationEvent {
        NotificationEvent {
            user_id: UserId(1),
            object_id: ObjectId(n),
            object_name: format!("obj-{n}"),
            object_type: "KEYS".into(),
            message: format!("message {n}"),
            kind: NotificationKind::GeofenceExit,
            timestamp: "2024-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_ledger_bound_most_recent_first() {
        let mut ledger = NotificationLedger::default();
        for n in 1..=15 {
            ledger.push(event(n));
        }

        assert_eq!(ledger.len(), 10);
        let ids: Vec<i64> = ledger.iter().map(|e| e.object_id.0).collect();
        assert_eq!(ids, (6..=15).rev().collect::<Vec<_>>());
        assert_eq!(ledger.unread(), 10);
    }

    #[test]
    fn test_ledger_clear_by_index() {
        let mut ledger = NotificationLedger::default();
        ledger.push(event(1));
        ledger.push(event(2));
        ledger.push(event(3));

        let removed = ledger.clear(1).unwrap();
        assert_eq!(removed.object_id, ObjectId(2));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.unread(), 2);

        assert!(ledger.clear(7).is_none());
        assert_eq!(ledger.len(), 2);

        ledger.clear_all();
        assert!(ledger.is_empty());
        assert_eq!(ledger.unread(), 0);
    }

    #[test]
    fn test_ledger_mark_read() {
        let mut ledger = NotificationLedger::new(3);
        ledger.push(event(1));
        ledger.push(event(2));
        ledger.mark_read();
        assert_eq!(ledger.unread(), 0);

        ledger.push(event(3));
        assert_eq!(ledger.unread(), 1);
        // Clearing an already-read entry leaves the count alone
        ledger.clear(2);
        assert_eq!(ledger.unread(), 1);
        ledger.clear(0);
        assert_eq!(ledger.unread(), 0);
    }
}
