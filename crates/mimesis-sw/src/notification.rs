//! Notifications shown by the worker.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Identifier of a shown notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A notification button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    pub icon: String,
}

/// A notification as handed to the platform.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    /// Opaque payload returned on click.
    pub data: JsonValue,
    pub actions: Vec<NotificationAction>,
}

/// Notifications currently on screen.
#[derive(Debug, Default)]
pub struct Notifications {
    shown: HashMap<NotificationId, Notification>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show a notification; its id is assigned here.
    pub fn show(&mut self, mut notification: Notification) -> NotificationId {
        let id = NotificationId::next();
        notification.id = id;
        self.shown.insert(id, notification);
        id
    }

    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.shown.get(&id)
    }

    /// Close a notification. Returns false if it was not showing.
    pub fn close(&mut self, id: NotificationId) -> bool {
        self.shown.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.shown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shown.is_empty()
    }
}

impl Notification {
    /// Placeholder id; replaced by [`Notifications::show`].
    pub(crate) const UNSHOWN: NotificationId = NotificationId(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification(title: &str) -> Notification {
        Notification {
            id: Notification::UNSHOWN,
            title: title.to_string(),
            body: "body".to_string(),
            icon: String::new(),
            badge: String::new(),
            vibrate: vec![],
            data: json!({ "primaryKey": 1 }),
            actions: vec![],
        }
    }

    #[test]
    fn test_show_and_close() {
        let mut notifications = Notifications::new();
        let a = notifications.show(notification("a"));
        let b = notifications.show(notification("b"));

        assert_ne!(a, b);
        assert_eq!(notifications.get(a).unwrap().id, a);
        assert_eq!(notifications.get(b).unwrap().title, "b");

        assert!(notifications.close(a));
        assert!(!notifications.close(a));
        assert_eq!(notifications.len(), 1);
    }
}
