//! Notifications shown in response to push messages.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use lizard_core::NotificationConfig;
use serde::{Deserialize, Serialize};

/// Unique identifier for a shown notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Data attached to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationData {
    /// When the push arrived (ms since epoch).
    pub date_of_arrival: u64,
    pub primary_key: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
}

impl Notification {
    /// Build a notification from settings; a non-empty push payload replaces the body.
    pub fn from_push(config: &NotificationConfig, payload: Option<&str>, arrived_at: u64) -> Self {
        let body = payload
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map_or_else(|| config.body.clone(), str::to_string);

        Self {
            id: NotificationId::new(),
            title: config.title.clone(),
            body,
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            vibrate: config.vibrate.clone(),
            data: NotificationData {
                date_of_arrival: arrived_at,
                primary_key: 1,
            },
        }
    }
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

    pub fn show(&mut self, notification: Notification) -> NotificationId {
        let id = notification.id;
        self.shown.insert(id, notification);
        id
    }

    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.shown.get(&id)
    }

    /// Close a notification. Returns it if it was showing.
    pub fn close(&mut self, id: NotificationId) -> Option<Notification> {
        self.shown.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.shown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shown.is_empty()
    }
}
