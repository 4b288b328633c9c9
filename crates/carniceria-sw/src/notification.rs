//! Push payloads and the notifications they produce.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::ServiceWorkerError;

/// Push payload delivered by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl PushMessage {
    /// Parse a push payload. An absent payload is a parse failure.
    pub fn parse(data: Option<&[u8]>) -> Result<Self, ServiceWorkerError> {
        let data = data.ok_or_else(|| ServiceWorkerError::PushParse("empty payload".to_string()))?;
        serde_json::from_slice(data).map_err(|e| ServiceWorkerError::PushParse(e.to_string()))
    }
}

/// Unique identifier for a shown notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A visible notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub icon: Url,
    pub badge: Url,
    /// Page to open when the notification is clicked.
    pub target: Url,
}

/// Permission to display notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationPermission {
    /// Not yet asked.
    #[default]
    Default,
    Granted,
    Denied,
}

/// Notifications currently on screen.
#[derive(Debug, Default)]
pub struct NotificationCenter {
    permission: NotificationPermission,
    shown: HashMap<NotificationId, Notification>,
}

impl NotificationCenter {
    pub fn new(permission: NotificationPermission) -> Self {
        Self {
            permission,
            shown: HashMap::new(),
        }
    }

    pub fn permission(&self) -> NotificationPermission {
        self.permission
    }

    pub fn set_permission(&mut self, permission: NotificationPermission) {
        self.permission = permission;
    }

    /// Display a notification. Only allowed once permission is granted.
    pub fn show(
        &mut self,
        title: String,
        body: String,
        icon: Url,
        badge: Url,
        target: Url,
    ) -> Result<Notification, ServiceWorkerError> {
        if self.permission != NotificationPermission::Granted {
            return Err(ServiceWorkerError::Security(format!(
                "notification permission is {:?}",
                self.permission
            )));
        }
        let notification = Notification {
            id: NotificationId::next(),
            title,
            body,
            icon,
            badge,
            target,
        };
        debug!(id = ?notification.id, title = %notification.title, "Showing notification");
        self.shown.insert(notification.id, notification.clone());
        Ok(notification)
    }

    /// Dismiss a notification, returning it.
    pub fn close(&mut self, id: NotificationId) -> Option<Notification> {
        self.shown.remove(&id)
    }

    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.shown.get(&id)
    }

    /// Notifications still on screen.
    pub fn visible(&self) -> Vec<&Notification> {
        let mut shown: Vec<&Notification> = self.shown.values().collect();
        shown.sort_by_key(|n| n.id.0);
        shown
    }
}
