//! Out-of-band worker events: background sync, push and notifications.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::NotificationConfig;

/// The only background-sync tag the worker recognizes.
pub const SYNC_RESULTS_TAG: &str = "sync-results";

// ==================== Sync ====================

/// What the worker did with a sync event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// `sync-results`: acknowledged. Nothing is replayed yet.
    Acknowledged,
    /// Any other tag.
    Ignored,
}

// ==================== Notifications ====================

/// Unique identifier for a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Payload attached to every push notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    /// Arrival time, ms since epoch.
    pub arrival_timestamp: i64,
    pub primary_key: u32,
}

/// Notification descriptor handed to the host for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationOptions {
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
}

impl NotificationOptions {
    /// Build the descriptor for a push; `payload` falls back to the configured
    /// placeholder.
    pub fn for_push(config: &NotificationConfig, payload: Option<&str>) -> Self {
        Self {
            body: payload
                .map(str::to_string)
                .unwrap_or_else(|| config.default_body.clone()),
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            vibrate: config.vibrate.clone(),
            data: NotificationData {
                arrival_timestamp: Utc::now().timestamp_millis(),
                primary_key: 1,
            },
        }
    }
}

/// A notification currently on screen.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: NotificationId,
    /// Scope of the registration that showed it.
    pub scope: Url,
    pub title: String,
    pub options: NotificationOptions,
}

/// Notifications displayed by the host.
#[derive(Debug, Default)]
pub struct Notifications {
    shown: HashMap<NotificationId, Notification>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display a notification.
    pub fn show(&mut self, scope: Url, title: &str, options: NotificationOptions) -> Notification {
        let notification = Notification {
            id: NotificationId::new(),
            scope,
            title: title.to_string(),
            options,
        };
        self.shown.insert(notification.id, notification.clone());
        notification
    }

    /// Dismiss a notification.
    pub fn close(&mut self, id: NotificationId) -> Option<Notification> {
        self.shown.remove(&id)
    }

    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.shown.get(&id)
    }

    /// All notifications shown for `scope`.
    pub fn get_notifications(&self, scope: &Url) -> Vec<&Notification> {
        let mut shown: Vec<&Notification> =
            self.shown.values().filter(|n| &n.scope == scope).collect();
        shown.sort_by_key(|n| n.id.0);
        shown
    }
}
