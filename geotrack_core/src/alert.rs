//! Alert side-effect for incoming notifications.

use crate::model::{NotificationEvent, NotificationKind};
use std::time::Duration;

/// Title shared by all alerts.
pub const ALERT_TITLE: &str = "Object Tracker";

/// Non-critical alerts close themselves after this long.
pub const ALERT_AUTO_CLOSE: Duration = Duration::from_secs(5);

/// A user-facing alert derived from one notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub title: String,
    pub body: String,

    /// Alerts with the same tag replace each other
    pub tag: String,

    pub require_interaction: bool,
    pub auto_close: Option<Duration>,
}

impl Alert {
    pub fn from_notification(event: &NotificationEvent) -> Self {
        let exit = event.kind == NotificationKind::GeofenceExit;
        let marker = if exit { "🚨" } else { "✅" };
        Self {
            title: format!("{marker} {ALERT_TITLE}"),
            body: event.message.clone(),
            tag: format!("notification-{}", event.object_id),
            require_interaction: exit,
            auto_close: (!exit).then_some(ALERT_AUTO_CLOSE),
        }
    }
}

/// Delivers alerts to the user.
pub trait AlertSink: Send + Sync {
    fn deliver(&self, alert: Alert);
}

/// Discards every alert.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAlerts;

impl AlertSink for NoAlerts {
    fn deliver(&self, _alert: Alert) {}
}
