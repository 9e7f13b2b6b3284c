//! Recording alert sink and scripted push provider.

use async_trait::async_trait;
use geotrack_core::{Alert, AlertSink, PushPermission, PushRegistrar};
use std::sync::Mutex;

/// Collects every delivered alert.
#[derive(Debug, Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AlertSink for RecordingAlerts {
    fn deliver(&self, alert: Alert) {
        tracing::debug!(title = %alert.title, tag = %alert.tag, "alert delivered");
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(alert);
    }
}

/// Push provider with a switchable permission and a fixed token.
#[derive(Debug)]
pub struct SimPush {
    permission: Mutex<PushPermission>,
    token: String,
}

impl SimPush {
    pub fn new(permission: PushPermission, seed: u64) -> Self {
        Self {
            permission: Mutex::new(permission),
            token: format!("sim-device-{seed:016x}"),
        }
    }

    pub fn set_permission(&self, permission: PushPermission) {
        *self.permission.lock().unwrap_or_else(|e| e.into_inner()) = permission;
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[async_trait]
impl PushRegistrar for SimPush {
    fn permission(&self) -> PushPermission {
        *self.permission.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn device_token(&self) -> Option<String> {
        Some(self.token.clone())
    }
}
