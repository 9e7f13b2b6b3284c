//! Common types for the GeoTrack environment abstraction.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Address of one STOMP broker listener (one logical topic group).
///
/// Frames travel over a plain TCP socket; there is no HTTP upgrade, so an
/// endpoint is only `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    /// `host:port` of the broker's STOMP listener
    pub address: String,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Returns the host part of the address (used as the STOMP `host` header).
    pub fn host(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.address)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

/// Heart-beat intervals negotiated with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// How often we send a probe
    pub outgoing: Duration,

    /// How often we expect a probe from the broker
    pub incoming: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            outgoing: Duration::from_millis(4000),
            incoming: Duration::from_millis(4000),
        }
    }
}

/// A frame delivered by a channel connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A payload published on a destination the connection subscribed to.
    Message {
        /// Topic destination, e.g. `/topic/locations/7`
        destination: String,

        /// Raw (JSON) body
        body: String,
    },

    /// A liveness probe from the broker.
    Heartbeat,
}

impl Frame {
    /// Creates a message frame.
    pub fn message(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Message {
            destination: destination.into(),
            body: body.into(),
        }
    }
}
