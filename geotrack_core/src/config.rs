//! Session configuration.
//!
//! Plain structs with defaults; JSON files may override any subset of
//! fields (`#[serde(default)]` everywhere).

use crate::ledger::DEFAULT_LEDGER_CAPACITY;
use crate::model::LatLng;
use geotrack_env::{Endpoint, HeartbeatConfig, StompTransport, DEFAULT_MAX_FRAME_BYTES};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Configuration for the push channel client.
///
/// Endpoints are plain STOMP listeners (`host:port`); both topics default
/// to the conventional port 61613 on localhost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Endpoint serving the locations topic
    pub locations: Endpoint,

    /// Endpoint serving the notifications topic
    pub notifications: Endpoint,

    /// Fixed delay before reconnecting after a drop (default: 5000)
    pub reconnect_delay_ms: u64,

    /// Outgoing heart-beat interval (default: 4000)
    pub heartbeat_outgoing_ms: u64,

    /// Expected incoming heart-beat interval (default: 4000)
    pub heartbeat_incoming_ms: u64,

    /// Per-subscription buffer of decoded messages (default: 256)
    pub buffer: usize,

    /// Largest inbound frame before the connection is dropped (default: 1 MiB)
    pub max_frame_bytes: usize,
}

impl ChannelConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            outgoing: Duration::from_millis(self.heartbeat_outgoing_ms),
            incoming: Duration::from_millis(self.heartbeat_incoming_ms),
        }
    }

    /// Builds the production STOMP transport with this config's frame limit.
    pub fn stomp_transport(&self) -> StompTransport {
        StompTransport::new().with_max_frame_bytes(self.max_frame_bytes)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            locations: Endpoint::new("127.0.0.1:61613"),
            notifications: Endpoint::new("127.0.0.1:61613"),
            reconnect_delay_ms: 5000,
            heartbeat_outgoing_ms: 4000,
            heartbeat_incoming_ms: 4000,
            buffer: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Configuration for the movement simulator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Pacing between steps (default: 200)
    pub interval_ms: u64,

    /// Distance per step (default: 10.0)
    pub step_meters: f64,

    /// Number of steps per run (default: 30)
    pub total_steps: u32,
}

impl SimulationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            step_meters: 10.0,
            total_steps: 30,
        }
    }
}

/// Top-level configuration of a tracker session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub channel: ChannelConfig,
    pub simulation: SimulationConfig,

    /// Notifications kept by the ledger (default: 10)
    pub ledger_capacity: usize,

    /// Radius used when the user has a center but no radius (default: 500)
    pub default_geofence_radius_m: f64,

    /// Map center when nothing is placed yet
    pub default_center: LatLng,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            simulation: SimulationConfig::default(),
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            default_geofence_radius_m: 500.0,
            default_center: LatLng::new(46.77, 23.59),
        }
    }
}

impl TrackerConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}
