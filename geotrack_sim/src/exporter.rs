//! JSON exporter for session replays.
//!
//! Exports periodic snapshots of the client-side view next to the
//! backend's ground truth, so divergence can be inspected offline.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

/// A single frame of session data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Backend ground truth
    pub ground_truth: Vec<ObjectFrame>,

    /// The dashboard's reconciled collection
    pub client: Vec<ObjectFrame>,

    /// Markers currently drawn
    pub markers: usize,

    /// Ledger size and unread count
    pub notifications: usize,
    pub unread: usize,

    /// Channel connectivity hints
    pub locations_connected: bool,
    pub notifications_connected: bool,

    /// Events (outages, cancellations, etc.)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<SessionEvent>,
}

/// One object as seen by one side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectFrame {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    pub outside: bool,
}

impl ObjectFrame {
    pub fn of(obj: &geotrack_core::TrackedObject) -> Self {
        Self {
            id: obj.id.0,
            name: obj.name.clone(),
            lat: obj.latitude,
            lng: obj.longitude,
            outside: obj.outside_geofence,
        }
    }
}

/// Session event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Complete session export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SessionFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SessionExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SessionFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_tracks_duration() {
        let mut export = SessionExport::new("geofence_breach", 42);
        for t in [0.5, 1.0, 1.5] {
            export.add_frame(SessionFrame {
                time_sec: t,
                ground_truth: Vec::new(),
                client: Vec::new(),
                markers: 0,
                notifications: 0,
                unread: 0,
                locations_connected: true,
                notifications_connected: true,
                events: Vec::new(),
            });
        }
        export.finalize(true, None);

        assert_eq!(export.duration_sec, 1.5);
        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["frames"].as_array().unwrap().len(), 3);
        assert!(json.get("failure_reason").is_none());
        assert!(json["frames"][0].get("events").is_none());
    }
}
