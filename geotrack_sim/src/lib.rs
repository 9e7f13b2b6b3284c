//! Geotrack Deterministic Simulation Harness
//!
//! Runs the whole dashboard core against an in-process broker and backend
//! under tokio's paused clock, so reconnects, heart-beats and movement runs
//! fire in virtual time and every run replays from its seed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ tokio current-thread runtime (paused clock)          │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                                                             │
//! │  ┌────────────┐   frames    ┌───────────────────────────┐   │
//! │  │ SimBroker  │────────────►│ Dashboard                 │   │
//! │  │ (outages)  │             │  ChannelClient ×2 topics  │   │
//! │  └─────▲──────┘             │  ReconciliationEngine     │   │
//! │        │ publish            │  MovementSimulator        │   │
//! │  ┌─────┴──────┐   CRUD      │                           │   │
//! │  │ SimBackend │◄────────────│  SimMap / alerts / push   │   │
//! │  │ (truth)    │             └───────────────────────────┘   │
//! │  └────────────┘                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use geotrack_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::GeofenceBreach);
//! assert!(result.passed);
//! ```

mod alerts;
mod backend;
mod broker;
mod context;
mod exporter;
mod map;
mod runner;
pub mod scenarios;
mod world;

pub use alerts::{RecordingAlerts, SimPush};
pub use backend::{distance_meters, is_outside, BackendStats, SimBackend};
pub use broker::{BrokerStats, SimBroker, SimConnection, SimTransport};
pub use context::SimContext;
pub use exporter::{ObjectFrame, SessionEvent, SessionExport, SessionFrame};
pub use map::{MapEvent, MarkerHandle, OverlayHandle, SimMap};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{same_position, SimConfig, SimDashboard, SimWorld};
