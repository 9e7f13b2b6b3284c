//! GeoTrack Core - real-time state synchronization for a location-tracking
//! dashboard.
//!
//! Three independent, asynchronously arriving sources are reconciled against
//! one authoritative object collection and a derived map rendering:
//! 1. **Locations topic**: incremental position facts, last applied wins
//! 2. **Notifications topic**: geofence transitions, answered by a full reload
//! 3. **Movement simulator**: paced synthetic relocations submitted as CRUD
//!
//! The [`Dashboard`] drives all of them from a single task; the
//! [`ReconciliationEngine`] is the only writer of object state.

pub mod alert;
pub mod api;
pub mod channel;
pub mod collection;
pub mod config;
pub mod dashboard;
pub mod engine;
pub mod ledger;
pub mod map_diff;
pub mod model;
pub mod session;
pub mod simulator;

// Re-export key types for convenience
pub use alert::{Alert, AlertSink, NoAlerts, ALERT_AUTO_CLOSE, ALERT_TITLE};
pub use api::{ApiError, NoPush, PushPermission, PushRegistrar, TrackerApi};
pub use channel::{ChannelClient, ConnectivityFlags, Subscription, Topic};
pub use collection::ObjectCollection;
pub use config::{ChannelConfig, ConfigError, SimulationConfig, TrackerConfig};
pub use dashboard::{Dashboard, DashboardError, Inbound};
pub use engine::{ReconciliationEngine, RefreshRequired};
pub use ledger::NotificationLedger;
pub use map_diff::{diff_markers, MapDiff, MapRenderer, MarkerOp, MarkerState};
pub use model::{
    Geofence, GeofenceRequest, LatLng, LocationEvent, LocationUpdate, NotificationEvent,
    NotificationKind, ObjectId, ObjectKind, ObjectPreset, TrackedObject, TrackedObjectRequest,
    User, UserId, OBJECT_PRESETS,
};
pub use session::Session;
pub use simulator::{MovementPath, MovementSimulator, SimulatedStep, SimulationError, SimulationRun};
