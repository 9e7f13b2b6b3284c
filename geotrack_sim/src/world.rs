//! SimWorld - the simulation harness container.

use crate::alerts::{RecordingAlerts, SimPush};
use crate::backend::SimBackend;
use crate::broker::{SimBroker, SimTransport};
use crate::context::SimContext;
use crate::exporter::{ObjectFrame, SessionEvent, SessionExport, SessionFrame};
use crate::map::SimMap;

use geotrack_core::simulator::advance;
use geotrack_core::{
    Dashboard, DashboardError, LatLng, ObjectId, PushPermission, Topic, TrackedObject, TrackerConfig,
    User, UserId, OBJECT_PRESETS,
};
use geotrack_env::TrackerContext;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

/// The dashboard as wired inside a simulation.
pub type SimDashboard = Dashboard<SimContext, SimTransport, SimBackend, SimMap>;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Objects seeded into the backend before the session starts
    pub num_objects: usize,

    /// Seeded objects are scattered up to this far from the center
    pub scatter_meters: f64,

    /// Push permission reported by the simulated provider
    pub push_permission: PushPermission,

    /// Dashboard configuration
    pub tracker: TrackerConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_objects: 3,
            scatter_meters: 300.0,
            push_permission: PushPermission::Granted,
            tracker: TrackerConfig::default(),
        }
    }
}

/// The SimWorld - container for the entire simulation.
///
/// Must be built inside a runtime whose clock is paused.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Broker handle for fault injection
    pub broker: SimBroker,

    /// Ground truth
    pub backend: Arc<SimBackend>,

    pub alerts: Arc<RecordingAlerts>,
    pub push: Arc<SimPush>,

    /// System under test
    pub dashboard: SimDashboard,

    /// Seeded object ids, in creation order
    pub objects: Vec<ObjectId>,

    export: Option<SessionExport>,
    pending_events: Vec<SessionEvent>,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Self {
        // Derive a separate seed for object placement
        let placement_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let mut placement = ChaCha8Rng::seed_from_u64(placement_seed);

        let context = SimContext::shared(config.seed);
        let broker = SimBroker::new();
        let center = config.tracker.default_center;

        let user = User {
            user_id: UserId(1),
            username: "sim".into(),
            email: "sim@geotrack.local".into(),
            geofence_center_lat: Some(center.lat),
            geofence_center_lng: Some(center.lng),
            geofence_radius_meters: Some(config.tracker.default_geofence_radius_m),
            tracked_objects: Vec::new(),
        };
        let backend = Arc::new(SimBackend::new(
            context.clone(),
            broker.clone(),
            user,
            config.tracker.default_geofence_radius_m,
        ));

        let objects = (0..config.num_objects)
            .map(|i| {
                let preset = &OBJECT_PRESETS[i % OBJECT_PRESETS.len()];
                let bearing = placement.gen_range(0.0..TAU);
                let distance = placement.gen_range(0.0..config.scatter_meters.max(1.0));
                let position = advance(center, bearing, distance);
                backend.seed_object(preset.name, preset.kind, Some(position))
            })
            .collect();

        let alerts = Arc::new(RecordingAlerts::new());
        let push = Arc::new(SimPush::new(config.push_permission, config.seed));
        let dashboard = Dashboard::new(
            context.clone(),
            Arc::new(broker.transport()),
            backend.clone(),
            SimMap::new(),
            config.tracker.clone(),
        )
        .with_alerts(alerts.clone())
        .with_push(push.clone());

        Self {
            config,
            context,
            broker,
            backend,
            alerts,
            push,
            dashboard,
            objects,
            export: None,
            pending_events: Vec::new(),
        }
    }

    /// Starts the dashboard session and waits for both topics to connect.
    pub async fn start(&mut self) -> Result<(), DashboardError> {
        self.dashboard.start_session().await?;
        self.pump(Duration::from_millis(100)).await;
        self.event("session started");
        Ok(())
    }

    /// Runs the dashboard's inbound pump for `duration` of virtual time.
    pub async fn pump(&mut self, duration: Duration) {
        let ctx = self.context.clone();
        self.dashboard
            .run_until(async move { ctx.sleep(duration).await })
            .await;
        self.capture_frame();
    }

    /// Records an event for the next exported frame.
    pub fn event(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(at_ms = self.context.now().as_millis() as u64, "{message}");
        if self.export.is_some() {
            self.pending_events.push(SessionEvent {
                message,
                level: None,
            });
        }
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub fn client_object(&self, id: ObjectId) -> Option<&TrackedObject> {
        self.dashboard.engine().objects().get(id)
    }

    /// Ids whose client view differs from ground truth.
    pub fn divergence(&self) -> Vec<ObjectId> {
        let truth = self.backend.objects();
        let client = self.dashboard.engine().objects();

        let mut diverged: Vec<ObjectId> = truth
            .iter()
            .filter(|t| !client.get(t.id).map_or(false, |c| same_object(c, t)))
            .map(|t| t.id)
            .collect();
        diverged.extend(client.ids().filter(|id| !truth.iter().any(|t| t.id == *id)));
        diverged
    }

    pub fn is_connected(&self) -> bool {
        let flags = self.dashboard.connectivity();
        flags.is_connected(Topic::Locations) && flags.is_connected(Topic::Notifications)
    }

    pub fn now_secs(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    // ========================================================================
    // EXPORT
    // ========================================================================

    /// Starts recording one frame per pump.
    pub fn enable_export(&mut self, scenario: &str) {
        self.export = Some(SessionExport::new(scenario, self.config.seed));
    }

    pub fn take_export(&mut self) -> Option<SessionExport> {
        self.export.take()
    }

    fn capture_frame(&mut self) {
        if self.export.is_none() {
            return;
        }
        let engine = self.dashboard.engine();
        let flags = self.dashboard.connectivity();
        let frame = SessionFrame {
            time_sec: self.now_secs(),
            ground_truth: self.backend.objects().iter().map(ObjectFrame::of).collect(),
            client: engine.objects().iter().map(ObjectFrame::of).collect(),
            markers: engine.renderer().markers().len(),
            notifications: engine.ledger().len(),
            unread: engine.ledger().unread(),
            locations_connected: flags.is_connected(Topic::Locations),
            notifications_connected: flags.is_connected(Topic::Notifications),
            events: std::mem::take(&mut self.pending_events),
        };
        if let Some(export) = self.export.as_mut() {
            export.add_frame(frame);
        }
    }
}

/// Positions equal up to JSON float round-off.
pub fn same_position(a: Option<LatLng>, b: Option<LatLng>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a.lat - b.lat).abs() < 1e-9 && (a.lng - b.lng).abs() < 1e-9,
        (None, None) => true,
        _ => false,
    }
}

fn same_object(client: &TrackedObject, truth: &TrackedObject) -> bool {
    client.name == truth.name
        && client.kind == truth.kind
        && client.icon == truth.icon
        && client.outside_geofence == truth.outside_geofence
        && same_position(client.position(), truth.position())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_world_seeds_objects_inside_fence() {
        let world = SimWorld::new(SimConfig::default());
        assert_eq!(world.objects.len(), 3);

        let objects = world.backend.objects();
        assert!(objects.iter().all(|o| o.position().is_some()));
        assert!(objects.iter().all(|o| !o.outside_geofence));
    }

    #[tokio::test(start_paused = true)]
    async fn test_world_start_converges() {
        let mut world = SimWorld::new(SimConfig::default());
        world.start().await.unwrap();

        assert!(world.is_connected());
        assert!(world.divergence().is_empty());
        assert_eq!(world.dashboard.engine().renderer().markers().len(), 3);
        assert_eq!(world.backend.device_tokens(), vec![world.push.token().to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_seed_same_layout() {
        let a = SimWorld::new(SimConfig::default()).backend.objects();
        let b = SimWorld::new(SimConfig::default()).backend.objects();
        assert_eq!(a, b);
    }
}
