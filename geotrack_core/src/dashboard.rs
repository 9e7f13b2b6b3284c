//! Dashboard Controller - orchestrates the core against user actions.
//!
//! The controller is driven by a single task. It owns the engine, the
//! channel client, the active simulation runs and the session:
//!
//! ```text
//!  locations ───────┐
//!  notifications ───┼──> next_inbound() ──> dispatch() ──> ReconciliationEngine ──> map
//!  simulation runs ─┘                           │
//!                                               └──> TrackerApi (submit / list_objects)
//! ```
//!
//! Every mutating CRUD call is followed by `list_objects()` and a full
//! refresh. A failed refresh is reported and the collection keeps its
//! last known good state.

use crate::alert::{Alert, AlertSink, NoAlerts};
use crate::api::{ApiError, NoPush, PushRegistrar, TrackerApi};
use crate::channel::{ChannelClient, ConnectivityFlags, Subscription};
use crate::config::TrackerConfig;
use crate::engine::ReconciliationEngine;
use crate::map_diff::{MapDiff, MapRenderer};
use crate::model::{
    Geofence, GeofenceRequest, LatLng, LocationEvent, LocationUpdate, NotificationEvent,
    ObjectId, ObjectPreset, TrackedObject, TrackedObjectRequest,
};
use crate::session::Session;
use crate::simulator::{MovementSimulator, SimulatedStep, SimulationError, SimulationRun};
use geotrack_env::{ChannelTransport, TrackerContext};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DashboardError {
    #[error("Backend error: {0}")]
    Api(#[from] ApiError),

    #[error("Simulation error: {0}")]
    Simulation(#[from] SimulationError),

    #[error("Not authenticated")]
    Unauthenticated,

    #[error("No active session")]
    NoSession,

    #[error("No object selected")]
    NoSelection,

    #[error("Unknown object {0}")]
    UnknownObject(ObjectId),

    #[error("Object {0} is already being simulated")]
    SimulationActive(ObjectId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// One event from any inbound source.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Location(LocationEvent),
    Notification(NotificationEvent),
    SimulationStep(SimulatedStep),
}

pub struct Dashboard<Ctx, T, A, R>
where
    Ctx: TrackerContext,
    T: ChannelTransport,
    A: TrackerApi,
    R: MapRenderer,
{
    ctx: Arc<Ctx>,
    api: Arc<A>,
    channels: ChannelClient<Ctx, T>,
    simulator: MovementSimulator<Ctx>,
    engine: ReconciliationEngine<R>,
    alerts: Arc<dyn AlertSink>,
    push: Arc<dyn PushRegistrar>,
    config: TrackerConfig,

    session: Option<Session>,
    locations: Option<Subscription<LocationEvent>>,
    notifications: Option<Subscription<NotificationEvent>>,
    simulations: StreamMap<ObjectId, SimulationRun>,
}

impl<Ctx, T, A, R> Dashboard<Ctx, T, A, R>
where
    Ctx: TrackerContext,
    T: ChannelTransport,
    A: TrackerApi,
    R: MapRenderer,
{
    /// Creates a controller with no session.
    ///
    /// # Arguments
    /// * `ctx` - Environment context (clock, spawn, randomness)
    /// * `transport` - Push channel transport
    /// * `api` - CRUD backend
    /// * `renderer` - Map widget
    /// * `config` - Session configuration
    pub fn new(
        ctx: Arc<Ctx>,
        transport: Arc<T>,
        api: Arc<A>,
        renderer: R,
        config: TrackerConfig,
    ) -> Self {
        Self {
            channels: ChannelClient::new(ctx.clone(), transport, config.channel.clone()),
            simulator: MovementSimulator::new(ctx.clone(), config.simulation),
            engine: ReconciliationEngine::new(renderer, config.ledger_capacity),
            ctx,
            api,
            alerts: Arc::new(NoAlerts),
            push: Arc::new(NoPush),
            config,
            session: None,
            locations: None,
            notifications: None,
            simulations: StreamMap::new(),
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_push(mut self, push: Arc<dyn PushRegistrar>) -> Self {
        self.push = push;
        self
    }

    // ========================================================================
    // SESSION LIFECYCLE
    // ========================================================================

    /// Loads the user, draws the geofence, loads objects, subscribes both
    /// topics and registers the push token.
    pub async fn start_session(&mut self) -> Result<(), DashboardError> {
        if self.session.is_some() {
            self.teardown();
        }

        let user = self.api.current_user().await.map_err(|e| match e {
            ApiError::Unauthorized => DashboardError::Unauthenticated,
            other => DashboardError::Api(other),
        })?;
        let user_id = user.user_id;
        info!(user = %user_id, username = %user.username, "session starting");

        self.engine
            .set_geofence(user.geofence(self.config.default_geofence_radius_m));
        self.session = Some(Session::new(user, self.ctx.now()));

        if let Err(e) = self.refresh().await {
            warn!(error = %e, "initial load failed");
            self.teardown();
            return Err(e);
        }

        self.locations = Some(self.channels.locations(user_id));
        self.notifications = Some(self.channels.notifications(user_id));

        self.register_push().await;
        info!(user = %user_id, objects = self.engine.objects().len(), "session started");
        Ok(())
    }

    async fn register_push(&self) {
        if !self.push.permission().is_granted() {
            debug!("push permission not granted, skipping token registration");
            return;
        }
        let Some(token) = self.push.device_token().await else {
            warn!("push permission granted but no device token available");
            return;
        };
        match self.api.register_device_token(&token).await {
            Ok(()) => debug!("device token registered"),
            Err(e) => warn!(error = %e, "device token registration failed"),
        }
    }

    /// Cancels simulations, disconnects channels and clears session state.
    /// Idempotent.
    pub fn teardown(&mut self) {
        let ids: Vec<ObjectId> = self.simulations.keys().copied().collect();
        for id in ids {
            if let Some(mut run) = self.simulations.remove(&id) {
                run.cancel();
            }
        }

        self.channels.disconnect();
        self.locations = None;
        self.notifications = None;

        if let Some(session) = self.session.take() {
            info!(user = %session.user_id(), "session ended");
        }
        self.engine.reset();
    }

    // ========================================================================
    // INBOUND PUMP
    // ========================================================================

    /// Reloads the authoritative collection.
    pub async fn refresh(&mut self) -> Result<MapDiff, DashboardError> {
        if self.session.is_none() {
            return Err(DashboardError::NoSession);
        }
        let objects = self.api.list_objects().await?;
        Ok(self.engine.apply_full_refresh(objects))
    }

    /// Waits for the next event from any source.
    ///
    /// Returns `None` when every source is closed.
    pub async fn next_inbound(&mut self) -> Option<Inbound> {
        let has_runs = !self.simulations.is_empty();
        tokio::select! {
            Some(event) = recv_from(&mut self.locations) => Some(Inbound::Location(event)),
            Some(event) = recv_from(&mut self.notifications) => Some(Inbound::Notification(event)),
            Some((_, step)) = self.simulations.next(), if has_runs => Some(Inbound::SimulationStep(step)),
            else => None,
        }
    }

    /// Applies one inbound event.
    pub async fn dispatch(&mut self, inbound: Inbound) -> Result<(), DashboardError> {
        match inbound {
            Inbound::Location(event) => {
                self.engine.apply_location_update(&event);
                Ok(())
            }
            Inbound::Notification(event) => {
                let alert = Alert::from_notification(&event);
                let refresh = self.engine.apply_notification(event);
                if self.push.permission().is_granted() {
                    self.alerts.deliver(alert);
                }
                debug!(object = %refresh.object_id, "reloading after notification");
                self.refresh().await.map(|_| ())
            }
            Inbound::SimulationStep(step) => {
                if let Err(e) = self.api.update_location(step.update()).await {
                    warn!(object = %step.object_id, step = step.step_index, error = %e, "simulated step dropped");
                    return Ok(());
                }
                self.refresh().await.map(|_| ())
            }
        }
    }

    /// Pumps inbound events until `stop` resolves or every source closes.
    ///
    /// Per-event failures are logged, never propagated.
    pub async fn run_until<F>(&mut self, stop: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);
        loop {
            let inbound = tokio::select! {
                _ = &mut stop => break,
                inbound = self.next_inbound() => inbound,
            };
            let Some(inbound) = inbound else {
                debug!("all inbound sources closed");
                break;
            };
            if let Err(e) = self.dispatch(inbound).await {
                warn!(error = %e, "inbound event failed");
            }
        }
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    /// Toggles the selection; returns the selected id, if any.
    pub fn select_object(&mut self, id: ObjectId) -> Option<ObjectId> {
        self.engine.toggle_selection(id)
    }

    /// Moves the selected object to a clicked map position.
    pub async fn place_selected(&mut self, position: LatLng) -> Result<(), DashboardError> {
        let id = self.engine.selection().ok_or(DashboardError::NoSelection)?;
        self.api
            .update_location(LocationUpdate {
                object_id: id,
                latitude: position.lat,
                longitude: position.lng,
            })
            .await?;
        self.engine.clear_selection();
        self.refresh().await?;
        Ok(())
    }

    /// Creates an object. Empty names and glyphs are rejected locally.
    pub async fn add_object(
        &mut self,
        request: TrackedObjectRequest,
    ) -> Result<TrackedObject, DashboardError> {
        if self.session.is_none() {
            return Err(DashboardError::NoSession);
        }
        if request.name.trim().is_empty() {
            return Err(DashboardError::InvalidRequest("name is empty".into()));
        }
        if request.icon.as_deref().map_or(true, |icon| icon.trim().is_empty()) {
            return Err(DashboardError::InvalidRequest("glyph is empty".into()));
        }

        self.engine.clear_selection();
        let created = self.api.create_object(request).await?;
        info!(object = %created.id, name = %created.name, "object created");
        self.refresh().await?;
        self.reload_user().await;
        Ok(created)
    }

    pub async fn add_preset(
        &mut self,
        preset: &ObjectPreset,
    ) -> Result<TrackedObject, DashboardError> {
        self.add_object(preset.request()).await
    }

    pub async fn delete_object(&mut self, id: ObjectId) -> Result<(), DashboardError> {
        if self.session.is_none() {
            return Err(DashboardError::NoSession);
        }
        if let Some(mut run) = self.simulations.remove(&id) {
            run.cancel();
        }
        self.api.delete_object(id).await?;
        if self.engine.selection() == Some(id) {
            self.engine.clear_selection();
        }
        info!(object = %id, "object deleted");
        self.refresh().await?;
        self.reload_user().await;
        Ok(())
    }

    /// Persists a new geofence and redraws the overlay.
    pub async fn save_geofence(
        &mut self,
        request: GeofenceRequest,
    ) -> Result<Geofence, DashboardError> {
        if self.session.is_none() {
            return Err(DashboardError::NoSession);
        }
        if !(request.radius_meters > 0.0) {
            return Err(DashboardError::InvalidRequest("radius must be positive".into()));
        }

        let user = self.api.update_geofence(request).await?;
        let geofence = user
            .geofence(self.config.default_geofence_radius_m)
            .unwrap_or_else(|| {
                Geofence::new(
                    LatLng::new(request.center_lat, request.center_lng),
                    request.radius_meters,
                )
            });
        self.engine.set_geofence(Some(geofence));
        if let Some(session) = self.session.as_mut() {
            session.set_user(user);
        }
        info!(radius_m = geofence.radius_meters, "geofence saved");
        self.refresh().await?;
        Ok(geofence)
    }

    /// Starts a movement run for a placed object.
    pub fn simulate_movement(&mut self, id: ObjectId) -> Result<(), DashboardError> {
        if self.session.is_none() {
            return Err(DashboardError::NoSession);
        }
        let object = self
            .engine
            .objects()
            .get(id)
            .ok_or(DashboardError::UnknownObject(id))?;
        if self.simulations.contains_key(&id) {
            return Err(DashboardError::SimulationActive(id));
        }
        let run = self.simulator.start(object, self.engine.geofence())?;
        self.simulations.insert(id, run);
        Ok(())
    }

    /// Cancels a run; returns false if none was active.
    pub fn cancel_simulation(&mut self, id: ObjectId) -> bool {
        match self.simulations.remove(&id) {
            Some(mut run) => {
                run.cancel();
                true
            }
            None => false,
        }
    }

    pub fn clear_notification(&mut self, index: usize) -> Option<NotificationEvent> {
        self.engine.ledger_mut().clear(index)
    }

    pub fn clear_notifications(&mut self) {
        self.engine.ledger_mut().clear_all();
    }

    pub fn mark_notifications_read(&mut self) {
        self.engine.ledger_mut().mark_read();
    }

    async fn reload_user(&mut self) {
        match self.api.current_user().await {
            Ok(user) => {
                if let Some(session) = self.session.as_mut() {
                    session.set_user(user);
                }
            }
            Err(e) => warn!(error = %e, "user reload failed"),
        }
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn engine(&self) -> &ReconciliationEngine<R> {
        &self.engine
    }

    pub fn connectivity(&self) -> Arc<ConnectivityFlags> {
        self.channels.flags()
    }

    pub fn is_simulating(&self, id: ObjectId) -> bool {
        self.simulations.contains_key(&id)
    }

    pub fn active_simulations(&self) -> usize {
        self.simulations.len()
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }
}

async fn recv_from<M>(subscription: &mut Option<Subscription<M>>) -> Option<M> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => None,
    }
}
