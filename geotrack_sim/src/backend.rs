//! In-memory ground-truth backend.
//!
//! Implements `TrackerApi` for one user and plays the server's role on the
//! push side: every location change is broadcast on the user's locations
//! topic, and crossing the geofence boundary publishes a
//! `GEOFENCE_EXIT` / `GEOFENCE_ENTER` notification.

use crate::broker::SimBroker;
use crate::context::SimContext;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use geo::{HaversineDistance, Point};
use geotrack_core::channel::Topic;
use geotrack_core::{
    ApiError, Geofence, GeofenceRequest, LatLng, LocationEvent, LocationUpdate,
    NotificationEvent, NotificationKind, ObjectId, TrackedObject, TrackedObjectRequest,
    TrackerApi, User,
};
use geotrack_env::TrackerContext;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Haversine distance between two positions, in meters.
pub fn distance_meters(a: LatLng, b: LatLng) -> f64 {
    Point::new(a.lng, a.lat).haversine_distance(&Point::new(b.lng, b.lat))
}

/// Whether `position` lies outside `geofence`.
pub fn is_outside(geofence: &Geofence, position: LatLng) -> bool {
    distance_meters(geofence.center, position) > geofence.radius_meters
}

/// Counters collected by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub list_calls: u64,
    pub failed_lists: u64,
    pub location_updates: u64,
    pub notifications: u64,
}

struct BackendState {
    user: User,
    authorized: bool,
    objects: IndexMap<ObjectId, TrackedObject>,
    next_id: i64,
    fail_lists: u32,
    device_tokens: Vec<String>,
    stats: BackendStats,
}

pub struct SimBackend {
    ctx: Arc<SimContext>,
    broker: SimBroker,
    default_radius: f64,
    state: Mutex<BackendState>,
}

impl SimBackend {
    /// Creates a backend serving `user`.
    ///
    /// # Arguments
    /// * `ctx` - Simulation context (notification timestamps)
    /// * `broker` - Broker the push topics are published on
    /// * `user` - The single authenticated user
    /// * `default_radius` - Radius used when the user has a center only
    pub fn new(ctx: Arc<SimContext>, broker: SimBroker, user: User, default_radius: f64) -> Self {
        Self {
            ctx,
            broker,
            default_radius,
            state: Mutex::new(BackendState {
                user,
                authorized: true,
                objects: IndexMap::new(),
                next_id: 1,
                fail_lists: 0,
                device_tokens: Vec::new(),
                stats: BackendStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        // A poisoned lock only follows a panic elsewhere in the run
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // FAULT INJECTION & INSPECTION
    // ========================================================================

    /// Makes the next `n` `list_objects` calls fail.
    pub fn fail_next_lists(&self, n: u32) {
        self.lock().fail_lists = n;
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.lock().authorized = authorized;
    }

    /// Inserts an object directly, without any broadcast.
    pub fn seed_object(&self, name: &str, kind: geotrack_core::ObjectKind, position: Option<LatLng>) -> ObjectId {
        let mut state = self.lock();
        let id = ObjectId(state.next_id);
        state.next_id += 1;
        let outside = match (position, geofence_of(&state.user, self.default_radius)) {
            (Some(pos), Some(fence)) => is_outside(&fence, pos),
            _ => false,
        };
        state.objects.insert(
            id,
            TrackedObject {
                id,
                name: name.to_string(),
                kind,
                icon: Some(kind.fallback_glyph().to_string()),
                latitude: position.map(|p| p.lat),
                longitude: position.map(|p| p.lng),
                outside_geofence: outside,
            },
        );
        id
    }

    /// Moves an object as a physical device report would.
    pub fn move_object(&self, id: ObjectId, position: LatLng) -> Result<(), ApiError> {
        self.relocate(id, position)
    }

    pub fn object(&self, id: ObjectId) -> Option<TrackedObject> {
        self.lock().objects.get(&id).cloned()
    }

    pub fn objects(&self) -> Vec<TrackedObject> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn geofence(&self) -> Option<Geofence> {
        geofence_of(&self.lock().user, self.default_radius)
    }

    pub fn device_tokens(&self) -> Vec<String> {
        self.lock().device_tokens.clone()
    }

    pub fn stats(&self) -> BackendStats {
        self.lock().stats
    }

    pub fn user(&self) -> User {
        self.lock().user.clone()
    }

    // ========================================================================
    // PUSH SIDE
    // ========================================================================

    fn relocate(&self, id: ObjectId, position: LatLng) -> Result<(), ApiError> {
        let mut state = self.lock();
        let fence = geofence_of(&state.user, self.default_radius);
        let user_id = state.user.user_id;

        let obj = state.objects.get_mut(&id).ok_or(ApiError::NotFound(id))?;
        let was_outside = obj.outside_geofence;
        obj.latitude = Some(position.lat);
        obj.longitude = Some(position.lng);
        obj.outside_geofence = fence.map_or(false, |f| is_outside(&f, position));

        let location = LocationEvent {
            object_id: id,
            name: obj.name.clone(),
            kind: kind_name(obj),
            latitude: position.lat,
            longitude: position.lng,
            outside_geofence: obj.outside_geofence,
        };

        let transition = match (was_outside, obj.outside_geofence) {
            (false, true) => Some((
                NotificationKind::GeofenceExit,
                format!("{} has left the safe zone", obj.name),
            )),
            (true, false) => Some((
                NotificationKind::GeofenceEnter,
                format!("{} is back in the safe zone", obj.name),
            )),
            _ => None,
        };
        let notification = transition.map(|(kind, message)| NotificationEvent {
            user_id,
            object_id: id,
            object_name: obj.name.clone(),
            object_type: kind_name(obj),
            message,
            kind,
            timestamp: self.timestamp(),
        });
        state.stats.location_updates += 1;
        if notification.is_some() {
            state.stats.notifications += 1;
        }
        drop(state);

        self.broker
            .publish_json(&Topic::Locations.destination(user_id), &location);
        if let Some(event) = notification {
            info!(object = %id, kind = event.kind.as_str(), "geofence transition");
            self.broker
                .publish_json(&Topic::Notifications.destination(user_id), &event);
        }
        Ok(())
    }

    fn timestamp(&self) -> String {
        DateTime::<Utc>::from(self.ctx.system_time()).to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

fn geofence_of(user: &User, default_radius: f64) -> Option<Geofence> {
    user.geofence(default_radius)
}

fn kind_name(obj: &TrackedObject) -> String {
    serde_json::to_value(obj.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "OTHER".to_string())
}

#[async_trait]
impl TrackerApi for SimBackend {
    async fn current_user(&self) -> Result<User, ApiError> {
        let state = self.lock();
        if !state.authorized {
            return Err(ApiError::Unauthorized);
        }
        let mut user = state.user.clone();
        user.tracked_objects = state.objects.values().cloned().collect();
        Ok(user)
    }

    async fn list_objects(&self) -> Result<Vec<TrackedObject>, ApiError> {
        let mut state = self.lock();
        state.stats.list_calls += 1;
        if state.fail_lists > 0 {
            state.fail_lists -= 1;
            state.stats.failed_lists += 1;
            return Err(ApiError::Transport("injected list failure".into()));
        }
        Ok(state.objects.values().cloned().collect())
    }

    async fn create_object(&self, request: TrackedObjectRequest) -> Result<TrackedObject, ApiError> {
        if request.name.trim().is_empty() {
            return Err(ApiError::Rejected("name is required".into()));
        }
        let position = match (request.latitude, request.longitude) {
            (Some(lat), Some(lng)) => Some(LatLng::new(lat, lng)),
            _ => None,
        };
        let id = self.seed_object(&request.name, request.kind, position);

        let mut state = self.lock();
        let obj = state.objects.get_mut(&id).ok_or(ApiError::NotFound(id))?;
        obj.icon = request.icon;
        debug!(object = %id, name = %obj.name, "object created");
        Ok(obj.clone())
    }

    async fn delete_object(&self, id: ObjectId) -> Result<(), ApiError> {
        self.lock()
            .objects
            .shift_remove(&id)
            .map(|_| ())
            .ok_or(ApiError::NotFound(id))
    }

    async fn update_location(&self, update: LocationUpdate) -> Result<(), ApiError> {
        self.relocate(update.object_id, LatLng::new(update.latitude, update.longitude))
    }

    async fn update_geofence(&self, request: GeofenceRequest) -> Result<User, ApiError> {
        let mut state = self.lock();
        state.user.geofence_center_lat = Some(request.center_lat);
        state.user.geofence_center_lng = Some(request.center_lng);
        state.user.geofence_radius_meters = Some(request.radius_meters);

        // Membership is recomputed silently; only movement notifies
        let fence = geofence_of(&state.user, self.default_radius);
        for obj in state.objects.values_mut() {
            if let (Some(pos), Some(fence)) = (obj.position(), fence) {
                obj.outside_geofence = is_outside(&fence, pos);
            }
        }
        Ok(state.user.clone())
    }

    async fn register_device_token(&self, token: &str) -> Result<(), ApiError> {
        self.lock().device_tokens.push(token.to_string());
        Ok(())
    }
}
