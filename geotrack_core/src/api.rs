//! Collaborator interfaces: the CRUD backend and the push provider.

use crate::model::{
    GeofenceRequest, LocationUpdate, ObjectId, TrackedObject, TrackedObjectRequest, User,
};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Not authenticated")]
    Unauthorized,

    #[error("Object {0} not found")]
    NotFound(ObjectId),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Backend unreachable: {0}")]
    Transport(String),
}

/// The authoritative backend, as seen by the dashboard.
///
/// Every mutating call is followed by `list_objects()` on the caller side;
/// implementations need not return the mutated state.
#[async_trait]
pub trait TrackerApi: Send + Sync + 'static {
    async fn current_user(&self) -> Result<User, ApiError>;

    async fn list_objects(&self) -> Result<Vec<TrackedObject>, ApiError>;

    async fn create_object(&self, request: TrackedObjectRequest) -> Result<TrackedObject, ApiError>;

    async fn delete_object(&self, id: ObjectId) -> Result<(), ApiError>;

    async fn update_location(&self, update: LocationUpdate) -> Result<(), ApiError>;

    async fn update_geofence(&self, request: GeofenceRequest) -> Result<User, ApiError>;

    async fn register_device_token(&self, token: &str) -> Result<(), ApiError>;
}

/// Alert permission as reported by the push provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushPermission {
    Granted,
    Denied,
    /// Not asked yet
    #[default]
    Default,
}

impl PushPermission {
    pub fn is_granted(&self) -> bool {
        matches!(self, PushPermission::Granted)
    }
}

/// Push-delivery collaborator. Yields an opaque device token.
#[async_trait]
pub trait PushRegistrar: Send + Sync + 'static {
    fn permission(&self) -> PushPermission;

    /// `None` when no token could be obtained.
    async fn device_token(&self) -> Option<String>;
}

/// Registrar for environments without push delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPush;

#[async_trait]
impl PushRegistrar for NoPush {
    fn permission(&self) -> PushPermission {
        PushPermission::Denied
    }

    async fn device_token(&self) -> Option<String> {
        None
    }
}
