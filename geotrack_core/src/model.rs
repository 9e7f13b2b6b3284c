//! Wire and domain types shared by every layer of the tracker.
//!
//! All payload types serialize with the backend's camelCase field names
//! (the category field is called `type` on the wire), so topic messages
//! and CRUD bodies round-trip bit-exact.

use serde::{Deserialize, Serialize};

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Backend-assigned identity of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub i64);

/// Backend-assigned identity of a user (owner of the topics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// GEOMETRY
// ============================================================================

/// A WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Circular safe zone, global to the session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub center: LatLng,
    pub radius_meters: f64,
}

impl Geofence {
    pub fn new(center: LatLng, radius_meters: f64) -> Self {
        Self {
            center,
            radius_meters,
        }
    }

    /// Builds the request that would persist this geofence.
    pub fn to_request(&self) -> GeofenceRequest {
        GeofenceRequest {
            center_lat: self.center.lat,
            center_lng: self.center.lng,
            radius_meters: self.radius_meters,
        }
    }
}

// ============================================================================
// TRACKED OBJECTS
// ============================================================================

/// Category of a tracked object. Unknown wire values decode as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectKind {
    Keys,
    Bicycle,
    Bag,
    Laptop,
    Phone,
    #[default]
    #[serde(other)]
    Other,
}

impl ObjectKind {
    /// Glyph shown when the object has no icon of its own.
    pub fn fallback_glyph(&self) -> &'static str {
        match self {
            ObjectKind::Keys => "🔑",
            ObjectKind::Bicycle => "🚲",
            ObjectKind::Bag => "🎒",
            ObjectKind::Laptop => "💻",
            ObjectKind::Phone => "📱",
            ObjectKind::Other => "📍",
        }
    }
}

/// A physical object registered by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedObject {
    pub id: ObjectId,

    pub name: String,

    #[serde(rename = "type", default)]
    pub kind: ObjectKind,

    /// Optional glyph chosen by the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Absent until the object is first placed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,

    /// Backend-asserted geofence membership; mirrored, never recomputed
    #[serde(default)]
    pub outside_geofence: bool,
}

impl TrackedObject {
    /// Returns the position when both coordinates are known.
    pub fn position(&self) -> Option<LatLng> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some(LatLng::new(lat, lng)),
            _ => None,
        }
    }

    /// The icon if set, otherwise the category fallback.
    pub fn glyph(&self) -> &str {
        match self.icon.as_deref() {
            Some(icon) if !icon.is_empty() => icon,
            _ => self.kind.fallback_glyph(),
        }
    }
}

/// A preset offered by the add-object flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectPreset {
    pub name: &'static str,
    pub glyph: &'static str,
    pub kind: ObjectKind,
}

impl ObjectPreset {
    /// The create request for this preset (unplaced).
    pub fn request(&self) -> TrackedObjectRequest {
        TrackedObjectRequest {
            name: self.name.to_string(),
            kind: self.kind,
            icon: Some(self.glyph.to_string()),
            latitude: None,
            longitude: None,
        }
    }
}

/// Predefined object types with glyphs.
pub const OBJECT_PRESETS: &[ObjectPreset] = &[
    ObjectPreset { name: "Keys", glyph: "🔑", kind: ObjectKind::Keys },
    ObjectPreset { name: "Bicycle", glyph: "🚲", kind: ObjectKind::Bicycle },
    ObjectPreset { name: "Backpack", glyph: "🎒", kind: ObjectKind::Bag },
    ObjectPreset { name: "Laptop", glyph: "💻", kind: ObjectKind::Laptop },
    ObjectPreset { name: "Phone", glyph: "📱", kind: ObjectKind::Phone },
    ObjectPreset { name: "Wallet", glyph: "👛", kind: ObjectKind::Other },
    ObjectPreset { name: "Car", glyph: "🚗", kind: ObjectKind::Other },
    ObjectPreset { name: "Pet", glyph: "🐕", kind: ObjectKind::Other },
    ObjectPreset { name: "Watch", glyph: "⌚", kind: ObjectKind::Other },
    ObjectPreset { name: "Headphones", glyph: "🎧", kind: ObjectKind::Other },
    ObjectPreset { name: "Camera", glyph: "📷", kind: ObjectKind::Other },
    ObjectPreset { name: "Umbrella", glyph: "☂️", kind: ObjectKind::Other },
];

// ============================================================================
// USER / SESSION
// ============================================================================

/// The authenticated user as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: UserId,
    pub username: String,
    pub email: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geofence_center_lat: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geofence_center_lng: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geofence_radius_meters: Option<f64>,

    #[serde(default)]
    pub tracked_objects: Vec<TrackedObject>,
}

impl User {
    /// The configured geofence; a missing radius falls back to `default_radius`.
    pub fn geofence(&self, default_radius: f64) -> Option<Geofence> {
        let lat = self.geofence_center_lat?;
        let lng = self.geofence_center_lng?;
        let radius = self.geofence_radius_meters.unwrap_or(default_radius);
        Some(Geofence::new(LatLng::new(lat, lng), radius))
    }
}

// ============================================================================
// REQUESTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedObjectRequest {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ObjectKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceRequest {
    pub center_lat: f64,
    pub center_lng: f64,
    pub radius_meters: f64,
}

/// A position submission for one object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub object_id: ObjectId,
    pub latitude: f64,
    pub longitude: f64,
}

// ============================================================================
// TOPIC PAYLOADS
// ============================================================================

/// Location topic payload: a fact about one object at one instant.
///
/// No sequence number; the last event applied wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationEvent {
    pub object_id: ObjectId,
    pub name: String,

    /// Category as sent by the backend (kept verbatim)
    #[serde(rename = "type")]
    pub kind: String,

    pub latitude: f64,
    pub longitude: f64,
    pub outside_geofence: bool,
}

impl LocationEvent {
    pub fn position(&self) -> LatLng {
        LatLng::new(self.latitude, self.longitude)
    }
}

/// Kind of a notification. Unknown strings are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationKind {
    GeofenceExit,
    GeofenceEnter,
    Other(String),
}

impl NotificationKind {
    pub fn as_str(&self) -> &str {
        match self {
            NotificationKind::GeofenceExit => "GEOFENCE_EXIT",
            NotificationKind::GeofenceEnter => "GEOFENCE_ENTER",
            NotificationKind::Other(raw) => raw,
        }
    }
}

impl From<String> for NotificationKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "GEOFENCE_EXIT" => NotificationKind::GeofenceExit,
            "GEOFENCE_ENTER" => NotificationKind::GeofenceEnter,
            _ => NotificationKind::Other(raw),
        }
    }
}

impl From<NotificationKind> for String {
    fn from(kind: NotificationKind) -> Self {
        match kind {
            NotificationKind::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

/// Notification topic payload. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub user_id: UserId,
    pub object_id: ObjectId,
    pub object_name: String,
    pub object_type: String,
    pub message: String,

    #[serde(rename = "type")]
    pub kind: NotificationKind,

    /// ISO-8601, kept as sent
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_location_payload_wire_names() {
        let raw = json!({
            "objectId": 3,
            "name": "Keys",
            "type": "KEYS",
            "latitude": 46.77,
            "longitude": 23.59,
            "outsideGeofence": true
        });

        let event: LocationEvent = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(event.object_id, ObjectId(3));
        assert!(event.outside_geofence);
        assert_eq!(serde_json::to_value(&event).unwrap(), raw);
    }

    #[test]
    fn test_notification_kind_preserves_unknown() {
        let raw = json!({
            "userId": 1,
            "objectId": 2,
            "objectName": "Bike",
            "objectType": "BICYCLE",
            "message": "Bike battery low",
            "type": "BATTERY_LOW",
            "timestamp": "2024-05-01T10:00:00Z"
        });

        let event: NotificationEvent = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(event.kind, NotificationKind::Other("BATTERY_LOW".into()));
        assert_eq!(serde_json::to_value(&event).unwrap(), raw);

        let exit: NotificationKind = serde_json::from_value(json!("GEOFENCE_EXIT")).unwrap();
        assert_eq!(exit, NotificationKind::GeofenceExit);
    }

    #[test]
    fn test_tracked_object_unplaced_and_unknown_kind() {
        let obj: TrackedObject = serde_json::from_value(json!({
            "id": 9,
            "name": "Drone",
            "type": "DRONE",
            "outsideGeofence": false
        }))
        .unwrap();

        assert_eq!(obj.kind, ObjectKind::Other);
        assert_eq!(obj.position(), None);
        assert_eq!(obj.glyph(), "📍");
    }

    #[test]
    fn test_glyph_prefers_icon() {
        let mut obj = TrackedObject {
            id: ObjectId(1),
            name: "Keys".into(),
            kind: ObjectKind::Keys,
            icon: None,
            latitude: Some(0.0),
            longitude: Some(0.0),
            outside_geofence: false,
        };
        assert_eq!(obj.glyph(), "🔑");
        // Zero is a valid coordinate, not "unplaced"
        assert_eq!(obj.position(), Some(LatLng::new(0.0, 0.0)));

        obj.icon = Some("🗝️".into());
        assert_eq!(obj.glyph(), "🗝️");
    }

    #[test]
    fn test_user_geofence_default_radius() {
        let user: User = serde_json::from_value(json!({
            "userId": 7,
            "username": "ana",
            "email": "ana@example.com",
            "geofenceCenterLat": 46.77,
            "geofenceCenterLng": 23.59
        }))
        .unwrap();

        let fence = user.geofence(500.0).unwrap();
        assert_eq!(fence.radius_meters, 500.0);
        assert_eq!(fence.center, LatLng::new(46.77, 23.59));
        assert!(user.tracked_objects.is_empty());
    }

    #[test]
    fn test_preset_request() {
        let backpack = OBJECT_PRESETS.iter().find(|p| p.name == "Backpack").unwrap();
        let req = backpack.request();
        assert_eq!(req.kind, ObjectKind::Bag);
        assert_eq!(req.icon.as_deref(), Some("🎒"));

        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(wire, json!({"name": "Backpack", "type": "BAG", "icon": "🎒"}));
    }
}
