//! Reconciliation Engine - the single writer of tracked object state.
//!
//! Three independent sources feed the engine: the locations topic,
//! the notifications topic (via authoritative reloads) and local CRUD
//! results. Each mutation commits to the [`ObjectCollection`] first; the
//! marker diff is computed strictly afterwards.
//!
//! ## Ordering
//!
//! There are no sequence numbers on the wire, so across calls the last
//! applied fact wins. In particular a full refresh that was fetched before
//! a newer incremental update, but applied after it, overwrites it.
//! The outcome depends only on arrival order.

use crate::collection::ObjectCollection;
use crate::ledger::NotificationLedger;
use crate::map_diff::{MapDiff, MapRenderer, MarkerLayer};
use crate::model::{Geofence, LocationEvent, NotificationEvent, ObjectId, TrackedObject};
use tracing::debug;

/// Demand for an authoritative reload after a notification.
///
/// The controller answers it with `list_objects()` followed by
/// [`ReconciliationEngine::apply_full_refresh`].
#[must_use = "a notification requires a full refresh"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshRequired {
    pub object_id: ObjectId,
}

pub struct ReconciliationEngine<R: MapRenderer> {
    objects: ObjectCollection,
    layer: MarkerLayer<R>,
    ledger: NotificationLedger,
    selection: Option<ObjectId>,
    geofence: Option<Geofence>,
}

impl<R: MapRenderer> ReconciliationEngine<R> {
    /// Creates an empty engine.
    ///
    /// # Arguments
    /// * `renderer` - Map the engine draws on
    /// * `ledger_capacity` - Notifications retained
    pub fn new(renderer: R, ledger_capacity: usize) -> Self {
        Self {
            objects: ObjectCollection::new(),
            layer: MarkerLayer::new(renderer),
            ledger: NotificationLedger::new(ledger_capacity),
            selection: None,
            geofence: None,
        }
    }

    // ========================================================================
    // RECONCILIATION
    // ========================================================================

    /// Replaces the whole collection and re-diffs every marker.
    ///
    /// Clears the selection when the selected object is gone.
    pub fn apply_full_refresh(&mut self, objects: Vec<TrackedObject>) -> MapDiff {
        self.objects = ObjectCollection::from_snapshot(objects);

        if let Some(selected) = self.selection {
            if !self.objects.contains(selected) {
                debug!(object = %selected, "selected object vanished, clearing selection");
                self.selection = None;
            }
        }

        let diff = self.layer.sync(&self.objects);
        debug!(objects = self.objects.len(), ops = diff.len(), "full refresh applied");
        diff
    }

    /// Mirrors one location event onto a known object.
    ///
    /// Unknown ids are discarded (`None`) and the collection is unchanged.
    pub fn apply_location_update(&mut self, event: &LocationEvent) -> Option<MapDiff> {
        let Some(obj) = self.objects.get_mut(event.object_id) else {
            debug!(object = %event.object_id, "location update for unknown object discarded");
            return None;
        };

        obj.latitude = Some(event.latitude);
        obj.longitude = Some(event.longitude);
        obj.outside_geofence = event.outside_geofence;

        Some(self.layer.sync_one(event.object_id, &self.objects))
    }

    /// Records a notification and demands an authoritative reload.
    ///
    /// Geofence membership is never derived here; the reload carries it.
    pub fn apply_notification(&mut self, event: NotificationEvent) -> RefreshRequired {
        let object_id = event.object_id;
        debug!(object = %object_id, kind = event.kind.as_str(), "notification recorded");
        self.ledger.push(event);
        RefreshRequired { object_id }
    }

    /// Replaces the geofence overlay. Markers are not touched.
    pub fn set_geofence(&mut self, geofence: Option<Geofence>) {
        self.geofence = geofence;
        self.layer.set_geofence(geofence.as_ref());
    }

    // ========================================================================
    // SELECTION
    // ========================================================================

    /// Toggles the selection and returns the new one.
    ///
    /// Selecting the selected object deselects it; selecting another
    /// replaces it. Unknown ids leave the selection as is.
    pub fn toggle_selection(&mut self, id: ObjectId) -> Option<ObjectId> {
        if self.selection == Some(id) {
            self.selection = None;
        } else if let Some(obj) = self.objects.get(id) {
            self.selection = Some(id);
            if let Some(position) = obj.position() {
                self.layer.focus(position);
            }
        }
        self.selection
    }

    pub fn clear_selection(&mut self) {
        self.selection = None;
    }

    /// Drops all session state.
    pub fn reset(&mut self) {
        self.objects = ObjectCollection::new();
        self.layer.clear();
        self.ledger.clear_all();
        self.selection = None;
        self.geofence = None;
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn objects(&self) -> &ObjectCollection {
        &self.objects
    }

    pub fn selection(&self) -> Option<ObjectId> {
        self.selection
    }

    pub fn geofence(&self) -> Option<&Geofence> {
        self.geofence.as_ref()
    }

    pub fn ledger(&self) -> &NotificationLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut NotificationLedger {
        &mut self.ledger
    }

    pub fn layer(&self) -> &MarkerLayer<R> {
        &self.layer
    }

    pub fn renderer(&self) -> &R {
        self.layer.renderer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_diff::{MarkerOp, MarkerState};
    use crate::model::{LatLng, NotificationKind, ObjectKind, UserId};

    #[derive(Default)]
    struct NullRenderer {
        focused: Vec<LatLng>,
    }

    impl MapRenderer for NullRenderer {
        type Marker = ();
        type Overlay = ();

        fn add_marker(&mut self, _id: ObjectId, _state: &MarkerState) {}
        fn update_marker(&mut self, _marker: &mut (), _state: &MarkerState) {}
        fn remove_marker(&mut self, _marker: ()) {}
        fn add_geofence(&mut self, _geofence: &Geofence) {}
        fn remove_geofence(&mut self, _overlay: ()) {}

        fn focus(&mut self, center: LatLng, _zoom: u8) {
            self.focused.push(center);
        }
    }

    fn engine() -> ReconciliationEngine<NullRenderer> {
        ReconciliationEngine::new(NullRenderer::default(), 10)
    }

    fn obj(id: i64, lat: f64, lng: f64, outside: bool) -> TrackedObject {
        TrackedObject {
            id: ObjectId(id),
            name: format!("obj-{id}"),
            kind: ObjectKind::Bicycle,
            icon: None,
            latitude: Some(lat),
            longitude: Some(lng),
            outside_geofence: outside,
        }
    }

    fn location(id: i64, lat: f64, lng: f64, outside: bool) -> LocationEvent {
        LocationEvent {
            object_id: ObjectId(id),
            name: format!("obj-{id}"),
            kind: "BICYCLE".into(),
            latitude: lat,
            longitude: lng,
            outside_geofence: outside,
        }
    }

    #[test]
    fn test_unknown_id_discarded() {
        let mut engine = engine();
        engine.apply_full_refresh(vec![obj(1, 46.0, 23.0, false)]);
        let before = engine.objects().clone();

        assert!(engine.apply_location_update(&location(99, 1.0, 1.0, true)).is_none());
        assert_eq!(engine.objects(), &before);
    }

    #[test]
    fn test_location_update_mirrors_flag() {
        let mut engine = engine();
        engine.apply_full_refresh(vec![obj(1, 46.0, 23.0, false)]);

        let diff = engine
            .apply_location_update(&location(1, 46.5, 23.5, true))
            .unwrap();
        assert!(matches!(diff.ops.as_slice(), [MarkerOp::Update { .. }]));

        let updated = engine.objects().get(ObjectId(1)).unwrap();
        assert_eq!(updated.position(), Some(LatLng::new(46.5, 23.5)));
        assert!(updated.outside_geofence);

        // Same fact again: nothing to redraw
        let diff = engine
            .apply_location_update(&location(1, 46.5, 23.5, true))
            .unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_selection_toggle() {
        let mut engine = engine();
        engine.apply_full_refresh(vec![obj(1, 46.0, 23.0, false), obj(2, 47.0, 24.0, false)]);

        assert_eq!(engine.toggle_selection(ObjectId(1)), Some(ObjectId(1)));
        assert_eq!(engine.toggle_selection(ObjectId(1)), None);

        engine.toggle_selection(ObjectId(1));
        assert_eq!(engine.toggle_selection(ObjectId(2)), Some(ObjectId(2)));
        assert_eq!(engine.renderer().focused.last(), Some(&LatLng::new(47.0, 24.0)));

        // Location updates never clear the selection
        engine.apply_location_update(&location(2, 47.1, 24.1, true));
        assert_eq!(engine.selection(), Some(ObjectId(2)));

        assert_eq!(engine.toggle_selection(ObjectId(42)), Some(ObjectId(2)));
    }

    #[test]
    fn test_refresh_clears_vanished_selection() {
        let mut engine = engine();
        engine.apply_full_refresh(vec![obj(1, 46.0, 23.0, false), obj(2, 47.0, 24.0, false)]);
        engine.toggle_selection(ObjectId(2));

        engine.apply_full_refresh(vec![obj(2, 47.0, 24.0, false)]);
        assert_eq!(engine.selection(), Some(ObjectId(2)));

        engine.apply_full_refresh(vec![obj(1, 46.0, 23.0, false)]);
        assert_eq!(engine.selection(), None);
    }

    #[test]
    fn test_notification_requires_refresh() {
        let mut engine = engine();
        engine.apply_full_refresh(vec![obj(1, 46.0, 23.0, false)]);

        let refresh = engine.apply_notification(NotificationEvent {
            user_id: UserId(1),
            object_id: ObjectId(1),
            object_name: "obj-1".into(),
            object_type: "BICYCLE".into(),
            message: "obj-1 left the safe zone".into(),
            kind: NotificationKind::GeofenceExit,
            timestamp: "2024-01-01T00:00:00Z".into(),
        });
        assert_eq!(refresh.object_id, ObjectId(1));
        assert_eq!(engine.ledger().len(), 1);
        // The flag comes from the reload, not from the notification
        assert!(!engine.objects().get(ObjectId(1)).unwrap().outside_geofence);

        engine.apply_full_refresh(vec![obj(1, 46.0, 23.0, true)]);
        assert!(engine.objects().get(ObjectId(1)).unwrap().outside_geofence);
    }

    #[test]
    fn test_stale_refresh_is_deterministic() {
        // Snapshot fetched before the incremental update, applied after it
        let stale = vec![obj(1, 46.0, 23.0, false)];

        let run = || {
            let mut engine = engine();
            engine.apply_full_refresh(vec![obj(1, 46.0, 23.0, false)]);
            engine.apply_location_update(&location(1, 46.9, 23.9, true));
            engine.apply_full_refresh(stale.clone());
            engine.objects().clone()
        };

        let first = run();
        assert_eq!(first, run());

        let obj = first.get(ObjectId(1)).unwrap();
        assert_eq!(obj.position(), Some(LatLng::new(46.0, 23.0)));
        assert!(!obj.outside_geofence);
    }

    #[test]
    fn test_geofence_does_not_touch_markers() {
        let mut engine = engine();
        engine.apply_full_refresh(vec![obj(1, 46.0, 23.0, false)]);
        let markers = engine.layer().states().clone();

        engine.set_geofence(Some(Geofence::new(LatLng::new(46.77, 23.59), 300.0)));
        assert_eq!(engine.layer().states(), &markers);
        assert!(engine.layer().has_geofence());
        assert_eq!(engine.geofence().unwrap().radius_meters, 300.0);
    }
}
