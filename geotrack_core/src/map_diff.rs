//! Map marker diffing.
//!
//! The rendered map is derived state: a pure function of the previous
//! marker snapshot and the committed object collection produces the minimal
//! set of marker operations, which a [`MarkerLayer`] then replays against a
//! [`MapRenderer`].
//!
//! ```text
//! ObjectCollection ──┐
//!                    ├──> diff_markers() ──> MapDiff ──> MarkerLayer ──> MapRenderer
//! MarkerSnapshot ────┘                                        │
//!        ^                                                    │
//!        └──────────────────── apply ─────────────────────────┘
//! ```

use crate::collection::ObjectCollection;
use crate::model::{Geofence, LatLng, ObjectId, TrackedObject};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Zoom level used when focusing a selected object.
pub const FOCUS_ZOOM: u8 = 15;

// ============================================================================
// MARKER STATE
// ============================================================================

/// Everything about an object that is visible on its marker.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerState {
    pub position: LatLng,
    pub outside_geofence: bool,
    pub glyph: String,
    pub name: String,
}

impl MarkerState {
    /// The marker an object should have, or `None` if it is unplaced.
    pub fn of(obj: &TrackedObject) -> Option<Self> {
        Some(Self {
            position: obj.position()?,
            outside_geofence: obj.outside_geofence,
            glyph: obj.glyph().to_string(),
            name: obj.name.clone(),
        })
    }
}

/// Rendered marker states keyed by object id.
pub type MarkerSnapshot = IndexMap<ObjectId, MarkerState>;

/// One marker operation.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerOp {
    Add { id: ObjectId, state: MarkerState },
    Update { id: ObjectId, state: MarkerState },
    Remove { id: ObjectId },
}

impl MarkerOp {
    pub fn id(&self) -> ObjectId {
        match self {
            MarkerOp::Add { id, .. } | MarkerOp::Update { id, .. } | MarkerOp::Remove { id } => *id,
        }
    }
}

/// Ordered marker operations: removals first, then adds/updates in
/// collection order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapDiff {
    pub ops: Vec<MarkerOp>,
}

impl MapDiff {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Applies the diff to a snapshot without rendering.
    pub fn apply_to(&self, snapshot: &mut MarkerSnapshot) {
        for op in &self.ops {
            match op {
                MarkerOp::Add { id, state } | MarkerOp::Update { id, state } => {
                    snapshot.insert(*id, state.clone());
                }
                MarkerOp::Remove { id } => {
                    snapshot.shift_remove(id);
                }
            }
        }
    }
}

// ============================================================================
// DIFFING
// ============================================================================

/// Diffs a single marker.
///
/// # Arguments
/// * `prev` - The rendered state, if a marker exists
/// * `id` - Object id
/// * `obj` - The committed object, if it still exists
pub fn diff_marker(
    prev: Option<&MarkerState>,
    id: ObjectId,
    obj: Option<&TrackedObject>,
) -> Option<MarkerOp> {
    let next = obj.and_then(MarkerState::of);
    match (prev, next) {
        (None, None) => None,
        (Some(_), None) => Some(MarkerOp::Remove { id }),
        (None, Some(state)) => Some(MarkerOp::Add { id, state }),
        (Some(old), Some(state)) if *old != state => Some(MarkerOp::Update { id, state }),
        (Some(_), Some(_)) => None,
    }
}

/// Diffs every marker against the collection.
///
/// Idempotent: applying the result to `prev` and diffing again yields an
/// empty diff.
pub fn diff_markers(prev: &MarkerSnapshot, objects: &ObjectCollection) -> MapDiff {
    let mut ops = Vec::new();

    for id in prev.keys() {
        let gone = objects
            .get(*id)
            .map_or(true, |obj| obj.position().is_none());
        if gone {
            ops.push(MarkerOp::Remove { id: *id });
        }
    }

    for obj in objects.iter() {
        let Some(state) = MarkerState::of(obj) else {
            continue;
        };
        match prev.get(&obj.id) {
            None => ops.push(MarkerOp::Add { id: obj.id, state }),
            Some(old) if *old != state => ops.push(MarkerOp::Update { id: obj.id, state }),
            Some(_) => {}
        }
    }

    MapDiff { ops }
}

// ============================================================================
// RENDERING
// ============================================================================

/// The map widget, behind owned opaque handles.
pub trait MapRenderer {
    /// Handle to one drawn marker
    type Marker;

    /// Handle to the drawn geofence overlay
    type Overlay;

    fn add_marker(&mut self, id: ObjectId, state: &MarkerState) -> Self::Marker;

    fn update_marker(&mut self, marker: &mut Self::Marker, state: &MarkerState);

    fn remove_marker(&mut self, marker: Self::Marker);

    fn add_geofence(&mut self, geofence: &Geofence) -> Self::Overlay;

    fn remove_geofence(&mut self, overlay: Self::Overlay);

    /// Centers the view. Renderers without a viewport ignore it.
    fn focus(&mut self, _center: LatLng, _zoom: u8) {}
}

/// Rendered markers plus the handles that back them.
pub struct MarkerLayer<R: MapRenderer> {
    renderer: R,
    states: MarkerSnapshot,
    markers: HashMap<ObjectId, R::Marker>,
    geofence: Option<R::Overlay>,
}

impl<R: MapRenderer> MarkerLayer<R> {
    pub fn new(renderer: R) -> Self {
        Self {
            renderer,
            states: MarkerSnapshot::new(),
            markers: HashMap::new(),
            geofence: None,
        }
    }

    /// Diffs the whole collection and renders the result.
    pub fn sync(&mut self, objects: &ObjectCollection) -> MapDiff {
        let diff = diff_markers(&self.states, objects);
        self.render(&diff);
        diff
    }

    /// Diffs and renders one marker.
    pub fn sync_one(&mut self, id: ObjectId, objects: &ObjectCollection) -> MapDiff {
        let ops = diff_marker(self.states.get(&id), id, objects.get(id))
            .into_iter()
            .collect();
        let diff = MapDiff { ops };
        self.render(&diff);
        diff
    }

    fn render(&mut self, diff: &MapDiff) {
        for op in &diff.ops {
            match op {
                MarkerOp::Add { id, state } => {
                    let marker = self.renderer.add_marker(*id, state);
                    if let Some(stale) = self.markers.insert(*id, marker) {
                        self.renderer.remove_marker(stale);
                    }
                }
                MarkerOp::Update { id, state } => match self.markers.get_mut(id) {
                    Some(marker) => self.renderer.update_marker(marker, state),
                    None => {
                        let marker = self.renderer.add_marker(*id, state);
                        self.markers.insert(*id, marker);
                    }
                },
                MarkerOp::Remove { id } => {
                    if let Some(marker) = self.markers.remove(id) {
                        self.renderer.remove_marker(marker);
                    }
                }
            }
        }
        diff.apply_to(&mut self.states);
    }

    /// Replaces the geofence overlay. Markers are untouched.
    pub fn set_geofence(&mut self, geofence: Option<&Geofence>) {
        if let Some(old) = self.geofence.take() {
            self.renderer.remove_geofence(old);
        }
        if let Some(fence) = geofence {
            self.geofence = Some(self.renderer.add_geofence(fence));
        }
    }

    pub fn focus(&mut self, center: LatLng) {
        self.renderer.focus(center, FOCUS_ZOOM);
    }

    /// Removes every marker and the overlay.
    pub fn clear(&mut self) {
        for (_, marker) in self.markers.drain() {
            self.renderer.remove_marker(marker);
        }
        self.states.clear();
        self.set_geofence(None);
    }

    pub fn states(&self) -> &MarkerSnapshot {
        &self.states
    }

    pub fn has_geofence(&self) -> bool {
        self.geofence.is_some()
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectKind;
    use proptest::prelude::*;

    /// Counts calls; handles are plain ids.
    #[derive(Default)]
    struct CountingRenderer {
        added: usize,
        updated: usize,
        removed: usize,
        live: usize,
        overlays: usize,
    }

    impl MapRenderer for CountingRenderer {
        type Marker = ObjectId;
        type Overlay = ();

        fn add_marker(&mut self, id: ObjectId, _state: &MarkerState) -> ObjectId {
            self.added += 1;
            self.live += 1;
            id
        }

        fn update_marker(&mut self, _marker: &mut ObjectId, _state: &MarkerState) {
            self.updated += 1;
        }

        fn remove_marker(&mut self, _marker: ObjectId) {
            self.removed += 1;
            self.live -= 1;
        }

        fn add_geofence(&mut self, _geofence: &Geofence) {
            self.overlays += 1;
        }

        fn remove_geofence(&mut self, _overlay: ()) {
            self.overlays -= 1;
        }
    }

    fn obj(id: i64, pos: Option<(f64, f64)>, outside: bool) -> TrackedObject {
        TrackedObject {
            id: ObjectId(id),
            name: format!("obj-{id}"),
            kind: ObjectKind::Keys,
            icon: None,
            latitude: pos.map(|p| p.0),
            longitude: pos.map(|p| p.1),
            outside_geofence: outside,
        }
    }

    #[test]
    fn test_diff_add_update_remove() {
        let mut layer = MarkerLayer::new(CountingRenderer::default());

        let first = ObjectCollection::from_snapshot(vec![
            obj(1, Some((46.0, 23.0)), false),
            obj(2, None, false),
            obj(3, Some((46.1, 23.1)), false),
        ]);
        let diff = layer.sync(&first);
        assert_eq!(diff.len(), 2);
        assert!(diff.ops.iter().all(|op| matches!(op, MarkerOp::Add { .. })));

        let second = ObjectCollection::from_snapshot(vec![
            obj(1, Some((46.0, 23.0)), true),
            obj(2, Some((46.2, 23.2)), false),
        ]);
        let diff = layer.sync(&second);
        assert_eq!(
            diff.ops.iter().map(MarkerOp::id).collect::<Vec<_>>(),
            vec![ObjectId(3), ObjectId(1), ObjectId(2)]
        );
        assert!(matches!(diff.ops[0], MarkerOp::Remove { .. }));
        assert!(matches!(diff.ops[1], MarkerOp::Update { .. }));
        assert!(matches!(diff.ops[2], MarkerOp::Add { .. }));

        let r = layer.renderer();
        assert_eq!((r.added, r.updated, r.removed, r.live), (3, 1, 1, 2));
    }

    #[test]
    fn test_unplacing_removes_marker() {
        let mut layer = MarkerLayer::new(CountingRenderer::default());
        let placed = ObjectCollection::from_snapshot(vec![obj(1, Some((1.0, 1.0)), false)]);
        layer.sync(&placed);

        let unplaced = ObjectCollection::from_snapshot(vec![obj(1, None, false)]);
        let diff = layer.sync_one(ObjectId(1), &unplaced);
        assert_eq!(diff.ops, vec![MarkerOp::Remove { id: ObjectId(1) }]);
        assert!(layer.states().is_empty());
    }

    #[test]
    fn test_geofence_overlay_replaced() {
        let mut layer = MarkerLayer::new(CountingRenderer::default());
        let fence = Geofence::new(LatLng::new(46.77, 23.59), 500.0);

        layer.set_geofence(Some(&fence));
        layer.set_geofence(Some(&fence));
        assert_eq!(layer.renderer().overlays, 1);

        layer.set_geofence(None);
        assert_eq!(layer.renderer().overlays, 0);
        assert!(!layer.has_geofence());
    }

    fn arb_collection() -> impl Strategy<Value = ObjectCollection> {
        let entry = (
            0i64..8,
            proptest::option::of((0u8..3, 0u8..3)),
            any::<bool>(),
            proptest::option::of(prop_oneof![Just("🔑"), Just("🚲")]),
        );
        proptest::collection::vec(entry, 0..12).prop_map(|entries| {
            ObjectCollection::from_snapshot(entries.into_iter().map(|(id, pos, outside, icon)| {
                let mut o = obj(id, pos.map(|(a, b)| (a as f64, b as f64)), outside);
                o.icon = icon.map(str::to_string);
                o
            }))
        })
    }

    proptest! {
        #[test]
        fn test_diff_idempotent(first in arb_collection(), second in arb_collection()) {
            let mut layer = MarkerLayer::new(CountingRenderer::default());
            layer.sync(&first);
            layer.sync(&second);

            prop_assert!(diff_markers(layer.states(), &second).is_empty());

            let positioned = second.iter().filter(|o| o.position().is_some()).count();
            prop_assert_eq!(layer.states().len(), positioned);
            prop_assert_eq!(layer.renderer().live, positioned);
        }
    }
}
