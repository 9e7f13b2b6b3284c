//! Recording map renderer.

use geotrack_core::map_diff::MarkerState;
use geotrack_core::{Geofence, LatLng, MapRenderer, ObjectId};
use indexmap::IndexMap;

/// Owned handle to a drawn marker.
#[derive(Debug, PartialEq, Eq)]
pub struct MarkerHandle {
    pub object_id: ObjectId,
    serial: u64,
}

/// Owned handle to the drawn geofence.
#[derive(Debug, PartialEq, Eq)]
pub struct OverlayHandle(u64);

/// Everything the renderer was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum MapEvent {
    MarkerAdded { object_id: ObjectId, state: MarkerState },
    MarkerUpdated { object_id: ObjectId, state: MarkerState },
    MarkerRemoved { object_id: ObjectId },
    GeofenceAdded { geofence: Geofence },
    GeofenceRemoved,
    Focused { center: LatLng, zoom: u8 },
}

/// A `MapRenderer` that keeps the drawn state and an event log.
#[derive(Debug, Default)]
pub struct SimMap {
    next_serial: u64,
    events: Vec<MapEvent>,
    markers: IndexMap<ObjectId, MarkerState>,
    geofence: Option<Geofence>,
}

impl SimMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[MapEvent] {
        &self.events
    }

    /// Markers currently drawn.
    pub fn markers(&self) -> &IndexMap<ObjectId, MarkerState> {
        &self.markers
    }

    pub fn geofence(&self) -> Option<&Geofence> {
        self.geofence.as_ref()
    }

    fn serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }
}

impl MapRenderer for SimMap {
    type Marker = MarkerHandle;
    type Overlay = OverlayHandle;

    fn add_marker(&mut self, id: ObjectId, state: &MarkerState) -> MarkerHandle {
        self.markers.insert(id, state.clone());
        self.events.push(MapEvent::MarkerAdded {
            object_id: id,
            state: state.clone(),
        });
        MarkerHandle {
            object_id: id,
            serial: self.serial(),
        }
    }

    fn update_marker(&mut self, marker: &mut MarkerHandle, state: &MarkerState) {
        self.markers.insert(marker.object_id, state.clone());
        self.events.push(MapEvent::MarkerUpdated {
            object_id: marker.object_id,
            state: state.clone(),
        });
    }

    fn remove_marker(&mut self, marker: MarkerHandle) {
        self.markers.shift_remove(&marker.object_id);
        self.events.push(MapEvent::MarkerRemoved {
            object_id: marker.object_id,
        });
    }

    fn add_geofence(&mut self, geofence: &Geofence) -> OverlayHandle {
        self.geofence = Some(*geofence);
        self.events.push(MapEvent::GeofenceAdded {
            geofence: *geofence,
        });
        OverlayHandle(self.serial())
    }

    fn remove_geofence(&mut self, _overlay: OverlayHandle) {
        self.geofence = None;
        self.events.push(MapEvent::GeofenceRemoved);
    }

    fn focus(&mut self, center: LatLng, zoom: u8) {
        self.events.push(MapEvent::Focused { center, zoom });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotrack_core::map_diff::MarkerLayer;
    use geotrack_core::{ObjectCollection, ObjectKind, TrackedObject};

    fn obj(id: i64, lat: f64) -> TrackedObject {
        TrackedObject {
            id: ObjectId(id),
            name: format!("obj-{id}"),
            kind: ObjectKind::Laptop,
            icon: None,
            latitude: Some(lat),
            longitude: Some(23.59),
            outside_geofence: false,
        }
    }

    #[test]
    fn test_layer_drives_recording_map() {
        let mut layer = MarkerLayer::new(SimMap::new());
        layer.sync(&ObjectCollection::from_snapshot(vec![obj(1, 46.0), obj(2, 46.1)]));
        layer.sync(&ObjectCollection::from_snapshot(vec![obj(2, 46.2)]));

        let map = layer.renderer();
        assert_eq!(map.markers().len(), 1);
        assert_eq!(map.markers()[&ObjectId(2)].position.lat, 46.2);
        assert_eq!(map.markers()[&ObjectId(2)].glyph, "💻");
        assert_eq!(
            map.events()[2],
            MapEvent::MarkerRemoved {
                object_id: ObjectId(1)
            }
        );
        assert!(matches!(map.events()[3], MapEvent::MarkerUpdated { .. }));
    }
}
