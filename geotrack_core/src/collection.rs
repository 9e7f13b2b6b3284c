//! The authoritative in-memory object collection.

use crate::model::{ObjectId, TrackedObject};
use indexmap::IndexMap;

/// Map `id -> TrackedObject`, insertion order preserved for stable rendering.
///
/// At most one entry per id. Only the reconciliation engine mutates it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectCollection {
    objects: IndexMap<ObjectId, TrackedObject>,
}

impl ObjectCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a collection from a backend snapshot.
    ///
    /// A duplicate id keeps its first slot and takes the later value.
    pub fn from_snapshot(objects: impl IntoIterator<Item = TrackedObject>) -> Self {
        let mut map = IndexMap::new();
        for obj in objects {
            map.insert(obj.id, obj);
        }
        Self { objects: map }
    }

    pub fn get(&self, id: ObjectId) -> Option<&TrackedObject> {
        self.objects.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ObjectId) -> Option<&mut TrackedObject> {
        self.objects.get_mut(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Iterates objects in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedObject> {
        self.objects.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectKind;

    fn obj(id: i64, name: &str) -> TrackedObject {
        TrackedObject {
            id: ObjectId(id),
            name: name.into(),
            kind: ObjectKind::Other,
            icon: None,
            latitude: None,
            longitude: None,
            outside_geofence: false,
        }
    }

    #[test]
    fn test_snapshot_preserves_order() {
        let coll = ObjectCollection::from_snapshot(vec![obj(5, "a"), obj(2, "b"), obj(9, "c")]);
        let ids: Vec<_> = coll.ids().collect();
        assert_eq!(ids, vec![ObjectId(5), ObjectId(2), ObjectId(9)]);
    }

    #[test]
    fn test_snapshot_duplicate_id() {
        let coll = ObjectCollection::from_snapshot(vec![obj(1, "old"), obj(2, "b"), obj(1, "new")]);
        assert_eq!(coll.len(), 2);
        assert_eq!(coll.get(ObjectId(1)).unwrap().name, "new");
        assert_eq!(coll.ids().next(), Some(ObjectId(1)));
    }
}
