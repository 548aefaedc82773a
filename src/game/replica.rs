//! Client-side replica of authority object state.
//!
//! Participants never decide ownership. They only mirror what the authority
//! broadcast, dropping events that arrive out of order.

use std::collections::BTreeMap;
use tracing::debug;

use crate::core::ids::{ClientId, ObjectId};
use crate::core::vec3::{Rotation, Vec3};
use crate::game::object::ObjectTransform;
use crate::game::ownership::HolderChanged;

/// Mirrored state of one object.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReplicatedObject {
    /// Committed holder as last broadcast.
    pub holder: Option<ClientId>,
    /// Sequence of the last applied holder change.
    pub sequence: u64,
    /// Last broadcast position.
    pub position: Vec3,
    /// Last broadcast rotation.
    pub rotation: Rotation,
}

/// Read-only cache of committed object state.
#[derive(Debug, Default)]
pub struct ObjectReplica {
    objects: BTreeMap<ObjectId, ReplicatedObject>,
    last_transform_tick: u64,
}

impl ObjectReplica {
    /// Empty replica.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a holder change. Returns false when it is older than what we have.
    pub fn apply_holder_changed(&mut self, change: &HolderChanged) -> bool {
        let entry = self.objects.entry(change.object_id).or_default();
        if change.sequence <= entry.sequence {
            debug!("Ignoring stale holder change {} for {}", change.sequence, change.object_id);
            return false;
        }
        entry.holder = change.holder;
        entry.sequence = change.sequence;
        true
    }

    /// Record a freshly spawned object.
    pub fn apply_spawned(&mut self, object_id: ObjectId, position: Vec3) {
        let entry = self.objects.entry(object_id).or_default();
        entry.position = position;
    }

    /// Apply a transform batch from authority tick `tick`.
    pub fn apply_transforms(&mut self, tick: u64, transforms: &[ObjectTransform]) -> bool {
        if tick < self.last_transform_tick {
            return false;
        }
        self.last_transform_tick = tick;
        for t in transforms {
            let entry = self.objects.entry(t.object_id).or_default();
            entry.position = t.position;
            entry.rotation = t.rotation;
        }
        true
    }

    /// Mirrored state of `object_id`.
    pub fn get(&self, object_id: ObjectId) -> Option<&ReplicatedObject> {
        self.objects.get(&object_id)
    }

    /// Committed holder of `object_id`.
    pub fn holder(&self, object_id: ObjectId) -> Option<ClientId> {
        self.objects.get(&object_id).and_then(|o| o.holder)
    }

    /// Object currently held by `client`.
    pub fn held_by(&self, client: ClientId) -> Option<ObjectId> {
        self.objects
            .iter()
            .find(|(_, o)| o.holder == Some(client))
            .map(|(id, _)| *id)
    }

    /// Forget everything (session teardown).
    pub fn clear(&mut self) {
        self.objects.clear();
        self.last_transform_tick = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(holder: Option<u64>, sequence: u64) -> HolderChanged {
        HolderChanged {
            object_id: ObjectId(1),
            holder: holder.map(ClientId),
            previous: None,
            sequence,
        }
    }

    #[test]
    fn test_out_of_order_change_discarded() {
        let mut replica = ObjectReplica::new();
        assert!(replica.apply_holder_changed(&change(Some(1), 2)));
        assert!(!replica.apply_holder_changed(&change(None, 1)));
        assert_eq!(replica.holder(ObjectId(1)), Some(ClientId(1)));
        assert_eq!(replica.held_by(ClientId(1)), Some(ObjectId(1)));

        assert!(replica.apply_holder_changed(&change(None, 3)));
        assert_eq!(replica.holder(ObjectId(1)), None);
    }

    #[test]
    fn test_transforms_by_tick() {
        let mut replica = ObjectReplica::new();
        let t = |x: f32| ObjectTransform {
            object_id: ObjectId(1),
            position: Vec3::new(x, 0.0, 0.0),
            rotation: Rotation::IDENTITY,
        };

        assert!(replica.apply_transforms(5, &[t(1.0)]));
        assert!(!replica.apply_transforms(4, &[t(9.0)]));
        assert_eq!(replica.get(ObjectId(1)).unwrap().position, Vec3::new(1.0, 0.0, 0.0));

        replica.clear();
        assert!(replica.get(ObjectId(1)).is_none());
    }
}
