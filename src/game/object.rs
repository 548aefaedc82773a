//! Interactive Objects
//!
//! Physical objects participants can pick up. The authority owns the
//! registry; `holder` is only writable from inside the crate, through the
//! ownership arbiter.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};

use crate::core::ids::{ClientId, ObjectId};
use crate::core::vec3::{Rotation, Vec3};
use crate::DEFAULT_HOLD_DISTANCE;

/// Physics state of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PhysicsMode {
    /// Gravity and collision response active.
    #[default]
    Simulated,
    /// Driven kinematically by its holder.
    Suspended,
}

/// An object that can be held by at most one client.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractiveObject {
    /// Registry id.
    pub id: ObjectId,
    holder: Option<ClientId>,
    /// Distance in front of the holder's eye (metres).
    pub hold_distance: f32,
    /// World position.
    pub position: Vec3,
    /// World rotation.
    pub rotation: Rotation,
    /// Whether physics integration currently applies.
    pub physics: PhysicsMode,
}

impl InteractiveObject {
    /// New free object at `position`.
    pub fn new(id: ObjectId, position: Vec3) -> Self {
        Self {
            id,
            holder: None,
            hold_distance: DEFAULT_HOLD_DISTANCE,
            position,
            rotation: Rotation::IDENTITY,
            physics: PhysicsMode::Simulated,
        }
    }

    /// Committed holder.
    pub fn holder(&self) -> Option<ClientId> {
        self.holder
    }

    /// Whether anyone holds this object.
    pub fn is_held(&self) -> bool {
        self.holder.is_some()
    }

    /// Commit a holder change and switch physics accordingly.
    pub(crate) fn set_holder(&mut self, holder: Option<ClientId>) {
        self.holder = holder;
        self.physics = if holder.is_some() {
            PhysicsMode::Suspended
        } else {
            PhysicsMode::Simulated
        };
    }

    /// Current pose as a wire transform.
    pub fn transform(&self) -> ObjectTransform {
        ObjectTransform {
            object_id: self.id,
            position: self.position,
            rotation: self.rotation,
        }
    }
}

/// Pose of an object as broadcast by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectTransform {
    /// Object.
    pub object_id: ObjectId,
    /// World position.
    pub position: Vec3,
    /// World rotation.
    pub rotation: Rotation,
}

/// Authority-side set of interactive objects, iterated in id order.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: BTreeMap<ObjectId, InteractiveObject>,
    next_id: u32,
}

impl ObjectRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self { objects: BTreeMap::new(), next_id: 1 }
    }

    /// Registry seeded with one free object per position.
    pub fn with_objects(positions: &[Vec3]) -> Self {
        let mut registry = Self::new();
        for &position in positions {
            registry.spawn(position);
        }
        registry
    }

    /// Add a free object and return its id.
    pub fn spawn(&mut self, position: Vec3) -> ObjectId {
        let id = ObjectId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        self.objects.insert(id, InteractiveObject::new(id, position));
        id
    }

    /// Look up an object.
    pub fn get(&self, id: ObjectId) -> Option<&InteractiveObject> {
        self.objects.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ObjectId) -> Option<&mut InteractiveObject> {
        self.objects.get_mut(&id)
    }

    /// All objects in id order.
    pub fn iter(&self) -> impl Iterator<Item = &InteractiveObject> {
        self.objects.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut InteractiveObject> {
        self.objects.values_mut()
    }

    /// Object held by `client`, if any.
    pub fn held_by(&self, client: ClientId) -> Option<ObjectId> {
        self.objects
            .values()
            .find(|o| o.holder == Some(client))
            .map(|o| o.id)
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Destroy every object (session teardown).
    pub fn clear(&mut self) {
        self.objects.clear();
    }
}
