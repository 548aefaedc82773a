//! Held Object Tracking
//!
//! Authority-side pass that pulls every held object towards the point in
//! front of its holder's eye. Runs once per simulation tick, after that
//! tick's ownership decisions.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};

use crate::core::ids::ClientId;
use crate::core::vec3::{Rotation, Vec3};
use crate::game::object::{ObjectRegistry, ObjectTransform};
use crate::{CAMERA_HEIGHT, HOLD_DISTANCE_MAX, HOLD_DISTANCE_MIN, HOLD_SMOOTHING_RATE};

/// A participant's viewpoint as reported to the authority.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HolderView {
    /// Body position.
    pub position: Vec3,
    /// Look pitch in degrees, positive is down. Always within [-90, 90].
    pub pitch: f32,
    /// Look yaw in degrees.
    pub yaw: f32,
}

impl HolderView {
    /// Build a view, clamping pitch to [-90, 90].
    pub fn new(position: Vec3, pitch: f32, yaw: f32) -> Self {
        Self {
            position,
            pitch: pitch.clamp(-90.0, 90.0),
            yaw,
        }
    }

    /// View origin: body position raised to camera height.
    pub fn eye(&self) -> Vec3 {
        self.position + Vec3::UP * CAMERA_HEIGHT
    }

    /// Unit look direction.
    pub fn forward(&self) -> Vec3 {
        Vec3::forward_from_euler(self.pitch, self.yaw)
    }

    /// Point `distance` in front of the eye, distance clamped to the hold range.
    pub fn hold_target(&self, distance: f32) -> Vec3 {
        self.eye() + self.forward() * distance.clamp(HOLD_DISTANCE_MIN, HOLD_DISTANCE_MAX)
    }
}

/// Smooths held objects towards their holders' hold targets.
#[derive(Debug, Clone)]
pub struct HeldObjectTracker {
    rate: f32,
}

impl Default for HeldObjectTracker {
    fn default() -> Self {
        Self { rate: HOLD_SMOOTHING_RATE }
    }
}

impl HeldObjectTracker {
    /// Tracker with a custom convergence rate (per second).
    pub fn with_rate(rate: f32) -> Self {
        Self { rate }
    }

    /// Move every held object one step towards its target.
    ///
    /// Objects whose holder has not reported a view yet stay put. Rotation
    /// follows the holder's yaw. Returns the transforms that changed.
    pub fn update(
        &self,
        registry: &mut ObjectRegistry,
        views: &BTreeMap<ClientId, HolderView>,
        dt: f32,
    ) -> Vec<ObjectTransform> {
        let blend = self.rate * dt;
        let mut moved = Vec::new();

        for object in registry.iter_mut() {
            let Some(view) = object.holder().and_then(|holder| views.get(&holder)) else {
                continue;
            };
            let target = view.hold_target(object.hold_distance);
            object.position = object.position.lerp(target, blend);
            object.rotation = Rotation { pitch: 0.0, yaw: view.yaw, roll: 0.0 };
            moved.push(object.transform());
        }

        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::ObjectId;

    const EPS: f32 = 1e-4;

    fn held_registry(holder: ClientId) -> ObjectRegistry {
        let mut registry = ObjectRegistry::with_objects(&[Vec3::ZERO]);
        registry.get_mut(ObjectId(1)).unwrap().set_holder(Some(holder));
        registry
    }

    #[test]
    fn test_pitch_clamped() {
        assert_eq!(HolderView::new(Vec3::ZERO, 120.0, 0.0).pitch, 90.0);
        assert_eq!(HolderView::new(Vec3::ZERO, -100.0, 0.0).pitch, -90.0);
    }

    #[test]
    fn test_hold_target_clamps_distance() {
        let view = HolderView::new(Vec3::ZERO, 0.0, 0.0);
        let eye = Vec3::new(0.0, CAMERA_HEIGHT, 0.0);

        assert!((view.hold_target(6.0) - (eye + Vec3::FORWARD * 6.0)).length() < EPS);
        assert!((view.hold_target(100.0) - (eye + Vec3::FORWARD * 15.0)).length() < EPS);
        assert!((view.hold_target(0.0) - (eye + Vec3::FORWARD * 1.0)).length() < EPS);
    }

    #[test]
    fn test_tracker_blends_not_snaps() {
        let holder = ClientId(1);
        let mut registry = held_registry(holder);
        let mut views = BTreeMap::new();
        views.insert(holder, HolderView::new(Vec3::ZERO, 0.0, 0.0));

        let target = views[&holder].hold_target(6.0);
        let moved = HeldObjectTracker::default().update(&mut registry, &views, 1.0 / 60.0);

        assert_eq!(moved.len(), 1);
        let pos = registry.get(ObjectId(1)).unwrap().position;
        let expected = Vec3::ZERO.lerp(target, 10.0 / 60.0);
        assert!((pos - expected).length() < EPS);
        assert!(pos.distance(target) > 1.0);
    }

    #[test]
    fn test_tracker_converges() {
        let holder = ClientId(1);
        let mut registry = held_registry(holder);
        let mut views = BTreeMap::new();
        views.insert(holder, HolderView::new(Vec3::new(3.0, 0.0, 3.0), 20.0, 45.0));
        let target = views[&holder].hold_target(6.0);

        let tracker = HeldObjectTracker::default();
        for _ in 0..600 {
            tracker.update(&mut registry, &views, 1.0 / 60.0);
        }
        assert!(registry.get(ObjectId(1)).unwrap().position.distance(target) < 1e-3);
    }

    #[test]
    fn test_free_and_viewless_objects_untouched() {
        let mut registry = ObjectRegistry::with_objects(&[Vec3::UP]);
        registry.spawn(Vec3::ZERO);
        registry.get_mut(ObjectId(2)).unwrap().set_holder(Some(ClientId(9)));

        let moved = HeldObjectTracker::default().update(&mut registry, &BTreeMap::new(), 0.1);
        assert!(moved.is_empty());
        assert_eq!(registry.get(ObjectId(1)).unwrap().position, Vec3::UP);
        assert_eq!(registry.get(ObjectId(2)).unwrap().position, Vec3::ZERO);
    }
}
