//! Authority Tick
//!
//! The client-to-server control object: exists once per authority process,
//! turns inbound participant messages into queued ownership requests and
//! advances ownership and held-object tracking once per simulation tick.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::core::ids::{ClientId, ObjectId};
use crate::core::vec3::Vec3;
use crate::game::held::{HeldObjectTracker, HolderView};
use crate::game::object::ObjectRegistry;
use crate::game::ownership::{
    HolderChanged, NotAuthority, OwnershipArbiter, OwnershipOutcome, OwnershipRequest,
};
use crate::network::protocol::{ClientMessage, ServerMessage};
use crate::network::transport::NetworkRole;
use crate::MAX_OBJECTS;

/// Message the authority wants delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// To every participant.
    Broadcast(ServerMessage),
    /// To one participant.
    SendTo(ClientId, ServerMessage),
}

/// Result of a tick.
#[derive(Debug, Default)]
pub struct TickResult {
    /// Tick number just completed.
    pub tick: u64,
    /// Messages to send, in order.
    pub outbound: Vec<Outbound>,
}

/// Authority-side session simulation.
#[derive(Debug)]
pub struct Authority {
    arbiter: OwnershipArbiter,
    tracker: HeldObjectTracker,
    views: BTreeMap<ClientId, HolderView>,
    outbox: Vec<Outbound>,
    tick: u64,
    object_limit: usize,
}

impl Authority {
    /// Control object for `role`, seeded with one object per position.
    pub fn new(role: NetworkRole, objects: &[Vec3]) -> Result<Self, NotAuthority> {
        let arbiter = OwnershipArbiter::for_role(role, ObjectRegistry::with_objects(objects))?;
        info!("Authority control object created ({} objects)", objects.len());
        Ok(Self {
            arbiter,
            tracker: HeldObjectTracker::default(),
            views: BTreeMap::new(),
            outbox: Vec::new(),
            tick: 0,
            object_limit: MAX_OBJECTS,
        })
    }

    /// Refuse participant spawn requests once the registry holds `limit` objects.
    pub fn with_object_limit(mut self, limit: usize) -> Self {
        self.object_limit = limit;
        self
    }

    /// Ownership state.
    pub fn arbiter(&self) -> &OwnershipArbiter {
        &self.arbiter
    }

    /// Completed ticks.
    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Last reported view of `client`.
    pub fn view(&self, client: ClientId) -> Option<&HolderView> {
        self.views.get(&client)
    }

    /// Handle one inbound participant message.
    pub fn handle_client_message(&mut self, from: ClientId, message: ClientMessage) {
        match message {
            ClientMessage::Pickup { object_id } => {
                self.arbiter.submit(from, OwnershipRequest::Pickup(object_id));
            }
            ClientMessage::Drop { object_id } => {
                self.arbiter.submit(from, OwnershipRequest::Drop(object_id));
            }
            ClientMessage::AdjustHoldDistance { object_id, delta } => {
                self.arbiter
                    .submit(from, OwnershipRequest::AdjustHoldDistance { object_id, delta });
            }
            ClientMessage::ViewUpdate(view) => {
                if view.position.is_finite() && view.pitch.is_finite() && view.yaw.is_finite() {
                    // Re-clamp: remote views arrive unvalidated.
                    self.views
                        .insert(from, HolderView::new(view.position, view.pitch, view.yaw));
                } else {
                    debug!("Dropping non-finite view from {}", from);
                }
            }
            ClientMessage::SpawnObject { position } => {
                if self.arbiter.registry().len() >= self.object_limit {
                    debug!("Spawn from {} refused: {} objects", from, self.object_limit);
                } else if position.is_finite() {
                    let object_id = self.arbiter.spawn(position);
                    self.outbox
                        .push(Outbound::Broadcast(ServerMessage::ObjectSpawned { object_id, position }));
                }
            }
        }
    }

    /// Send the current object set to a newly connected participant.
    pub fn client_connected(&mut self, client: ClientId) {
        let sequence = self.arbiter.sequence();
        for object in self.arbiter.registry().iter() {
            self.outbox.push(Outbound::SendTo(client, ServerMessage::ObjectSpawned {
                object_id: object.id,
                position: object.position,
            }));
            if let Some(holder) = object.holder() {
                self.outbox.push(Outbound::SendTo(client, ServerMessage::HolderChanged(HolderChanged {
                    object_id: object.id,
                    holder: Some(holder),
                    previous: None,
                    sequence,
                })));
            }
        }
    }

    /// Release everything a departed participant held.
    pub fn client_disconnected(&mut self, client: ClientId) {
        self.views.remove(&client);
        for change in self.arbiter.release_all(client) {
            info!("{} released {} on disconnect", client, change.object_id);
            self.outbox.push(Outbound::Broadcast(ServerMessage::HolderChanged(change)));
        }
    }

    /// Spawn an object from the authority's own side.
    pub fn spawn(&mut self, position: Vec3) -> ObjectId {
        let object_id = self.arbiter.spawn(position);
        self.outbox
            .push(Outbound::Broadcast(ServerMessage::ObjectSpawned { object_id, position }));
        object_id
    }

    /// Advance one simulation tick.
    ///
    /// Ownership requests are decided before held objects are tracked, so an
    /// object picked up this tick already follows its holder this tick.
    pub fn tick(&mut self, dt: f32) -> TickResult {
        self.tick += 1;
        let mut outbound = std::mem::take(&mut self.outbox);

        // 1. Ownership
        for outcome in self.arbiter.process_pending() {
            outbound.push(match outcome {
                OwnershipOutcome::Broadcast(change) => {
                    Outbound::Broadcast(ServerMessage::HolderChanged(change))
                }
                OwnershipOutcome::Reject { to, object_id, reason } => {
                    Outbound::SendTo(to, ServerMessage::OwnershipRejected { object_id, reason })
                }
            });
        }

        // 2. Held objects
        let transforms = self
            .tracker
            .update(self.arbiter.registry_mut(), &self.views, dt);
        if !transforms.is_empty() {
            outbound.push(Outbound::Broadcast(ServerMessage::ObjectTransforms {
                tick: self.tick,
                transforms,
            }));
        }

        TickResult { tick: self.tick, outbound }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::ownership::OwnershipRejected;

    const O: ObjectId = ObjectId(1);

    fn authority() -> Authority {
        Authority::new(NetworkRole::Host, &[Vec3::new(0.0, 4.0, 0.0)]).unwrap()
    }

    #[test]
    fn test_client_role_has_no_authority() {
        assert!(Authority::new(NetworkRole::Client, &[]).is_err());
    }

    #[test]
    fn test_pickup_is_tracked_same_tick() {
        let mut authority = authority();
        let client = ClientId(1);
        authority.handle_client_message(client, ClientMessage::ViewUpdate(HolderView::new(Vec3::ZERO, 0.0, 0.0)));
        authority.handle_client_message(client, ClientMessage::Pickup { object_id: O });

        let result = authority.tick(1.0 / 60.0);
        assert_eq!(result.tick, 1);
        assert_eq!(result.outbound.len(), 2);
        assert!(matches!(
            &result.outbound[0],
            Outbound::Broadcast(ServerMessage::HolderChanged(HolderChanged { holder: Some(c), .. })) if *c == client
        ));
        assert!(matches!(
            &result.outbound[1],
            Outbound::Broadcast(ServerMessage::ObjectTransforms { tick: 1, transforms }) if transforms.len() == 1
        ));
    }

    #[test]
    fn test_rejection_goes_to_requester_only() {
        let mut authority = authority();
        authority.handle_client_message(ClientId(1), ClientMessage::Pickup { object_id: O });
        authority.handle_client_message(ClientId(2), ClientMessage::Pickup { object_id: O });

        let result = authority.tick(0.0);
        assert_eq!(result.outbound[1], Outbound::SendTo(
            ClientId(2),
            ServerMessage::OwnershipRejected {
                object_id: O,
                reason: OwnershipRejected::AlreadyHeld { holder: ClientId(1) },
            },
        ));
    }

    #[test]
    fn test_disconnect_releases_held() {
        let mut authority = authority();
        authority.handle_client_message(ClientId(1), ClientMessage::Pickup { object_id: O });
        authority.tick(0.0);

        authority.client_disconnected(ClientId(1));
        let result = authority.tick(0.0);
        assert!(matches!(
            &result.outbound[0],
            Outbound::Broadcast(ServerMessage::HolderChanged(HolderChanged { holder: None, previous: Some(ClientId(1)), .. }))
        ));
        assert_eq!(authority.arbiter().holder(O), None);
    }

    #[test]
    fn test_spawn_request_broadcast() {
        let mut authority = authority();
        authority.handle_client_message(ClientId(2), ClientMessage::SpawnObject { position: Vec3::UP });

        let result = authority.tick(0.0);
        assert_eq!(result.outbound, vec![Outbound::Broadcast(ServerMessage::ObjectSpawned {
            object_id: ObjectId(2),
            position: Vec3::UP,
        })]);
    }

    #[test]
    fn test_spawn_requests_capped() {
        let mut authority = authority().with_object_limit(2);
        for _ in 0..3 {
            authority.handle_client_message(ClientId(2), ClientMessage::SpawnObject { position: Vec3::UP });
        }

        let result = authority.tick(0.0);
        assert_eq!(result.outbound.len(), 1);
        assert_eq!(authority.arbiter().registry().len(), 2);

        // The authority's own spawns are not limited.
        authority.spawn(Vec3::ZERO);
        assert_eq!(authority.arbiter().registry().len(), 3);
    }

    #[test]
    fn test_late_joiner_gets_snapshot() {
        let mut authority = authority();
        authority.handle_client_message(ClientId(1), ClientMessage::Pickup { object_id: O });
        authority.tick(0.0);

        authority.client_connected(ClientId(2));
        let result = authority.tick(0.0);
        assert_eq!(result.outbound.len(), 2);
        assert!(matches!(&result.outbound[1], Outbound::SendTo(ClientId(2), ServerMessage::HolderChanged(_))));
    }

    #[test]
    fn test_view_pitch_reclamped() {
        let mut authority = authority();
        let raw = HolderView { position: Vec3::ZERO, pitch: 170.0, yaw: 0.0 };
        authority.handle_client_message(ClientId(1), ClientMessage::ViewUpdate(raw));
        assert_eq!(authority.view(ClientId(1)).unwrap().pitch, 90.0);
    }
}
