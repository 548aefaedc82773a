//! Ownership Arbitration
//!
//! The authority's exclusive-holder protocol for interactive objects.
//!
//! ## Protocol
//!
//! 1. A participant submits `Pickup`/`Drop`/`AdjustHoldDistance` requests.
//! 2. The authority queues them in arrival order and decides them one at a
//!    time at the start of its tick, so two requests for the same object are
//!    never decided concurrently.
//! 3. Accepted transitions are broadcast to everyone as [`HolderChanged`]
//!    with a monotonically increasing sequence number.
//! 4. Rejections go back to the requester only.
//!
//! Only an authority role can construct an [`OwnershipArbiter`]; there is no
//! other path that writes an object's holder.

use std::collections::VecDeque;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::core::ids::{ClientId, ObjectId};
use crate::core::vec3::Vec3;
use crate::game::object::ObjectRegistry;
use crate::network::transport::NetworkRole;
use crate::{HOLD_DISTANCE_MAX, HOLD_DISTANCE_MIN};

/// Why an ownership request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipRejected {
    /// Someone already holds the object.
    #[error("object already held by {holder}")]
    AlreadyHeld {
        /// Current holder.
        holder: ClientId,
    },

    /// The requester does not hold the object.
    #[error("requester is not the holder")]
    NotHolder,

    /// No such object.
    #[error("unknown object")]
    UnknownObject,

    /// The requester already holds a different object.
    #[error("requester already holds {object_id}")]
    AlreadyHolding {
        /// Object the requester holds.
        object_id: ObjectId,
    },
}

/// A committed holder transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderChanged {
    /// Object.
    pub object_id: ObjectId,
    /// New holder, `None` after a drop.
    pub holder: Option<ClientId>,
    /// Holder before the transition.
    pub previous: Option<ClientId>,
    /// Authority-wide commit order.
    pub sequence: u64,
}

/// Attempt to build an arbiter outside an authority role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{0} role cannot arbitrate ownership")]
pub struct NotAuthority(pub NetworkRole);

/// Request queued for the next ownership pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OwnershipRequest {
    /// Become holder.
    Pickup(ObjectId),
    /// Stop holding.
    Drop(ObjectId),
    /// Change hold distance by a delta.
    AdjustHoldDistance {
        /// Target object.
        object_id: ObjectId,
        /// Signed change in metres.
        delta: f32,
    },
}

impl OwnershipRequest {
    fn object_id(&self) -> ObjectId {
        match *self {
            OwnershipRequest::Pickup(id) | OwnershipRequest::Drop(id) => id,
            OwnershipRequest::AdjustHoldDistance { object_id, .. } => object_id,
        }
    }
}

/// Result of deciding one queued request.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnershipOutcome {
    /// Accepted transition for every participant.
    Broadcast(HolderChanged),
    /// Refusal for the requester only.
    Reject {
        /// Requester.
        to: ClientId,
        /// Target object.
        object_id: ObjectId,
        /// Why.
        reason: OwnershipRejected,
    },
}

/// Authority-side holder bookkeeping.
#[derive(Debug)]
pub struct OwnershipArbiter {
    registry: ObjectRegistry,
    pending: VecDeque<(ClientId, OwnershipRequest)>,
    sequence: u64,
}

impl OwnershipArbiter {
    /// Arbiter over `registry`, for an authority role only.
    pub fn for_role(role: NetworkRole, registry: ObjectRegistry) -> Result<Self, NotAuthority> {
        if !role.is_authority() {
            return Err(NotAuthority(role));
        }
        Ok(Self {
            registry,
            pending: VecDeque::new(),
            sequence: 0,
        })
    }

    /// Read access to the objects.
    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut ObjectRegistry {
        &mut self.registry
    }

    /// Committed holder of `object_id`.
    pub fn holder(&self, object_id: ObjectId) -> Option<ClientId> {
        self.registry.get(object_id).and_then(|o| o.holder())
    }

    /// Last committed sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Spawn a free object.
    pub fn spawn(&mut self, position: Vec3) -> ObjectId {
        let id = self.registry.spawn(position);
        info!("Spawned {} at {:?}", id, position);
        id
    }

    /// Decide a pickup immediately.
    pub fn request_pickup(
        &mut self,
        requester: ClientId,
        object_id: ObjectId,
    ) -> Result<HolderChanged, OwnershipRejected> {
        let object = self.registry.get(object_id).ok_or(OwnershipRejected::UnknownObject)?;
        if let Some(holder) = object.holder() {
            return Err(OwnershipRejected::AlreadyHeld { holder });
        }
        if let Some(held) = self.registry.held_by(requester) {
            return Err(OwnershipRejected::AlreadyHolding { object_id: held });
        }
        Ok(self.commit(object_id, Some(requester)))
    }

    /// Decide a drop immediately.
    pub fn request_drop(
        &mut self,
        requester: ClientId,
        object_id: ObjectId,
    ) -> Result<HolderChanged, OwnershipRejected> {
        let object = self.registry.get(object_id).ok_or(OwnershipRejected::UnknownObject)?;
        if object.holder() != Some(requester) {
            return Err(OwnershipRejected::NotHolder);
        }
        Ok(self.commit(object_id, None))
    }

    /// Change the hold distance of an object the requester holds.
    /// Returns the new, clamped distance.
    pub fn adjust_hold_distance(
        &mut self,
        requester: ClientId,
        object_id: ObjectId,
        delta: f32,
    ) -> Result<f32, OwnershipRejected> {
        let object = self
            .registry
            .get_mut(object_id)
            .ok_or(OwnershipRejected::UnknownObject)?;
        if object.holder() != Some(requester) {
            return Err(OwnershipRejected::NotHolder);
        }
        let delta = if delta.is_finite() { delta } else { 0.0 };
        object.hold_distance = (object.hold_distance + delta).clamp(HOLD_DISTANCE_MIN, HOLD_DISTANCE_MAX);
        Ok(object.hold_distance)
    }

    /// Queue a request for the next [`process_pending`](Self::process_pending).
    pub fn submit(&mut self, requester: ClientId, request: OwnershipRequest) {
        self.pending.push_back((requester, request));
    }

    /// Number of queued requests.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Decide every queued request in arrival order.
    pub fn process_pending(&mut self) -> Vec<OwnershipOutcome> {
        let mut outcomes = Vec::with_capacity(self.pending.len());

        while let Some((requester, request)) = self.pending.pop_front() {
            let decided = match request {
                OwnershipRequest::Pickup(id) => self.request_pickup(requester, id).map(Some),
                OwnershipRequest::Drop(id) => self.request_drop(requester, id).map(Some),
                OwnershipRequest::AdjustHoldDistance { object_id, delta } => self
                    .adjust_hold_distance(requester, object_id, delta)
                    .map(|_| None),
            };

            match decided {
                Ok(Some(change)) => outcomes.push(OwnershipOutcome::Broadcast(change)),
                Ok(None) => {}
                Err(reason) => {
                    debug!("Rejected {:?} from {}: {}", request, requester, reason);
                    outcomes.push(OwnershipOutcome::Reject {
                        to: requester,
                        object_id: request.object_id(),
                        reason,
                    });
                }
            }
        }

        outcomes
    }

    /// Drop everything `client` holds and discard its queued requests.
    pub fn release_all(&mut self, client: ClientId) -> Vec<HolderChanged> {
        self.pending.retain(|(requester, _)| *requester != client);

        let held: Vec<ObjectId> = self
            .registry
            .iter()
            .filter(|o| o.holder() == Some(client))
            .map(|o| o.id)
            .collect();

        held.into_iter().map(|id| self.commit(id, None)).collect()
    }

    fn commit(&mut self, object_id: ObjectId, holder: Option<ClientId>) -> HolderChanged {
        self.sequence += 1;
        let mut previous = None;
        if let Some(object) = self.registry.get_mut(object_id) {
            previous = object.holder();
            object.set_holder(holder);
        }
        let change = HolderChanged {
            object_id,
            holder,
            previous,
            sequence: self.sequence,
        };
        debug!("Committed {:?}", change);
        change
    }
}
