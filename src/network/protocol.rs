//! Protocol Messages
//!
//! Participant <-> authority traffic over the relay transport. Frames are
//! bincode; enums keep serde's externally tagged representation.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::ids::ObjectId;
use crate::core::vec3::Vec3;
use crate::game::held::HolderView;
use crate::game::object::ObjectTransform;
use crate::game::ownership::{HolderChanged, OwnershipRejected};

// =============================================================================
// CLIENT -> AUTHORITY MESSAGES
// =============================================================================

/// Messages sent from a participant to the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask to become the holder of an object.
    Pickup {
        /// Target object.
        object_id: ObjectId,
    },

    /// Ask to release a held object.
    Drop {
        /// Target object.
        object_id: ObjectId,
    },

    /// Move a held object nearer/further (scroll).
    AdjustHoldDistance {
        /// Target object.
        object_id: ObjectId,
        /// Signed change in metres.
        delta: f32,
    },

    /// Report the sender's current viewpoint.
    ViewUpdate(HolderView),

    /// Ask the authority to spawn an interactive object.
    SpawnObject {
        /// Spawn position.
        position: Vec3,
    },
}

// =============================================================================
// AUTHORITY -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from the authority to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    /// An ownership transition was committed (broadcast).
    HolderChanged(HolderChanged),

    /// The recipient's ownership request was refused (sent to requester only).
    OwnershipRejected {
        /// Target object.
        object_id: ObjectId,
        /// Why.
        reason: OwnershipRejected,
    },

    /// A new object exists (broadcast).
    ObjectSpawned {
        /// New object.
        object_id: ObjectId,
        /// Where.
        position: Vec3,
    },

    /// Authoritative poses of held objects after this tick (broadcast).
    ObjectTransforms {
        /// Authority tick number.
        tick: u64,
        /// Updated poses.
        transforms: Vec<ObjectTransform>,
    },

    /// The authority is shutting down.
    Shutdown {
        /// Human-readable reason.
        reason: String,
    },
}

// =============================================================================
// FRAMES
// =============================================================================

/// Encode a message into a relay frame.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(message)
}

/// Decode a relay frame. Truncated or unknown frames are errors.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::ClientId;

    #[test]
    fn test_message_names_are_snake_case() {
        let msg = ClientMessage::AdjustHoldDistance {
            object_id: ObjectId(7),
            delta: -1.5,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("adjust_hold_distance"));

        let rejection = ServerMessage::OwnershipRejected {
            object_id: ObjectId(1),
            reason: OwnershipRejected::AlreadyHeld { holder: ClientId(4) },
        };
        assert!(serde_json::to_string(&rejection).unwrap().contains("already_held"));
    }

    #[test]
    fn test_holder_changed_frame() {
        let msg = ServerMessage::HolderChanged(HolderChanged {
            object_id: ObjectId(3),
            holder: Some(ClientId(2)),
            previous: None,
            sequence: 11,
        });

        let frame = encode(&msg).unwrap();
        assert_eq!(decode::<ServerMessage>(&frame).unwrap(), msg);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let msg = ClientMessage::ViewUpdate(HolderView::new(Vec3::new(1.0, 0.0, -2.0), 10.0, 90.0));
        let frame = encode(&msg).unwrap();
        assert!(decode::<ClientMessage>(&frame[..frame.len() - 1]).is_err());
    }

    #[test]
    fn test_unknown_variant_rejected() {
        let frame = encode(&99u32).unwrap();
        assert!(decode::<ClientMessage>(&frame).is_err());
    }
}
