//! Game Logic Module
//!
//! Authority-side simulation of interactive objects and the participant
//! mirror of it.
//!
//! ## Module Structure
//!
//! - `object`: Interactive objects and the registry
//! - `ownership`: Exclusive-holder arbitration
//! - `held`: Holder viewpoints and held-object tracking
//! - `replica`: Participant-side cache of committed state
//! - `input`: Typed input subscriptions and capability sets
//! - `tick`: Authority control object and per-tick ordering

pub mod held;
pub mod input;
pub mod object;
pub mod ownership;
pub mod replica;
pub mod tick;

// Re-export key types
pub use held::{HeldObjectTracker, HolderView};
pub use input::{CapabilitySet, InputDispatcher, InputEvent, InputKind, SubscriptionId};
pub use object::{InteractiveObject, ObjectRegistry, ObjectTransform, PhysicsMode};
pub use ownership::{HolderChanged, OwnershipArbiter, OwnershipOutcome, OwnershipRejected, OwnershipRequest};
pub use replica::ObjectReplica;
pub use tick::{Authority, Outbound, TickResult};
