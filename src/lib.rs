//! # Session Arbiter
//!
//! Multiplayer session lifecycle and object-ownership arbitration for a
//! relay-connected, host-authoritative game client.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SESSION ARBITER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/            - Plain values and ambient concerns        │
//! │  ├── ids.rs       - Player, session, client, object ids      │
//! │  ├── vec3.rs      - Float vector math                        │
//! │  ├── config.rs    - Client configuration                     │
//! │  └── prefs.rs     - Persisted view sensitivity               │
//! │                                                              │
//! │  game/            - Authority-side simulation                │
//! │  ├── object.rs    - Interactive objects and registry         │
//! │  ├── ownership.rs - Exclusive-holder arbitration             │
//! │  ├── held.rs      - Held-object tracking                     │
//! │  ├── replica.rs   - Participant mirror of committed state    │
//! │  ├── input.rs     - Typed input subscriptions                │
//! │  └── tick.rs      - Authority control object                 │
//! │                                                              │
//! │  network/         - Async collaborators and orchestration    │
//! │  ├── directory.rs - Matchmaking directory client             │
//! │  ├── relay.rs     - Relay allocation / join                  │
//! │  ├── transport.rs - Network role start/stop and messaging    │
//! │  ├── protocol.rs  - Wire messages                            │
//! │  ├── lifecycle.rs - Session state machine                    │
//! │  ├── poller.rs    - Directory reconciliation                 │
//! │  └── client.rs    - Per-process orchestrator                 │
//! │                                                              │
//! │  ui.rs            - Presentation boundary                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering Guarantee
//!
//! Directory and relay calls never block a tick. They run on spawned
//! tasks and their completions are applied at the next simulation tick
//! boundary, before inbound traffic. Within an authority tick, ownership
//! requests are decided before held objects are moved.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

use std::time::Duration;

pub mod core;
pub mod game;
pub mod network;
pub mod ui;

// Re-export commonly used types
pub use crate::core::{ClientConfig, ClientId, ObjectId, PlayerIdentity, Preferences, SessionId, Vec3};
pub use crate::game::{Authority, OwnershipArbiter, OwnershipRejected};
pub use crate::network::{GameClient, NetworkRole, SessionLifecycle, SessionPoller};
pub use crate::ui::{MenuState, PresentationSink, TracingSink, UiCommand};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Simulation tick rate (Hz)
pub const TICK_RATE: u32 = 60;

/// Directory reconciliation interval
pub const POLL_INTERVAL: Duration = Duration::from_millis(1100);

/// Host heartbeat interval
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Camera height above the body position (metres)
pub const CAMERA_HEIGHT: f32 = 0.825;

/// Closest a held object may be to the eye (metres)
pub const HOLD_DISTANCE_MIN: f32 = 1.0;

/// Furthest a held object may be from the eye (metres)
pub const HOLD_DISTANCE_MAX: f32 = 15.0;

/// Hold distance of a freshly picked up object (metres)
pub const DEFAULT_HOLD_DISTANCE: f32 = 6.0;

/// Convergence rate of held objects towards their target (per second)
pub const HOLD_SMOOTHING_RATE: f32 = 10.0;

/// Registry size past which participant spawn requests are refused
pub const MAX_OBJECTS: usize = 64;
