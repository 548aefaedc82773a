//! Core primitives and ambient concerns.
//!
//! Identifiers, vector math, configuration and persisted preferences.
//! Nothing in here performs network I/O.

pub mod config;
pub mod ids;
pub mod prefs;
pub mod vec3;

// Re-export core types
pub use config::{ClientConfig, ConfigError};
pub use ids::{ClientId, ObjectId, PlayerIdentity, SessionId};
pub use prefs::{Preferences, PrefsError};
pub use vec3::{Rotation, Vec3};
