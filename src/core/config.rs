//! Client Configuration
//!
//! Defaults match the reference game client; every field can be
//! overridden from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::core::vec3::Vec3;
use crate::{HEARTBEAT_INTERVAL, MAX_OBJECTS, POLL_INTERVAL, TICK_RATE};

/// Configuration for one game client process.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Display name published in the session roster.
    pub player_name: String,
    /// Capacity of sessions this client creates.
    pub session_capacity: u32,
    /// Maximum peers requested from the relay (excluding the host).
    pub relay_max_peers: u32,
    /// Preferred relay region.
    pub relay_region: String,
    /// Reconciliation (directory poll) interval.
    pub poll_interval: Duration,
    /// Host heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Simulation tick rate (Hz).
    pub tick_rate: u32,
    /// Where preferences are persisted.
    pub prefs_path: PathBuf,
    /// Positions of the fixed object registry created when the authority starts.
    pub scene_objects: Vec<Vec3>,
    /// Object count at which the authority stops honouring spawn requests.
    pub max_objects: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            player_name: "Player".to_string(),
            session_capacity: 10,
            relay_max_peers: 3,
            relay_region: "europe-west4".to_string(),
            poll_interval: POLL_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            tick_rate: TICK_RATE,
            prefs_path: PathBuf::from("preferences.json"),
            scene_objects: vec![Vec3::new(0.0, 4.0, 0.0)],
            max_objects: MAX_OBJECTS,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held a value that could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },

    /// A value parsed but is out of range.
    #[error("{var} must be greater than zero")]
    Zero {
        /// Variable name.
        var: &'static str,
    },
}

impl ClientConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("SESSION_PLAYER_NAME") {
            config.player_name = name;
        }
        if let Some(capacity) = parse_var::<u32>("SESSION_CAPACITY")? {
            config.session_capacity = nonzero("SESSION_CAPACITY", capacity)?;
        }
        if let Some(peers) = parse_var::<u32>("RELAY_MAX_PEERS")? {
            config.relay_max_peers = nonzero("RELAY_MAX_PEERS", peers)?;
        }
        if let Ok(region) = std::env::var("RELAY_REGION") {
            config.relay_region = region;
        }
        if let Some(ms) = parse_var::<u64>("SESSION_POLL_MS")? {
            config.poll_interval = Duration::from_millis(nonzero("SESSION_POLL_MS", ms)?);
        }
        if let Some(ms) = parse_var::<u64>("SESSION_HEARTBEAT_MS")? {
            config.heartbeat_interval = Duration::from_millis(nonzero("SESSION_HEARTBEAT_MS", ms)?);
        }
        if let Some(rate) = parse_var::<u32>("SIM_TICK_RATE")? {
            config.tick_rate = nonzero("SIM_TICK_RATE", rate)?;
        }
        if let Some(max) = parse_var::<usize>("SESSION_MAX_OBJECTS")? {
            config.max_objects = nonzero("SESSION_MAX_OBJECTS", max)?;
        }
        if let Ok(path) = std::env::var("PREFS_PATH") {
            config.prefs_path = PathBuf::from(path);
        }

        Ok(config)
    }

    /// Duration of one simulation tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_rate.max(1) as u64)
    }
}

fn parse_var<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(None),
    }
}

fn nonzero<T: PartialEq + Default>(var: &'static str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        Err(ConfigError::Zero { var })
    } else {
        Ok(value)
    }
}
