//! Relay Negotiation
//!
//! Requests a relay allocation (authority side) or joins one by code
//! (client side), producing the transport connection parameters.

use std::collections::BTreeMap;
use std::sync::Arc;
use futures_util::future::BoxFuture;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Length of relay join codes.
pub const RELAY_CODE_LEN: usize = 6;

const RELAY_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Relay errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The relay could not allocate a rendezvous.
    #[error("relay allocation failed: {0}")]
    AllocationFailed(String),

    /// The join code was rejected or the allocation is unreachable.
    #[error("relay join failed: {0}")]
    JoinFailed(String),
}

/// Opaque transport descriptor for a relay allocation.
///
/// Deliberately not `Clone`: the transport takes it by value, once.
#[derive(Debug, PartialEq, Eq)]
pub struct RelayConnectionParams {
    allocation_id: Uuid,
    region: String,
    connection_type: &'static str,
    key: Vec<u8>,
}

impl RelayConnectionParams {
    /// Build parameters for `allocation_id`.
    pub fn new(allocation_id: Uuid, region: impl Into<String>, key: Vec<u8>) -> Self {
        Self {
            allocation_id,
            region: region.into(),
            connection_type: "dtls",
            key,
        }
    }

    /// Allocation these parameters connect to.
    pub fn allocation_id(&self) -> Uuid {
        self.allocation_id
    }

    /// Relay region.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Secure transport flavour.
    pub fn connection_type(&self) -> &'static str {
        self.connection_type
    }

    /// Connection key bytes.
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

/// Relay negotiation service.
pub trait RelayNegotiator: Send + Sync {
    /// Allocate a relay for up to `max_peers` remote peers and return the
    /// authority's parameters plus the code peers join with.
    fn create_allocation(
        &self,
        max_peers: u32,
        region: String,
    ) -> BoxFuture<'_, Result<(RelayConnectionParams, String), RelayError>>;

    /// Join an existing allocation.
    fn join_allocation(&self, join_code: String) -> BoxFuture<'_, Result<RelayConnectionParams, RelayError>>;
}

// =============================================================================
// LOOPBACK RELAY
// =============================================================================

struct Allocation {
    id: Uuid,
    region: String,
    max_peers: u32,
    joined: u32,
    key: Vec<u8>,
}

#[derive(Default)]
struct RelayState {
    allocations: BTreeMap<String, Allocation>,
    fail_next: Option<RelayError>,
    created: usize,
    joins: usize,
}

/// In-process relay: allocations live in memory, join codes are random.
#[derive(Clone, Default)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LoopbackRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call fail with `err`.
    pub async fn fail_next(&self, err: RelayError) {
        self.state.lock().await.fail_next = Some(err);
    }

    /// Number of successful allocations.
    pub async fn allocations_created(&self) -> usize {
        self.state.lock().await.created
    }

    /// Number of join attempts.
    pub async fn join_attempts(&self) -> usize {
        self.state.lock().await.joins
    }
}

impl RelayNegotiator for LoopbackRelay {
    fn create_allocation(
        &self,
        max_peers: u32,
        region: String,
    ) -> BoxFuture<'_, Result<(RelayConnectionParams, String), RelayError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if let Some(err) = state.fail_next.take() {
                return Err(err);
            }
            if max_peers == 0 {
                return Err(RelayError::AllocationFailed("max_peers must be positive".into()));
            }

            let code = loop {
                let mut rng = rand::thread_rng();
                let candidate: String = (0..RELAY_CODE_LEN)
                    .map(|_| RELAY_CODE_ALPHABET[rng.gen_range(0..RELAY_CODE_ALPHABET.len())] as char)
                    .collect();
                if !state.allocations.contains_key(&candidate) {
                    break candidate;
                }
            };

            let key: Vec<u8> = (0..16).map(|_| rand::random::<u8>()).collect();
            let id = Uuid::new_v4();
            state.allocations.insert(code.clone(), Allocation {
                id,
                region: region.clone(),
                max_peers,
                joined: 0,
                key: key.clone(),
            });
            state.created += 1;

            debug!("Relay allocated {} in {} ({})", code, region, id);
            Ok((RelayConnectionParams::new(id, region, key), code))
        })
    }

    fn join_allocation(&self, join_code: String) -> BoxFuture<'_, Result<RelayConnectionParams, RelayError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.joins += 1;
            if let Some(err) = state.fail_next.take() {
                return Err(err);
            }

            let allocation = state
                .allocations
                .get_mut(join_code.trim())
                .ok_or_else(|| RelayError::JoinFailed(format!("unknown join code {}", join_code)))?;
            if allocation.joined >= allocation.max_peers {
                return Err(RelayError::JoinFailed("allocation is full".into()));
            }
            allocation.joined += 1;

            Ok(RelayConnectionParams::new(
                allocation.id,
                allocation.region.clone(),
                allocation.key.clone(),
            ))
        })
    }
}
