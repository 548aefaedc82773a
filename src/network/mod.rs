//! Network Layer
//!
//! Session lifecycle and everything it talks to: the matchmaking
//! directory, relay negotiation, the transport and its wire protocol.
//! All external calls are asynchronous; their results are applied at tick
//! boundaries by [`client::GameClient`].

pub mod client;
pub mod directory;
pub mod lifecycle;
pub mod poller;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use client::GameClient;
pub use directory::{
    DirectoryError, DirectoryResult, InMemoryDirectory, InMemoryDirectoryClient, PlayerRecord,
    Session, SessionDirectory,
};
pub use lifecycle::{
    InvalidStateTransition, LifecycleEvent, LifecycleState, SessionLifecycle, SessionStartFailure,
    StartFailureCause,
};
pub use poller::{LocalRoleView, PollSignal, SessionLostReason, SessionPoller};
pub use protocol::{ClientMessage, ServerMessage};
pub use relay::{LoopbackRelay, RelayConnectionParams, RelayError, RelayNegotiator};
pub use transport::{Envelope, LoopbackHub, LoopbackTransport, NetworkRole, NetworkTransport};
