//! Network Transport
//!
//! Start/stop of the local network role over a relay allocation, plus the
//! message plumbing the ownership protocol rides on.
//!
//! `LoopbackHub` connects transports living in the same process. Every
//! allocation id is a room: the first authority to start on it listens and
//! clients attach to a listening room with the next [`ClientId`]. Messages
//! cross the hub as encoded frames, the same bytes a relay would carry.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use serde::{Serialize, Deserialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::ids::ClientId;
use crate::network::protocol::{decode, encode, ClientMessage, ServerMessage};
use crate::network::relay::RelayConnectionParams;

/// Network role of the local process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetworkRole {
    /// Not connected.
    #[default]
    None,
    /// Authority that is also a local participant.
    Host,
    /// Connected participant.
    Client,
    /// Authority with no local participant.
    DedicatedServer,
}

impl NetworkRole {
    /// Whether this role commits ownership and physics state.
    pub fn is_authority(self) -> bool {
        matches!(self, NetworkRole::Host | NetworkRole::DedicatedServer)
    }

    /// Whether this role has a local participant.
    pub fn has_local_participant(self) -> bool {
        matches!(self, NetworkRole::Host | NetworkRole::Client)
    }
}

impl fmt::Display for NetworkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkRole::None => "none",
            NetworkRole::Host => "host",
            NetworkRole::Client => "client",
            NetworkRole::DedicatedServer => "server",
        };
        f.write_str(name)
    }
}

/// Inbound traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Request from a participant (authority side).
    FromClient {
        /// Sender.
        client_id: ClientId,
        /// Payload.
        message: ClientMessage,
    },
    /// A participant connected (authority side).
    ClientConnected(ClientId),
    /// A participant disconnected (authority side).
    ClientDisconnected(ClientId),
    /// Message from the authority (participant side).
    FromServer(ServerMessage),
}

/// Network transport: role start/stop and message delivery.
pub trait NetworkTransport: Send {
    /// Start `role` over the relay described by `params`. Returns whether
    /// the role is now running.
    fn start(&mut self, role: NetworkRole, params: RelayConnectionParams) -> bool;

    /// Stop the running role. No-op when stopped.
    fn shutdown(&mut self);

    /// Currently running role.
    fn role(&self) -> NetworkRole;

    /// Local participant id, when a participant is running.
    fn local_client_id(&self) -> Option<ClientId>;

    /// Send a request to the authority. In host mode this loops back locally.
    fn send_to_server(&mut self, message: ClientMessage);

    /// Send to every participant (authority only).
    fn broadcast(&mut self, message: ServerMessage);

    /// Send to one participant (authority only).
    fn send_to(&mut self, client_id: ClientId, message: ServerMessage);

    /// Drain inbound traffic.
    fn receive(&mut self) -> Vec<Envelope>;
}

// =============================================================================
// LOOPBACK HUB
// =============================================================================

/// What travels through a room.
#[derive(Debug)]
enum Frame {
    Connected(ClientId),
    Disconnected(ClientId),
    FromClient(ClientId, Vec<u8>),
    FromServer(Vec<u8>),
}

impl Frame {
    fn open(self) -> Option<Envelope> {
        let envelope = match self {
            Frame::Connected(id) => Envelope::ClientConnected(id),
            Frame::Disconnected(id) => Envelope::ClientDisconnected(id),
            Frame::FromClient(client_id, bytes) => match decode(&bytes) {
                Ok(message) => Envelope::FromClient { client_id, message },
                Err(err) => {
                    warn!("Dropping malformed frame from {}: {}", client_id, err);
                    return None;
                }
            },
            Frame::FromServer(bytes) => match decode(&bytes) {
                Ok(message) => Envelope::FromServer(message),
                Err(err) => {
                    warn!("Dropping malformed frame from authority: {}", err);
                    return None;
                }
            },
        };
        Some(envelope)
    }
}

fn seal<T: Serialize>(message: &T) -> Option<Vec<u8>> {
    match encode(message) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!("Could not encode frame: {}", err);
            None
        }
    }
}

#[derive(Default)]
struct Room {
    authority: Option<NetworkRole>,
    inboxes: BTreeMap<ClientId, VecDeque<Frame>>,
    server_inbox: VecDeque<Frame>,
    next_client: u64,
}

#[derive(Default)]
struct HubState {
    rooms: BTreeMap<Uuid, Room>,
}

/// In-process rendezvous connecting [`LoopbackTransport`]s by allocation id.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// New transport attached to this hub.
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            hub: self.clone(),
            allocation: None,
            role: NetworkRole::None,
            local: None,
            refuse_start: false,
        }
    }

    /// Number of rooms with a listening authority.
    pub fn listening_rooms(&self) -> usize {
        self.with_state(|s| s.rooms.values().filter(|r| r.authority.is_some()).count())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut HubState) -> T) -> T {
        // A poisoned hub only means another test thread panicked mid-call.
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

/// Transport endpoint on a [`LoopbackHub`].
pub struct LoopbackTransport {
    hub: LoopbackHub,
    allocation: Option<Uuid>,
    role: NetworkRole,
    local: Option<ClientId>,
    refuse_start: bool,
}

impl LoopbackTransport {
    /// Make every subsequent `start` fail.
    pub fn set_refuse_start(&mut self, refuse: bool) {
        self.refuse_start = refuse;
    }
}

impl NetworkTransport for LoopbackTransport {
    fn start(&mut self, role: NetworkRole, params: RelayConnectionParams) -> bool {
        if self.refuse_start || self.role != NetworkRole::None || role == NetworkRole::None {
            warn!("Transport refused to start as {}", role);
            return false;
        }

        let allocation = params.allocation_id();
        let local = self.hub.with_state(|state| {
            match role {
                NetworkRole::Host | NetworkRole::DedicatedServer => {
                    let room = state.rooms.entry(allocation).or_default();
                    if room.authority.is_some() {
                        return Err("allocation already has an authority");
                    }
                    room.authority = Some(role);
                    room.next_client = room.next_client.max(1);
                    if role == NetworkRole::Host {
                        room.inboxes.insert(ClientId::SERVER, VecDeque::new());
                        Ok(Some(ClientId::SERVER))
                    } else {
                        Ok(None)
                    }
                }
                NetworkRole::Client => {
                    let Some(room) = state.rooms.get_mut(&allocation).filter(|r| r.authority.is_some()) else {
                        return Err("no authority listening on allocation");
                    };
                    let id = ClientId(room.next_client);
                    room.next_client += 1;
                    room.inboxes.insert(id, VecDeque::new());
                    room.server_inbox.push_back(Frame::Connected(id));
                    Ok(Some(id))
                }
                NetworkRole::None => Err("cannot start without a role"),
            }
        });

        match local {
            Ok(local) => {
                info!("Transport started as {} on {}", role, allocation);
                self.allocation = Some(allocation);
                self.role = role;
                self.local = local;
                true
            }
            Err(reason) => {
                warn!("Transport start as {} failed: {}", role, reason);
                false
            }
        }
    }

    fn shutdown(&mut self) {
        let Some(allocation) = self.allocation.take() else {
            return;
        };
        let role = std::mem::take(&mut self.role);
        let local = self.local.take();

        self.hub.with_state(|state| {
            let Some(room) = state.rooms.get_mut(&allocation) else {
                return;
            };
            if role.is_authority() {
                // Clients keep their inboxes until they shut down themselves.
                room.authority = None;
                room.server_inbox.clear();
                if let Some(id) = local {
                    room.inboxes.remove(&id);
                }
                let notice = seal(&ServerMessage::Shutdown {
                    reason: "authority shut down".to_string(),
                });
                if let Some(bytes) = notice {
                    for inbox in room.inboxes.values_mut() {
                        inbox.push_back(Frame::FromServer(bytes.clone()));
                    }
                }
            } else if let Some(id) = local {
                room.inboxes.remove(&id);
                if room.authority.is_some() {
                    room.server_inbox.push_back(Frame::Disconnected(id));
                }
            }
            if room.authority.is_none() && room.inboxes.is_empty() {
                state.rooms.remove(&allocation);
            }
        });
        debug!("Transport shut down ({})", role);
    }

    fn role(&self) -> NetworkRole {
        self.role
    }

    fn local_client_id(&self) -> Option<ClientId> {
        self.local
    }

    fn send_to_server(&mut self, message: ClientMessage) {
        let (Some(allocation), Some(client_id)) = (self.allocation, self.local) else {
            return;
        };
        let Some(bytes) = seal(&message) else {
            return;
        };
        self.hub.with_state(|state| {
            if let Some(room) = state.rooms.get_mut(&allocation).filter(|r| r.authority.is_some()) {
                room.server_inbox.push_back(Frame::FromClient(client_id, bytes));
            }
        });
    }

    fn broadcast(&mut self, message: ServerMessage) {
        let Some(allocation) = self.allocation.filter(|_| self.role.is_authority()) else {
            return;
        };
        let Some(bytes) = seal(&message) else {
            return;
        };
        self.hub.with_state(|state| {
            if let Some(room) = state.rooms.get_mut(&allocation) {
                for inbox in room.inboxes.values_mut() {
                    inbox.push_back(Frame::FromServer(bytes.clone()));
                }
            }
        });
    }

    fn send_to(&mut self, client_id: ClientId, message: ServerMessage) {
        let Some(allocation) = self.allocation.filter(|_| self.role.is_authority()) else {
            return;
        };
        let Some(bytes) = seal(&message) else {
            return;
        };
        self.hub.with_state(|state| {
            if let Some(inbox) = state
                .rooms
                .get_mut(&allocation)
                .and_then(|room| room.inboxes.get_mut(&client_id))
            {
                inbox.push_back(Frame::FromServer(bytes));
            }
        });
    }

    fn receive(&mut self) -> Vec<Envelope> {
        let Some(allocation) = self.allocation else {
            return Vec::new();
        };
        let role = self.role;
        let local = self.local;

        let frames = self.hub.with_state(|state| {
            let Some(room) = state.rooms.get_mut(&allocation) else {
                return Vec::new();
            };
            let mut frames: Vec<Frame> = Vec::new();
            if role.is_authority() {
                frames.extend(room.server_inbox.drain(..));
            }
            if let Some(inbox) = local.and_then(|id| room.inboxes.get_mut(&id)) {
                frames.extend(inbox.drain(..));
            }
            frames
        });
        frames.into_iter().filter_map(Frame::open).collect()
    }
}
