//! Session Lifecycle
//!
//! State machine that brings the local network role up and down:
//!
//! ```text
//! Idle ──start──▶ Starting(role) ──relay + transport ok──▶ Active(role)
//!  ▲                   │  │                                    │
//!  │      failure ◀────┘  └──disconnect──┐      disconnect ◀───┘
//!  │                                     ▼
//!  └──────── leave resolved ◀──── ShuttingDown
//! ```
//!
//! Relay negotiation and the directory `leave` run on spawned tasks. Their
//! completions come back over a channel and are applied by [`SessionLifecycle::pump`]
//! at the next tick boundary. Every `start` and `disconnect` bumps a
//! generation counter; a completion carrying an older generation is
//! discarded, so a slow start can never resurrect a session the user
//! already left.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::ids::SessionId;
use crate::game::input::CapabilitySet;
use crate::network::directory::{DirectoryResult, SessionDirectory, RELAY_JOIN_CODE_KEY};
use crate::network::relay::{RelayConnectionParams, RelayError, RelayNegotiator};
use crate::network::transport::{NetworkRole, NetworkTransport};
use crate::ui::{MenuState, PresentationSink};

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// No network role.
    #[default]
    Idle,
    /// Relay negotiation or transport start in flight.
    Starting(NetworkRole),
    /// Network role running.
    Active(NetworkRole),
    /// Leaving the session and stopping the transport.
    ShuttingDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Idle => f.write_str("idle"),
            LifecycleState::Starting(role) => write!(f, "starting({})", role),
            LifecycleState::Active(role) => write!(f, "active({})", role),
            LifecycleState::ShuttingDown => f.write_str("shutting down"),
        }
    }
}

/// A lifecycle operation was called in a state that does not allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {action} while {state}")]
pub struct InvalidStateTransition {
    /// State at the time of the call.
    pub state: LifecycleState,
    /// What was attempted.
    pub action: &'static str,
}

/// Why a start failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartFailureCause {
    /// Relay allocation or join failed.
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// A client start was requested without a relay join code.
    #[error("no relay join code")]
    MissingJoinCode,

    /// The network transport would not start the role.
    #[error("network transport refused to start")]
    TransportRefused,
}

/// A start reverted to `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to start as {role}: {cause}")]
pub struct SessionStartFailure {
    /// Role that was being started.
    pub role: NetworkRole,
    /// What went wrong.
    pub cause: StartFailureCause,
}

/// Something the lifecycle did that its owner must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `Starting` resolved into `Active`.
    Activated {
        /// Running role.
        role: NetworkRole,
    },
    /// An authority became active: create the control object.
    SpawnControlObject,
    /// `Starting` resolved back into `Idle`.
    StartFailed(SessionStartFailure),
    /// Shutdown finished, state is `Idle`.
    ShutDown {
        /// Role that was stopped.
        role: NetworkRole,
    },
}

#[derive(Debug)]
enum Completion {
    Started {
        generation: u64,
        role: NetworkRole,
        result: Result<RelayConnectionParams, StartFailureCause>,
    },
    Left {
        generation: u64,
        role: NetworkRole,
        result: DirectoryResult<()>,
    },
}

/// Orchestrates directory, relay and transport for the local role.
pub struct SessionLifecycle {
    directory: Arc<dyn SessionDirectory>,
    relay: Arc<dyn RelayNegotiator>,
    transport: Box<dyn NetworkTransport>,
    ui: Arc<dyn PresentationSink>,
    region: String,
    max_peers: u32,
    state: LifecycleState,
    generation: u64,
    paused: bool,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
}

impl SessionLifecycle {
    /// Create an idle lifecycle.
    pub fn new(
        directory: Arc<dyn SessionDirectory>,
        relay: Arc<dyn RelayNegotiator>,
        transport: Box<dyn NetworkTransport>,
        ui: Arc<dyn PresentationSink>,
        region: impl Into<String>,
        max_peers: u32,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            directory,
            relay,
            transport,
            ui,
            region: region.into(),
            max_peers,
            state: LifecycleState::Idle,
            generation: 0,
            paused: false,
            completions_tx,
            completions_rx,
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Running role, `None` unless `Active`.
    pub fn role(&self) -> NetworkRole {
        match self.state {
            LifecycleState::Active(role) => role,
            _ => NetworkRole::None,
        }
    }

    /// Whether a start or shutdown is in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(self.state, LifecycleState::Starting(_) | LifecycleState::ShuttingDown)
    }

    /// Whether a network role is running or being started.
    pub fn in_network_role(&self) -> bool {
        matches!(self.state, LifecycleState::Starting(_) | LifecycleState::Active(_))
    }

    /// Local pause flag.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Input capabilities implied by the pause flag.
    pub fn input_capabilities(&self) -> CapabilitySet {
        if self.paused {
            CapabilitySet::PauseOnly
        } else {
            CapabilitySet::Gameplay
        }
    }

    /// Menu projection of the lifecycle. `idle_menu` is what an idle client
    /// shows (main or multiplayer menu, browser, lobby).
    pub fn menu_state(&self, idle_menu: MenuState) -> MenuState {
        match self.state {
            LifecycleState::Idle | LifecycleState::Starting(_) => idle_menu,
            LifecycleState::Active(_) if self.paused => MenuState::Paused,
            LifecycleState::Active(_) => MenuState::InGame,
            LifecycleState::ShuttingDown => MenuState::MainMenu,
        }
    }

    /// Transport, for message traffic while `Active`.
    pub fn transport_mut(&mut self) -> &mut dyn NetworkTransport {
        self.transport.as_mut()
    }

    /// Begin starting `role`.
    ///
    /// Authorities allocate a relay and, when `session` is given, publish the
    /// relay join code to it. Clients join the allocation behind `join_code`.
    /// The outcome arrives through [`pump`](Self::pump).
    pub fn start(
        &mut self,
        role: NetworkRole,
        join_code: Option<String>,
        session: Option<SessionId>,
    ) -> Result<(), InvalidStateTransition> {
        if self.state != LifecycleState::Idle {
            return Err(InvalidStateTransition { state: self.state, action: "start" });
        }
        if role == NetworkRole::None {
            return Err(InvalidStateTransition { state: self.state, action: "start without a role" });
        }

        self.generation += 1;
        self.state = LifecycleState::Starting(role);
        info!("Starting as {} (generation {})", role, self.generation);

        let generation = self.generation;
        let tx = self.completions_tx.clone();

        if role == NetworkRole::Client {
            let Some(code) = join_code.filter(|c| !c.is_empty()) else {
                let _ = tx.send(Completion::Started {
                    generation,
                    role,
                    result: Err(StartFailureCause::MissingJoinCode),
                });
                return Ok(());
            };
            let relay = self.relay.clone();
            tokio::spawn(async move {
                let result = relay.join_allocation(code).await.map_err(StartFailureCause::from);
                let _ = tx.send(Completion::Started { generation, role, result });
            });
        } else {
            let relay = self.relay.clone();
            let directory = self.directory.clone();
            let region = self.region.clone();
            let max_peers = self.max_peers;
            tokio::spawn(async move {
                let result = allocate_and_publish(relay, directory, max_peers, region, session).await;
                let _ = tx.send(Completion::Started { generation, role, result });
            });
        }

        Ok(())
    }

    /// Leave the session and stop the network role.
    ///
    /// `session` is the directory session to leave and whether to leave it
    /// as owner (deleting it). A pending start is superseded.
    pub fn disconnect(&mut self, session: Option<(SessionId, bool)>) -> Result<(), InvalidStateTransition> {
        let role = match self.state {
            LifecycleState::Active(role) | LifecycleState::Starting(role) => role,
            state => return Err(InvalidStateTransition { state, action: "disconnect" }),
        };

        self.generation += 1;
        self.state = LifecycleState::ShuttingDown;
        info!("Disconnecting {} (generation {})", role, self.generation);

        let generation = self.generation;
        let tx = self.completions_tx.clone();
        let directory = self.directory.clone();
        tokio::spawn(async move {
            let result = match session {
                Some((id, as_owner)) => directory.leave(id, as_owner).await,
                None => Ok(()),
            };
            let _ = tx.send(Completion::Left { generation, role, result });
        });

        Ok(())
    }

    /// Stop the network role immediately without touching the directory.
    /// Used when the session is already gone.
    pub fn abandon(&mut self) -> Option<LifecycleEvent> {
        let role = match self.state {
            LifecycleState::Active(role) | LifecycleState::Starting(role) => role,
            _ => return None,
        };

        self.generation += 1;
        self.transport.shutdown();
        self.ui.reset_view();
        self.paused = false;
        self.state = LifecycleState::Idle;
        info!("Abandoned {} role", role);
        Some(LifecycleEvent::ShutDown { role })
    }

    /// Toggle the local pause menu. Only valid while `Active`.
    pub fn set_paused(&mut self, paused: bool) -> Result<(), InvalidStateTransition> {
        if !matches!(self.state, LifecycleState::Active(_)) {
            return Err(InvalidStateTransition { state: self.state, action: "pause" });
        }
        self.paused = paused;
        self.ui.set_menu_state(if paused { MenuState::Paused } else { MenuState::InGame });
        Ok(())
    }

    /// Apply every completion that has arrived.
    pub fn pump(&mut self) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        while let Ok(completion) = self.completions_rx.try_recv() {
            events.extend(self.apply(completion));
        }
        events
    }

    /// Wait for the next completion and apply it.
    pub async fn next_completion(&mut self) -> Vec<LifecycleEvent> {
        match self.completions_rx.recv().await {
            Some(completion) => self.apply(completion),
            None => Vec::new(),
        }
    }

    fn apply(&mut self, completion: Completion) -> Vec<LifecycleEvent> {
        match completion {
            Completion::Started { generation, role, result } => {
                if generation != self.generation || self.state != LifecycleState::Starting(role) {
                    debug!("Discarding obsolete start completion (generation {})", generation);
                    return Vec::new();
                }

                let cause = match result {
                    Ok(params) => {
                        if self.transport.start(role, params) {
                            return self.activate(role);
                        }
                        StartFailureCause::TransportRefused
                    }
                    Err(cause) => cause,
                };

                self.state = LifecycleState::Idle;
                let failure = SessionStartFailure { role, cause };
                warn!("{}", failure);
                vec![LifecycleEvent::StartFailed(failure)]
            }

            Completion::Left { generation, role, result } => {
                if generation != self.generation || self.state != LifecycleState::ShuttingDown {
                    debug!("Discarding obsolete leave completion (generation {})", generation);
                    return Vec::new();
                }
                if let Err(err) = result {
                    warn!("Directory leave failed during disconnect: {}", err);
                }

                self.transport.shutdown();
                self.ui.reset_view();
                self.ui.set_menu_state(MenuState::MainMenu);
                self.paused = false;
                self.state = LifecycleState::Idle;
                info!("Shut down {} role", role);
                vec![LifecycleEvent::ShutDown { role }]
            }
        }
    }

    fn activate(&mut self, role: NetworkRole) -> Vec<LifecycleEvent> {
        self.state = LifecycleState::Active(role);
        self.paused = false;
        self.ui.set_menu_state(MenuState::InGame);
        info!("Active as {}", role);

        let mut events = vec![LifecycleEvent::Activated { role }];
        if role.is_authority() {
            events.push(LifecycleEvent::SpawnControlObject);
        }
        events
    }
}

async fn allocate_and_publish(
    relay: Arc<dyn RelayNegotiator>,
    directory: Arc<dyn SessionDirectory>,
    max_peers: u32,
    region: String,
    session: Option<SessionId>,
) -> Result<RelayConnectionParams, StartFailureCause> {
    let (params, code) = relay.create_allocation(max_peers, region).await?;

    if let Some(session_id) = session {
        let mut patch = BTreeMap::new();
        patch.insert(RELAY_JOIN_CODE_KEY.to_string(), code.clone());
        match directory.update_metadata(session_id, patch).await {
            Ok(_) => info!("Published relay join code {}", code),
            Err(err) => warn!("Failed to publish relay join code: {}", err),
        }
    }

    Ok(params)
}
