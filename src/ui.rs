//! Presentation Boundary
//!
//! What the session layer tells the UI, and what the UI tells it back.
//! Widgets, cameras and ray-casts live on the other side of this boundary.

use std::fmt;
use serde::{Serialize, Deserialize};
use tracing::info;

use crate::core::ids::{ObjectId, PlayerIdentity, SessionId};
use crate::core::vec3::Vec3;
use crate::network::directory::Session;

/// Which screen is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MenuState {
    /// Title screen.
    #[default]
    MainMenu,
    /// Create/join choice.
    MultiplayerMenu,
    /// Playing.
    InGame,
    /// Playing, pause menu open.
    Paused,
    /// Session list.
    ServerBrowser,
    /// Waiting in a session before the game starts.
    Lobby,
}

impl fmt::Display for MenuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Receiver of UI-facing updates.
pub trait PresentationSink: Send + Sync {
    /// Switch screens.
    fn set_menu_state(&self, state: MenuState);

    /// Show roster and metadata of the held session.
    fn show_session(&self, session: &Session);

    /// Populate the session browser.
    fn show_server_list(&self, sessions: &[Session]);

    /// Show a user-visible message (failed join, failed create, ...).
    fn show_message(&self, message: &str);

    /// Detach the camera from the player and restore the menu view.
    fn reset_view(&self);
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl PresentationSink for TracingSink {
    fn set_menu_state(&self, state: MenuState) {
        info!("[ui] menu -> {}", state);
    }

    fn show_session(&self, session: &Session) {
        let names: Vec<&str> = session.players.iter().map(|p| p.display_name.as_str()).collect();
        info!(
            "[ui] session {} ({}) code={} players={:?}",
            session.name, session.id, session.join_code, names
        );
    }

    fn show_server_list(&self, sessions: &[Session]) {
        info!("[ui] {} joinable sessions", sessions.len());
    }

    fn show_message(&self, message: &str) {
        info!("[ui] {}", message);
    }

    fn reset_view(&self) {
        info!("[ui] view reset");
    }
}

/// User commands coming from the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum UiCommand {
    /// Open the create/join menu.
    OpenMultiplayer,
    /// Open the session browser (refreshes the list).
    OpenServerBrowser,
    /// Refresh the session list.
    RefreshServers,
    /// Create and host a lobby.
    CreateSession {
        /// Lobby name.
        name: String,
    },
    /// Join a lobby by join code.
    JoinByCode(String),
    /// Join a lobby picked in the browser.
    JoinById(SessionId),
    /// Host only: start the game for everyone in the lobby.
    StartGame,
    /// Leave the lobby or the running game.
    Leave,
    /// Host only: remove a player from the lobby.
    Kick(PlayerIdentity),
    /// Open or close the pause menu.
    Pause(bool),
    /// Interact with the object under the crosshair, or drop the held one.
    Interact {
        /// Object the presentation layer's ray-cast hit.
        target: Option<ObjectId>,
    },
    /// Move the held object nearer/further.
    Scroll(f32),
    /// Report the local viewpoint.
    Look {
        /// Body position.
        position: Vec3,
        /// Pitch (degrees).
        pitch: f32,
        /// Yaw (degrees).
        yaw: f32,
    },
    /// Spawn a test object in front of the player.
    SpawnTestObject {
        /// Spawn position.
        position: Vec3,
    },
    /// Change view sensitivity.
    SetSensitivity(f32),
    /// Exit the application.
    Quit,
}
