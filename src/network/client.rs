//! Game Client
//!
//! Ties the session layer together for one process: user commands in,
//! directory/relay/transport work out, and a fixed order of application at
//! every simulation tick boundary:
//!
//! 1. user-action completions (create, join, list, leave, kick, start game)
//! 2. lifecycle completions
//! 3. poller results
//! 4. inbound network traffic
//! 5. authority tick (ownership, then held tracking)
//! 6. outbound traffic

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::config::ClientConfig;
use crate::core::ids::{ClientId, ObjectId, PlayerIdentity, SessionId};
use crate::core::prefs::{Preferences, PrefsError};
use crate::game::held::HolderView;
use crate::game::input::{CapabilitySet, InputDispatcher, InputEvent};
use crate::game::replica::ObjectReplica;
use crate::game::tick::{Authority, Outbound};
use crate::network::directory::{
    initial_metadata, DirectoryResult, Session, SessionDirectory, GAME_STARTED_KEY,
};
use crate::network::lifecycle::{LifecycleEvent, LifecycleState, SessionLifecycle};
use crate::network::poller::{LocalRoleView, PollSignal, SessionPoller};
use crate::network::protocol::{ClientMessage, ServerMessage};
use crate::network::relay::RelayNegotiator;
use crate::network::transport::{Envelope, NetworkRole, NetworkTransport};
use crate::ui::{MenuState, PresentationSink, UiCommand};

#[derive(Debug)]
enum ActionCompletion {
    Created(DirectoryResult<Session>),
    Joined(DirectoryResult<Session>),
    Listed(DirectoryResult<Vec<Session>>),
    LeftLobby(DirectoryResult<()>),
    Kicked {
        player: PlayerIdentity,
        result: DirectoryResult<()>,
    },
    GameStarted(DirectoryResult<Session>),
}

/// One game client process.
pub struct GameClient {
    config: ClientConfig,
    directory: Arc<dyn SessionDirectory>,
    ui: Arc<dyn PresentationSink>,
    lifecycle: SessionLifecycle,
    poller: SessionPoller,
    authority: Option<Authority>,
    replica: ObjectReplica,
    input: InputDispatcher,
    prefs: Preferences,
    idle_menu: MenuState,
    local_view: Option<HolderView>,
    view_dirty: bool,
    action_in_flight: bool,
    leaving: Option<Session>,
    quit: bool,
    actions_tx: mpsc::UnboundedSender<ActionCompletion>,
    actions_rx: mpsc::UnboundedReceiver<ActionCompletion>,
}

impl GameClient {
    /// Build a client from its collaborators.
    pub fn new(
        config: ClientConfig,
        directory: Arc<dyn SessionDirectory>,
        relay: Arc<dyn RelayNegotiator>,
        transport: Box<dyn NetworkTransport>,
        ui: Arc<dyn PresentationSink>,
        prefs: Preferences,
    ) -> Self {
        let lifecycle = SessionLifecycle::new(
            directory.clone(),
            relay,
            transport,
            ui.clone(),
            config.relay_region.clone(),
            config.relay_max_peers,
        );
        let poller = SessionPoller::new(directory.clone(), config.heartbeat_interval);
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();

        Self {
            config,
            directory,
            ui,
            lifecycle,
            poller,
            authority: None,
            replica: ObjectReplica::new(),
            input: InputDispatcher::new(),
            prefs,
            idle_menu: MenuState::MainMenu,
            local_view: None,
            view_dirty: false,
            action_in_flight: false,
            leaving: None,
            quit: false,
            actions_tx,
            actions_rx,
        }
    }

    /// Session lifecycle.
    pub fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }

    /// Held session snapshot.
    pub fn session(&self) -> Option<&Session> {
        self.poller.session()
    }

    /// Authority control object, on an authority.
    pub fn authority(&self) -> Option<&Authority> {
        self.authority.as_ref()
    }

    /// Mirror of committed object state.
    pub fn replica(&self) -> &ObjectReplica {
        &self.replica
    }

    /// Preferences.
    pub fn prefs(&self) -> &Preferences {
        &self.prefs
    }

    /// Input subscriptions.
    pub fn input_mut(&mut self) -> &mut InputDispatcher {
        &mut self.input
    }

    /// Current menu projection.
    pub fn menu_state(&self) -> MenuState {
        self.lifecycle.menu_state(self.idle_menu)
    }

    /// Local participant id while a participant role runs.
    pub fn local_client_id(&mut self) -> Option<ClientId> {
        if self.lifecycle.role().has_local_participant() {
            self.lifecycle.transport_mut().local_client_id()
        } else {
            None
        }
    }

    /// Whether `Quit` was requested.
    pub fn quit_requested(&self) -> bool {
        self.quit
    }

    /// Deliver a raw input event to subscribers.
    pub fn handle_input(&mut self, event: InputEvent) -> usize {
        self.input.dispatch(event)
    }

    /// Handle one user command.
    pub fn handle_command(&mut self, command: UiCommand) {
        debug!("Command {:?}", command);
        match command {
            UiCommand::OpenMultiplayer => self.show_idle_menu(MenuState::MultiplayerMenu),
            UiCommand::OpenServerBrowser => {
                self.show_idle_menu(MenuState::ServerBrowser);
                self.refresh_servers();
            }
            UiCommand::RefreshServers => self.refresh_servers(),
            UiCommand::CreateSession { name } => {
                if self.can_enter_session("create") {
                    let capacity = self.config.session_capacity;
                    self.spawn_action(move |d| async move {
                        ActionCompletion::Created(d.create(name, capacity, initial_metadata()).await)
                    });
                }
            }
            UiCommand::JoinByCode(code) => {
                if self.can_enter_session("join") {
                    self.spawn_action(move |d| async move {
                        ActionCompletion::Joined(d.join_by_code(code).await)
                    });
                }
            }
            UiCommand::JoinById(id) => {
                if self.can_enter_session("join") {
                    self.spawn_action(move |d| async move {
                        ActionCompletion::Joined(d.join_by_id(id).await)
                    });
                }
            }
            UiCommand::StartGame => self.start_game(),
            UiCommand::Leave => self.leave(),
            UiCommand::Kick(player) => self.kick(player),
            UiCommand::Pause(paused) => match self.lifecycle.set_paused(paused) {
                Ok(()) => self.input.set_capabilities(self.lifecycle.input_capabilities()),
                Err(err) => debug!("Pause ignored: {}", err),
            },
            UiCommand::Interact { target } => self.interact(target),
            UiCommand::Scroll(delta) => {
                if let Some(object_id) = self.held_object() {
                    self.send_to_server(ClientMessage::AdjustHoldDistance { object_id, delta });
                }
            }
            UiCommand::Look { position, pitch, yaw } => {
                self.local_view = Some(HolderView::new(position, pitch, yaw));
                self.view_dirty = true;
            }
            UiCommand::SpawnTestObject { position } => {
                self.send_to_server(ClientMessage::SpawnObject { position });
            }
            UiCommand::SetSensitivity(value) => self.prefs.set_sensitivity(value),
            UiCommand::Quit => self.quit = true,
        }
    }

    /// Run one reconciliation tick.
    pub fn reconcile(&mut self, now: Instant) {
        self.poller.tick(now);
    }

    /// Run one simulation tick boundary.
    pub fn simulate(&mut self, dt: f32) {
        // 1. User actions
        while let Ok(completion) = self.actions_rx.try_recv() {
            self.apply_action(completion);
        }

        // 2. Lifecycle
        let events = self.lifecycle.pump();
        self.handle_lifecycle_events(events);

        // 3. Poller
        let local = LocalRoleView {
            in_network_role: self.lifecycle.in_network_role(),
            transitioning: self.lifecycle.is_transitioning(),
        };
        for signal in self.poller.pump(local) {
            self.handle_poll_signal(signal);
        }

        // 4. Inbound
        if self.lifecycle.role() != NetworkRole::None {
            let inbound = self.lifecycle.transport_mut().receive();
            for envelope in inbound {
                self.handle_envelope(envelope);
            }
        }

        // 5. Authority
        let outbound = match self.authority.as_mut() {
            Some(authority) => authority.tick(dt).outbound,
            None => Vec::new(),
        };

        // 6. Outbound
        if self.lifecycle.role() == NetworkRole::None {
            return;
        }
        let transport = self.lifecycle.transport_mut();
        for message in outbound {
            match message {
                Outbound::Broadcast(msg) => transport.broadcast(msg),
                Outbound::SendTo(client, msg) => transport.send_to(client, msg),
            }
        }
        if self.view_dirty {
            if let Some(view) = self.local_view {
                self.view_dirty = false;
                self.send_to_server(ClientMessage::ViewUpdate(view));
            }
        }
    }

    /// Drive the client until `commands` closes, `Quit`, or `shutdown` fires.
    pub async fn run(
        &mut self,
        mut commands: mpsc::Receiver<UiCommand>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), PrefsError> {
        let tick_duration = self.config.tick_duration();
        let dt = tick_duration.as_secs_f32();

        let mut sim = interval(tick_duration);
        sim.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.ui.set_menu_state(self.menu_state());
        info!("Client running at {} Hz", self.config.tick_rate);

        loop {
            tokio::select! {
                _ = sim.tick() => self.simulate(dt),
                _ = poll.tick() => self.reconcile(Instant::now()),
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = shutdown.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
            if self.quit {
                break;
            }
        }

        self.shutdown().await
    }

    /// Leave any session, stop the network role and save preferences.
    pub async fn shutdown(&mut self) -> Result<(), PrefsError> {
        let stopping = match self.lifecycle.state() {
            LifecycleState::Starting(_) | LifecycleState::Active(_) => {
                let target = self.leave_target();
                self.lifecycle.disconnect(target).is_ok()
            }
            LifecycleState::ShuttingDown => true,
            LifecycleState::Idle => false,
        };

        if stopping {
            while self.lifecycle.state() != LifecycleState::Idle {
                let events = self.lifecycle.next_completion().await;
                self.handle_lifecycle_events(events);
            }
        } else if let Some(session) = self.poller.detach() {
            let as_owner = session.is_host(self.directory.identity());
            if let Err(err) = self.directory.leave(session.id, as_owner).await {
                warn!("Leave on shutdown failed: {}", err);
            }
        }

        self.input.clear();
        self.prefs.save(&self.config.prefs_path)?;
        info!("Client shut down");
        Ok(())
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn spawn_action<F, Fut>(&mut self, f: F)
    where
        F: FnOnce(Arc<dyn SessionDirectory>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ActionCompletion> + Send + 'static,
    {
        let directory = self.directory.clone();
        let tx = self.actions_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(f(directory).await);
        });
    }

    fn show_idle_menu(&mut self, menu: MenuState) {
        if self.lifecycle.state() == LifecycleState::Idle {
            self.idle_menu = menu;
            self.ui.set_menu_state(menu);
        }
    }

    fn refresh_servers(&mut self) {
        self.spawn_action(|d| async move { ActionCompletion::Listed(d.list().await) });
    }

    fn can_enter_session(&mut self, action: &str) -> bool {
        if self.poller.session().is_some()
            || self.leaving.is_some()
            || self.lifecycle.state() != LifecycleState::Idle
        {
            debug!("Cannot {} while in a session", action);
            return false;
        }
        if self.action_in_flight {
            debug!("Cannot {}: another session request is pending", action);
            return false;
        }
        self.action_in_flight = true;
        true
    }

    fn start_game(&mut self) {
        let Some(session) = self.poller.session() else {
            return;
        };
        if !self.poller.is_host() || self.lifecycle.state() != LifecycleState::Idle {
            debug!("Start game ignored");
            return;
        }
        let id = session.id.clone();
        self.spawn_action(move |d| async move {
            let mut patch = BTreeMap::new();
            patch.insert(GAME_STARTED_KEY.to_string(), "true".to_string());
            ActionCompletion::GameStarted(d.update_metadata(id, patch).await)
        });
    }

    fn leave(&mut self) {
        if self.lifecycle.in_network_role() {
            let target = self.leave_target();
            if let Err(err) = self.lifecycle.disconnect(target) {
                debug!("Leave ignored: {}", err);
            }
            return;
        }

        // Stop reconciling now so a late snapshot cannot start a join.
        let as_owner = self.poller.is_host();
        let Some(session) = self.poller.detach() else {
            return;
        };
        let id = session.id.clone();
        self.leaving = Some(session);
        self.spawn_action(move |d| async move {
            ActionCompletion::LeftLobby(d.leave(id, as_owner).await)
        });
    }

    fn leave_target(&self) -> Option<(SessionId, bool)> {
        self.poller
            .session()
            .map(|s| (s.id.clone(), s.is_host(self.directory.identity())))
    }

    fn kick(&mut self, player: PlayerIdentity) {
        let Some(session) = self.poller.session() else {
            return;
        };
        if !self.poller.is_host() {
            warn!("Only the host can kick players");
            return;
        }
        if &player == self.directory.identity() {
            warn!("Host cannot kick themselves");
            return;
        }
        let id = session.id.clone();
        self.spawn_action(move |d| async move {
            let result = d.kick(id, player.clone()).await;
            ActionCompletion::Kicked { player, result }
        });
    }

    fn interact(&mut self, target: Option<ObjectId>) {
        if self.lifecycle.is_paused() {
            return;
        }
        let message = match (self.held_object(), target) {
            (Some(object_id), _) => ClientMessage::Drop { object_id },
            (None, Some(object_id)) => ClientMessage::Pickup { object_id },
            (None, None) => return,
        };
        self.send_to_server(message);
    }

    fn held_object(&mut self) -> Option<ObjectId> {
        let local = self.local_client_id()?;
        match &self.authority {
            Some(authority) => authority.arbiter().registry().held_by(local),
            None => self.replica.held_by(local),
        }
    }

    fn send_to_server(&mut self, message: ClientMessage) {
        if self.lifecycle.role().has_local_participant() {
            self.lifecycle.transport_mut().send_to_server(message);
        }
    }

    // =========================================================================
    // Completions
    // =========================================================================

    fn apply_action(&mut self, completion: ActionCompletion) {
        match completion {
            ActionCompletion::Created(result) | ActionCompletion::Joined(result) => {
                self.action_in_flight = false;
                match result {
                    Ok(session) => self.enter_lobby(session),
                    Err(err) => self.ui.show_message(&format!("Could not enter session: {}", err)),
                }
            }
            ActionCompletion::Listed(result) => match result {
                Ok(sessions) => self.ui.show_server_list(&sessions),
                Err(err) => self.ui.show_message(&format!("Could not list sessions: {}", err)),
            },
            ActionCompletion::LeftLobby(result) => {
                let session = self.leaving.take();
                match result {
                    Ok(()) => {
                        if self.lifecycle.in_network_role() {
                            // Already out of the directory session.
                            if let Err(err) = self.lifecycle.disconnect(None) {
                                debug!("Disconnect ignored: {}", err);
                            }
                        }
                        self.show_idle_menu(MenuState::MultiplayerMenu);
                    }
                    Err(err) => {
                        if let Some(session) = session {
                            self.poller.attach(session);
                        }
                        self.ui.show_message(&format!("Could not leave session: {}", err));
                    }
                }
            }
            ActionCompletion::Kicked { player, result } => match result {
                Ok(()) => info!("Kicked {}", player),
                Err(err) => self.ui.show_message(&format!("Could not kick {}: {}", player, err)),
            },
            ActionCompletion::GameStarted(result) => match result {
                Ok(session) => {
                    if self.poller.session().map(|s| &s.id) != Some(&session.id) {
                        debug!("Game started for {} after leaving it", session.id);
                        return;
                    }
                    self.ui.show_session(&session);
                    if let Err(err) = self.lifecycle.start(NetworkRole::Host, None, Some(session.id)) {
                        debug!("Start game ignored: {}", err);
                    }
                }
                Err(err) => self.ui.show_message(&format!("Could not start game: {}", err)),
            },
        }
    }

    fn enter_lobby(&mut self, session: Session) {
        if self.poller.session().is_some() || self.lifecycle.state() != LifecycleState::Idle {
            warn!("Entered {} while busy; ignoring", session.id);
            return;
        }
        self.ui.show_session(&session);
        self.poller.attach(session);
        self.show_idle_menu(MenuState::Lobby);
    }

    fn handle_lifecycle_events(&mut self, events: Vec<LifecycleEvent>) {
        for event in events {
            match event {
                LifecycleEvent::Activated { role } => {
                    info!("Session active as {}", role);
                    self.replica.clear();
                    self.view_dirty = self.local_view.is_some();
                    self.input.set_capabilities(CapabilitySet::Gameplay);
                }
                LifecycleEvent::SpawnControlObject => {
                    if self.authority.is_none() {
                        match Authority::new(self.lifecycle.role(), &self.config.scene_objects) {
                            Ok(authority) => {
                                self.authority = Some(authority.with_object_limit(self.config.max_objects));
                            }
                            Err(err) => error!("Control object not created: {}", err),
                        }
                    }
                }
                LifecycleEvent::StartFailed(failure) => {
                    if failure.role == NetworkRole::Client {
                        self.poller.notify_join_failed();
                    }
                    self.ui.show_message(&failure.to_string());
                }
                LifecycleEvent::ShutDown { role } => {
                    info!("Session role {} stopped", role);
                    self.authority = None;
                    self.replica.clear();
                    self.poller.detach();
                    self.idle_menu = MenuState::MainMenu;
                    self.input.set_capabilities(CapabilitySet::Gameplay);
                }
            }
        }
    }

    fn handle_poll_signal(&mut self, signal: PollSignal) {
        match signal {
            PollSignal::SnapshotUpdated(session) => self.ui.show_session(&session),
            PollSignal::JoinGame { join_code } => {
                if let Err(err) = self.lifecycle.start(NetworkRole::Client, Some(join_code), None) {
                    debug!("Client join deferred: {}", err);
                    self.poller.notify_join_failed();
                }
            }
            PollSignal::SessionLost { session_id, reason } => {
                warn!("Lost session {}: {:?}", session_id, reason);
                if let Some(event) = self.lifecycle.abandon() {
                    self.handle_lifecycle_events(vec![event]);
                }
                self.idle_menu = MenuState::ServerBrowser;
                self.ui.set_menu_state(MenuState::ServerBrowser);
                self.refresh_servers();
            }
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::FromClient { client_id, message } => {
                if let Some(authority) = self.authority.as_mut() {
                    authority.handle_client_message(client_id, message);
                }
            }
            Envelope::ClientConnected(client_id) => {
                info!("{} connected", client_id);
                if let Some(authority) = self.authority.as_mut() {
                    authority.client_connected(client_id);
                }
            }
            Envelope::ClientDisconnected(client_id) => {
                info!("{} disconnected", client_id);
                if let Some(authority) = self.authority.as_mut() {
                    authority.client_disconnected(client_id);
                }
            }
            Envelope::FromServer(message) => self.handle_server_message(message),
        }
    }

    fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::HolderChanged(change) => {
                self.replica.apply_holder_changed(&change);
            }
            ServerMessage::OwnershipRejected { object_id, reason } => {
                debug!("Request for {} rejected: {}", object_id, reason);
            }
            ServerMessage::ObjectSpawned { object_id, position } => {
                self.replica.apply_spawned(object_id, position);
            }
            ServerMessage::ObjectTransforms { tick, transforms } => {
                self.replica.apply_transforms(tick, &transforms);
            }
            ServerMessage::Shutdown { reason } => {
                info!("Authority shut down: {}", reason);
                self.ui.show_message("The host ended the game");
                let target = self.leave_target();
                if let Err(err) = self.lifecycle.disconnect(target) {
                    debug!("Disconnect ignored: {}", err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vec3::Vec3;
    use crate::game::input::InputKind;
    use crate::network::directory::{
        DirectoryCall, DirectoryError, InMemoryDirectory, PlayerRecord, RELAY_JOIN_CODE_KEY,
    };
    use crate::network::relay::LoopbackRelay;
    use crate::network::transport::LoopbackHub;
    use crate::ui::testing::RecordingSink;
    use std::sync::Mutex;

    const DT: f32 = 1.0 / 60.0;
    const O: ObjectId = ObjectId(1);

    struct World {
        directory: InMemoryDirectory,
        relay: LoopbackRelay,
        hub: LoopbackHub,
    }

    impl World {
        fn new() -> Self {
            Self {
                directory: InMemoryDirectory::new(),
                relay: LoopbackRelay::new(),
                hub: LoopbackHub::new(),
            }
        }

        fn client(&self, name: &str) -> (GameClient, Arc<RecordingSink>) {
            let ui = Arc::new(RecordingSink::default());
            let mut config = ClientConfig::default();
            config.player_name = name.to_string();
            config.prefs_path = std::env::temp_dir().join(format!("prefs-{}.json", uuid::Uuid::new_v4()));
            let record = PlayerRecord::new(PlayerIdentity::new(name), name);
            let client = GameClient::new(
                config,
                Arc::new(self.directory.client(record)),
                Arc::new(self.relay.clone()),
                Box::new(self.hub.transport()),
                ui.clone(),
                Preferences::default(),
            );
            (client, ui)
        }
    }

    /// Let spawned I/O finish and run a few tick boundaries.
    async fn settle(clients: &mut [&mut GameClient]) {
        for _ in 0..16 {
            tokio::task::yield_now().await;
            for client in clients.iter_mut() {
                client.simulate(DT);
            }
        }
    }

    async fn poll(clients: &mut [&mut GameClient]) {
        for client in clients.iter_mut() {
            client.reconcile(Instant::now());
        }
        settle(clients).await;
    }

    /// Host creates a lobby and the guest joins it by code.
    async fn lobby(world: &World) -> (GameClient, GameClient, Arc<RecordingSink>, Arc<RecordingSink>) {
        let (mut host, host_ui) = world.client("host");
        let (mut guest, guest_ui) = world.client("guest");

        host.handle_command(UiCommand::CreateSession { name: "Lobby".into() });
        settle(&mut [&mut host]).await;
        let code = host.session().unwrap().join_code.clone();

        guest.handle_command(UiCommand::JoinByCode(code));
        settle(&mut [&mut guest]).await;
        (host, guest, host_ui, guest_ui)
    }

    /// Lobby, then the host starts the game and the guest follows.
    async fn in_game(world: &World) -> (GameClient, GameClient, Arc<RecordingSink>, Arc<RecordingSink>) {
        let (mut host, mut guest, host_ui, guest_ui) = lobby(world).await;
        host.handle_command(UiCommand::StartGame);
        settle(&mut [&mut host, &mut guest]).await;
        poll(&mut [&mut host, &mut guest]).await;
        (host, guest, host_ui, guest_ui)
    }

    #[tokio::test]
    async fn test_create_and_join_route_to_lobby() {
        let world = World::new();
        let (host, guest, host_ui, guest_ui) = lobby(&world).await;

        assert_eq!(host_ui.last_menu(), Some(MenuState::Lobby));
        assert_eq!(guest_ui.last_menu(), Some(MenuState::Lobby));
        let session = world.directory.snapshot(&host.session().unwrap().id).await.unwrap();
        assert_eq!(session.player_count(), 2);
        assert_eq!(session.relay_join_code(), None);
        assert!(!session.game_started());
        assert_eq!(guest.lifecycle().state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_failed_join_shows_message() {
        let world = World::new();
        let (mut guest, ui) = world.client("guest");
        guest.handle_command(UiCommand::JoinByCode("NOPE00".into()));
        settle(&mut [&mut guest]).await;

        assert!(guest.session().is_none());
        assert_eq!(ui.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_start_game_brings_everyone_in() {
        let world = World::new();
        let (host, mut guest, host_ui, guest_ui) = in_game(&world).await;

        assert_eq!(host.lifecycle().state(), LifecycleState::Active(NetworkRole::Host));
        assert_eq!(guest.lifecycle().state(), LifecycleState::Active(NetworkRole::Client));
        assert!(host.authority().is_some());
        assert!(guest.authority().is_none());
        assert_eq!(guest.local_client_id(), Some(ClientId(1)));
        assert_eq!(host_ui.last_menu(), Some(MenuState::InGame));
        assert_eq!(guest_ui.last_menu(), Some(MenuState::InGame));

        let session = world.directory.snapshot(&host.session().unwrap().id).await.unwrap();
        assert!(session.game_started());
        assert!(session.relay_join_code().is_some());
        assert_eq!(world.relay.join_attempts().await, 1);
    }

    #[tokio::test]
    async fn test_guest_cannot_start_game() {
        let world = World::new();
        let (_host, mut guest, _, _) = lobby(&world).await;
        guest.handle_command(UiCommand::StartGame);
        settle(&mut [&mut guest]).await;

        assert_eq!(world.directory.call_count(DirectoryCall::UpdateMetadata).await, 0);
        assert_eq!(guest.lifecycle().state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_relay_code_triggers_single_join_across_polls() {
        let world = World::new();
        let (host, mut guest, _, _) = lobby(&world).await;
        let session_id = host.session().unwrap().id.clone();

        // Empty code: nothing happens.
        poll(&mut [&mut guest]).await;
        assert_eq!(guest.lifecycle().state(), LifecycleState::Idle);

        // Host goes live without flagging game_started.
        let (params, code) = world.relay.create_allocation(3, "local".into()).await.unwrap();
        let mut listener = world.hub.transport();
        assert!(listener.start(NetworkRole::Host, params));
        world.directory.force_metadata(&session_id, RELAY_JOIN_CODE_KEY, &code).await.unwrap();

        for _ in 0..5 {
            guest.reconcile(Instant::now());
        }
        settle(&mut [&mut guest]).await;
        for _ in 0..5 {
            poll(&mut [&mut guest]).await;
        }

        assert_eq!(world.relay.join_attempts().await, 1);
        assert_eq!(guest.lifecycle().state(), LifecycleState::Active(NetworkRole::Client));
        assert_eq!(host.lifecycle().state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_ownership_round_trip() {
        let world = World::new();
        let (mut host, mut guest, _, _) = in_game(&world).await;
        let guest_id = guest.local_client_id().unwrap();

        // Guest picks up.
        guest.handle_command(UiCommand::Look { position: Vec3::ZERO, pitch: 0.0, yaw: 0.0 });
        guest.handle_command(UiCommand::Interact { target: Some(O) });
        settle(&mut [&mut host, &mut guest]).await;
        assert_eq!(host.authority().unwrap().arbiter().holder(O), Some(guest_id));
        assert_eq!(guest.replica().holder(O), Some(guest_id));

        // Host tries the same object and is refused.
        host.handle_command(UiCommand::Interact { target: Some(O) });
        settle(&mut [&mut host, &mut guest]).await;
        assert_eq!(host.authority().unwrap().arbiter().holder(O), Some(guest_id));

        // Held object follows the guest's view.
        let object = host.authority().unwrap().arbiter().registry().get(O).unwrap();
        assert!(object.position.distance(Vec3::new(0.0, 4.0, 0.0)) > 0.01);

        // Guest drops, host retries.
        guest.handle_command(UiCommand::Interact { target: None });
        settle(&mut [&mut host, &mut guest]).await;
        assert_eq!(host.authority().unwrap().arbiter().holder(O), None);

        host.handle_command(UiCommand::Interact { target: Some(O) });
        settle(&mut [&mut host, &mut guest]).await;
        assert_eq!(host.authority().unwrap().arbiter().holder(O), Some(ClientId::SERVER));
        assert_eq!(guest.replica().holder(O), Some(ClientId::SERVER));
    }

    #[tokio::test]
    async fn test_scroll_adjusts_hold_distance() {
        let world = World::new();
        let (mut host, mut guest, _, _) = in_game(&world).await;

        guest.handle_command(UiCommand::Interact { target: Some(O) });
        settle(&mut [&mut host, &mut guest]).await;
        guest.handle_command(UiCommand::Scroll(100.0));
        settle(&mut [&mut host, &mut guest]).await;

        let object = host.authority().unwrap().arbiter().registry().get(O).unwrap();
        assert_eq!(object.hold_distance, crate::HOLD_DISTANCE_MAX);
    }

    #[tokio::test]
    async fn test_spawn_test_object_replicates() {
        let world = World::new();
        let (mut host, mut guest, _, _) = in_game(&world).await;

        guest.handle_command(UiCommand::SpawnTestObject { position: Vec3::UP });
        settle(&mut [&mut host, &mut guest]).await;

        assert_eq!(host.authority().unwrap().arbiter().registry().len(), 2);
        assert_eq!(guest.replica().get(ObjectId(2)).unwrap().position, Vec3::UP);
    }

    #[tokio::test]
    async fn test_guest_leave_releases_held_object() {
        let world = World::new();
        let (mut host, mut guest, _, guest_ui) = in_game(&world).await;
        let session_id = host.session().unwrap().id.clone();

        guest.handle_command(UiCommand::Interact { target: Some(O) });
        settle(&mut [&mut host, &mut guest]).await;
        assert!(host.authority().unwrap().arbiter().holder(O).is_some());

        guest.handle_command(UiCommand::Leave);
        settle(&mut [&mut host, &mut guest]).await;

        assert_eq!(guest.lifecycle().state(), LifecycleState::Idle);
        assert!(guest.session().is_none());
        assert_eq!(guest_ui.last_menu(), Some(MenuState::MainMenu));
        assert_eq!(host.authority().unwrap().arbiter().holder(O), None);
        let session = world.directory.snapshot(&session_id).await.unwrap();
        assert_eq!(session.player_count(), 1);
    }

    #[tokio::test]
    async fn test_host_leave_ends_game_for_guest() {
        let world = World::new();
        let (mut host, mut guest, _, _) = in_game(&world).await;
        let session_id = host.session().unwrap().id.clone();

        host.handle_command(UiCommand::Leave);
        settle(&mut [&mut host, &mut guest]).await;
        assert_eq!(host.lifecycle().state(), LifecycleState::Idle);
        assert!(world.directory.snapshot(&session_id).await.is_none());

        // The guest heard the authority go away and left on its own.
        assert_eq!(guest.lifecycle().state(), LifecycleState::Idle);
        assert!(guest.session().is_none());
        assert_eq!(world.hub.listening_rooms(), 0);

        poll(&mut [&mut guest]).await;
        assert_eq!(guest.lifecycle().state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_kicked_guest_returns_to_browser() {
        let world = World::new();
        let (mut host, mut guest, _, guest_ui) = lobby(&world).await;

        // Guarded locally: no directory call.
        guest.handle_command(UiCommand::Kick(PlayerIdentity::new("host")));
        host.handle_command(UiCommand::Kick(PlayerIdentity::new("host")));
        settle(&mut [&mut host, &mut guest]).await;
        assert_eq!(world.directory.call_count(DirectoryCall::Kick).await, 0);

        host.handle_command(UiCommand::Kick(PlayerIdentity::new("guest")));
        settle(&mut [&mut host]).await;
        poll(&mut [&mut guest]).await;

        assert!(guest.session().is_none());
        assert_eq!(guest_ui.last_menu(), Some(MenuState::ServerBrowser));
        let calls = world.directory.calls_for(&host.session().unwrap().id).await;
        poll(&mut [&mut guest]).await;
        assert_eq!(world.directory.calls_for(&host.session().unwrap().id).await, calls);
    }

    #[tokio::test]
    async fn test_leave_lobby_returns_to_multiplayer_menu() {
        let world = World::new();
        let (mut host, mut guest, host_ui, guest_ui) = lobby(&world).await;
        let session_id = host.session().unwrap().id.clone();

        guest.handle_command(UiCommand::Leave);
        settle(&mut [&mut guest]).await;
        assert_eq!(guest_ui.last_menu(), Some(MenuState::MultiplayerMenu));
        assert_eq!(world.directory.snapshot(&session_id).await.unwrap().player_count(), 1);

        host.handle_command(UiCommand::Leave);
        settle(&mut [&mut host]).await;
        assert_eq!(host_ui.last_menu(), Some(MenuState::MultiplayerMenu));
        assert!(world.directory.snapshot(&session_id).await.is_none());
    }

    #[tokio::test]
    async fn test_leave_lobby_discards_pending_join() {
        let world = World::new();
        let (host, mut guest, _, guest_ui) = lobby(&world).await;
        let session_id = host.session().unwrap().id.clone();

        let (params, code) = world.relay.create_allocation(3, "local".into()).await.unwrap();
        let mut listener = world.hub.transport();
        assert!(listener.start(NetworkRole::Host, params));
        world.directory.force_metadata(&session_id, RELAY_JOIN_CODE_KEY, &code).await.unwrap();

        // The snapshot carrying the code lands while the leave is in flight.
        guest.reconcile(Instant::now());
        tokio::task::yield_now().await;
        guest.handle_command(UiCommand::Leave);
        guest.simulate(DT);
        settle(&mut [&mut guest]).await;

        assert_eq!(guest.lifecycle().state(), LifecycleState::Idle);
        assert!(guest.session().is_none());
        assert_eq!(world.relay.join_attempts().await, 0);
        assert_eq!(guest_ui.last_menu(), Some(MenuState::MultiplayerMenu));
        assert_eq!(world.directory.snapshot(&session_id).await.unwrap().player_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_lobby_leave_keeps_session() {
        let world = World::new();
        let (host, mut guest, _, guest_ui) = lobby(&world).await;
        let session_id = host.session().unwrap().id.clone();

        world.directory.fail_next(DirectoryError::Transient("timeout".into())).await;
        guest.handle_command(UiCommand::Leave);
        settle(&mut [&mut guest]).await;

        assert_eq!(guest.session().map(|s| s.id.clone()), Some(session_id.clone()));
        assert_eq!(guest_ui.messages().len(), 1);
        assert_eq!(world.directory.snapshot(&session_id).await.unwrap().player_count(), 2);

        // Still reconciling.
        let calls = world.directory.calls_for(&session_id).await;
        poll(&mut [&mut guest]).await;
        assert!(world.directory.calls_for(&session_id).await > calls);
    }

    #[tokio::test]
    async fn test_shutdown_during_leave_stops_transport() {
        let world = World::new();
        let (mut host, _guest, _, _) = in_game(&world).await;
        let session_id = host.session().unwrap().id.clone();
        assert_eq!(world.hub.listening_rooms(), 1);

        host.handle_command(UiCommand::Leave);
        assert_eq!(host.lifecycle().state(), LifecycleState::ShuttingDown);
        host.shutdown().await.unwrap();

        assert_eq!(host.lifecycle().state(), LifecycleState::Idle);
        assert_eq!(world.hub.listening_rooms(), 0);
        assert!(host.session().is_none());
        assert!(world.directory.snapshot(&session_id).await.is_none());
        assert_eq!(world.directory.call_count(DirectoryCall::Leave).await, 1);
        let _ = std::fs::remove_file(&host.config.prefs_path);
    }

    #[tokio::test]
    async fn test_pause_swaps_input_capabilities() {
        let world = World::new();
        let (mut host, _guest, host_ui, _) = in_game(&world).await;

        let jumps = Arc::new(Mutex::new(0));
        let counter = jumps.clone();
        host.input_mut().subscribe(InputKind::Jump, move |_| *counter.lock().unwrap() += 1);

        host.handle_command(UiCommand::Pause(true));
        assert_eq!(host_ui.last_menu(), Some(MenuState::Paused));
        assert_eq!(host.menu_state(), MenuState::Paused);
        assert_eq!(host.handle_input(InputEvent::Jump), 0);

        host.handle_command(UiCommand::Pause(false));
        assert_eq!(host.handle_input(InputEvent::Jump), 1);
        assert_eq!(*jumps.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pause_ignored_outside_game() {
        let world = World::new();
        let (mut client, ui) = world.client("solo");
        client.handle_command(UiCommand::Pause(true));
        assert!(!client.lifecycle().is_paused());
        assert!(ui.events().is_empty());
    }

    #[tokio::test]
    async fn test_browser_lists_sessions() {
        let world = World::new();
        let (_host, _guest, _, _) = lobby(&world).await;
        let (mut browser, ui) = world.client("browser");

        browser.handle_command(UiCommand::OpenServerBrowser);
        settle(&mut [&mut browser]).await;
        assert!(ui.events().contains(&crate::ui::testing::UiEvent::ServerList(1)));
        assert_eq!(ui.last_menu(), Some(MenuState::ServerBrowser));
    }

    #[tokio::test]
    async fn test_shutdown_saves_preferences_and_leaves() {
        let world = World::new();
        let (mut host, mut guest, _, _) = in_game(&world).await;
        let session_id = host.session().unwrap().id.clone();

        guest.handle_command(UiCommand::SetSensitivity(2.5));
        guest.shutdown().await.unwrap();

        let saved = Preferences::load(&guest.config.prefs_path).unwrap();
        assert_eq!(saved.sensitivity(), 2.5);
        assert_eq!(guest.lifecycle().state(), LifecycleState::Idle);
        assert_eq!(world.directory.snapshot(&session_id).await.unwrap().player_count(), 1);

        settle(&mut [&mut host]).await;
        let _ = std::fs::remove_file(&guest.config.prefs_path);
    }

    #[tokio::test]
    async fn test_run_exits_on_quit() {
        let world = World::new();
        let (mut client, _) = world.client("runner");
        let (tx, rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tx.send(UiCommand::SetSensitivity(0.5)).await.unwrap();
        tx.send(UiCommand::Quit).await.unwrap();
        client.run(rx, shutdown_rx).await.unwrap();

        assert!(client.quit_requested());
        let saved = Preferences::load(&client.config.prefs_path).unwrap();
        assert_eq!(saved.sensitivity(), 0.5);
        let _ = std::fs::remove_file(&client.config.prefs_path);
    }
}
