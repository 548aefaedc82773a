//! Session Arbiter Demo
//!
//! Runs a host and a guest client in one process against the in-memory
//! directory, loopback relay and loopback transport, and walks them through
//! lobby, game start and a contested pickup.

use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

use session_arbiter::{
    core::prefs::PrefsError,
    network::{directory::PlayerRecord, InMemoryDirectory, LoopbackHub, LoopbackRelay, SessionDirectory},
    ClientConfig, GameClient, ObjectId, PlayerIdentity, Preferences, TracingSink, UiCommand, Vec3,
    TICK_RATE, VERSION,
};

struct Shared {
    directory: InMemoryDirectory,
    relay: LoopbackRelay,
    hub: LoopbackHub,
}

fn spawn_client(
    name: &str,
    mut config: ClientConfig,
    shared: &Shared,
    shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<(mpsc::Sender<UiCommand>, JoinHandle<Result<(), PrefsError>>)> {
    let file = config
        .prefs_path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "preferences.json".to_string());
    config.prefs_path = config.prefs_path.with_file_name(format!("{}-{}", name, file));
    config.player_name = name.to_string();

    let prefs = Preferences::load(&config.prefs_path)?;
    let record = PlayerRecord::new(PlayerIdentity::new(name), name);
    let mut client = GameClient::new(
        config,
        Arc::new(shared.directory.client(record)),
        Arc::new(shared.relay.clone()),
        Box::new(shared.hub.transport()),
        Arc::new(TracingSink),
        prefs,
    );

    let (tx, rx) = mpsc::channel(32);
    let handle = tokio::spawn(async move { client.run(rx, shutdown).await });
    Ok((tx, handle))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ClientConfig::from_env()?;
    info!("Session Arbiter v{}", VERSION);
    info!("Tick Rate: {} Hz (default {})", config.tick_rate, TICK_RATE);

    let shared = Shared {
        directory: InMemoryDirectory::new(),
        relay: LoopbackRelay::new(),
        hub: LoopbackHub::new(),
    };
    let observer = shared
        .directory
        .client(PlayerRecord::new(PlayerIdentity::new("observer"), "observer"));
    let (shutdown_tx, _) = broadcast::channel(1);

    let (host, host_handle) = spawn_client("host", config.clone(), &shared, shutdown_tx.subscribe())?;
    let (guest, guest_handle) = spawn_client("guest", config.clone(), &shared, shutdown_tx.subscribe())?;
    let settle = config.poll_interval * 2;

    info!("=== Lobby ===");
    host.send(UiCommand::OpenMultiplayer).await?;
    host.send(UiCommand::CreateSession { name: "Demo Lobby".into() }).await?;
    sleep(Duration::from_millis(200)).await;

    let lobby = observer
        .list()
        .await?
        .into_iter()
        .next()
        .context("host did not create a lobby")?;
    guest.send(UiCommand::JoinByCode(lobby.join_code.clone())).await?;
    sleep(Duration::from_millis(200)).await;

    info!("=== Game ===");
    host.send(UiCommand::StartGame).await?;
    sleep(settle).await;

    let view = UiCommand::Look { position: Vec3::ZERO, pitch: 10.0, yaw: 0.0 };
    guest.send(view).await?;
    guest.send(UiCommand::Interact { target: Some(ObjectId(1)) }).await?;
    sleep(Duration::from_millis(300)).await;

    // Contested: the host is refused while the guest holds it.
    host.send(UiCommand::Interact { target: Some(ObjectId(1)) }).await?;
    guest.send(UiCommand::Scroll(-2.0)).await?;
    sleep(Duration::from_millis(300)).await;

    guest.send(UiCommand::Interact { target: None }).await?;
    sleep(Duration::from_millis(100)).await;
    host.send(UiCommand::Interact { target: Some(ObjectId(1)) }).await?;
    sleep(Duration::from_millis(300)).await;

    info!("=== Teardown ===");
    guest.send(UiCommand::Leave).await?;
    sleep(Duration::from_millis(300)).await;
    host.send(UiCommand::Quit).await?;
    let _ = shutdown_tx.send(());

    host_handle.await??;
    guest_handle.await??;
    info!("Demo finished");
    Ok(())
}
