//! Session Directory
//!
//! Thin client to the external matchmaking directory, plus an in-process
//! implementation used by the demo binary and tests.
//!
//! Every directory handle is bound to the calling player's record. The
//! directory never retries: transient errors go straight back to the caller,
//! which decides whether the active flow survives them.

use std::collections::BTreeMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rand::Rng;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::ids::{PlayerIdentity, SessionId};

/// Metadata key holding the relay join code published by the host.
pub const RELAY_JOIN_CODE_KEY: &str = "relay_join_code";

/// Metadata key flagging that the host started the game (`"true"`/`"false"`).
pub const GAME_STARTED_KEY: &str = "game_started";

/// Length of generated session join codes.
pub const JOIN_CODE_LEN: usize = 6;

const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Directory errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// Network or service hiccup; the same call may succeed later.
    #[error("transient directory error: {0}")]
    Transient(String),

    /// Session (or player within it) does not exist.
    #[error("session not found")]
    NotFound,

    /// Caller is not allowed to perform the operation.
    #[error("operation forbidden")]
    Forbidden,
}

/// Result alias for directory calls.
pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// A player entry in a session roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    /// Directory identity.
    pub identity: PlayerIdentity,
    /// Name shown in lobby listings.
    pub display_name: String,
}

impl PlayerRecord {
    /// Create a record.
    pub fn new(identity: PlayerIdentity, display_name: impl Into<String>) -> Self {
        Self { identity, display_name: display_name.into() }
    }

    /// Whether this record is the local player.
    pub fn is_self(&self, local: &PlayerIdentity) -> bool {
        &self.identity == local
    }
}

/// Snapshot of a directory-tracked session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Directory id.
    pub id: SessionId,
    /// Display name.
    pub name: String,
    /// Short code others use to join.
    pub join_code: String,
    /// Identity of the hosting player.
    pub host_identity: PlayerIdentity,
    /// Maximum roster size.
    pub capacity: u32,
    /// Ordered roster.
    pub players: Vec<PlayerRecord>,
    /// Public key/value data.
    pub metadata: BTreeMap<String, String>,
    /// Bumped by the directory on every mutation.
    pub version: u64,
    /// Time of the last mutation.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Relay join code, if the host has published a non-empty one.
    pub fn relay_join_code(&self) -> Option<&str> {
        self.metadata
            .get(RELAY_JOIN_CODE_KEY)
            .map(String::as_str)
            .filter(|code| !code.is_empty())
    }

    /// Whether the host has flagged the game as started.
    pub fn game_started(&self) -> bool {
        self.metadata.get(GAME_STARTED_KEY).map(String::as_str) == Some("true")
    }

    /// Whether `identity` hosts this session.
    pub fn is_host(&self, identity: &PlayerIdentity) -> bool {
        &self.host_identity == identity
    }

    /// Whether `identity` is in the roster.
    pub fn contains(&self, identity: &PlayerIdentity) -> bool {
        self.players.iter().any(|p| p.is_self(identity))
    }

    /// Roster size.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Whether the roster is at capacity.
    pub fn is_full(&self) -> bool {
        self.players.len() >= self.capacity as usize
    }
}

/// Metadata every new session is created with.
pub fn initial_metadata() -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert(RELAY_JOIN_CODE_KEY.to_string(), String::new());
    metadata.insert(GAME_STARTED_KEY.to_string(), "false".to_string());
    metadata
}

/// Client to the matchmaking directory, bound to the calling player.
pub trait SessionDirectory: Send + Sync {
    /// Identity this handle calls as.
    fn identity(&self) -> &PlayerIdentity;

    /// Create a session hosted by the caller.
    fn create(
        &self,
        name: String,
        capacity: u32,
        initial_metadata: BTreeMap<String, String>,
    ) -> BoxFuture<'_, DirectoryResult<Session>>;

    /// Join by short join code.
    fn join_by_code(&self, code: String) -> BoxFuture<'_, DirectoryResult<Session>>;

    /// Join by session id.
    fn join_by_id(&self, session_id: SessionId) -> BoxFuture<'_, DirectoryResult<Session>>;

    /// Leave a session. `as_owner` deletes it (host only).
    fn leave(&self, session_id: SessionId, as_owner: bool) -> BoxFuture<'_, DirectoryResult<()>>;

    /// Remove another player (host only).
    fn kick(&self, session_id: SessionId, player: PlayerIdentity) -> BoxFuture<'_, DirectoryResult<()>>;

    /// List joinable sessions.
    fn list(&self) -> BoxFuture<'_, DirectoryResult<Vec<Session>>>;

    /// Merge `patch` into session metadata (host only).
    fn update_metadata(
        &self,
        session_id: SessionId,
        patch: BTreeMap<String, String>,
    ) -> BoxFuture<'_, DirectoryResult<Session>>;

    /// Keep the session alive (host only).
    fn heartbeat(&self, session_id: SessionId) -> BoxFuture<'_, DirectoryResult<()>>;

    /// Fetch the current snapshot.
    fn get(&self, session_id: SessionId) -> BoxFuture<'_, DirectoryResult<Session>>;
}

// =============================================================================
// IN-MEMORY DIRECTORY
// =============================================================================

/// Which directory operation a call was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DirectoryCall {
    /// `create`
    Create,
    /// `join_by_code` / `join_by_id`
    Join,
    /// `leave`
    Leave,
    /// `kick`
    Kick,
    /// `list`
    List,
    /// `update_metadata`
    UpdateMetadata,
    /// `heartbeat`
    Heartbeat,
    /// `get`
    Get,
}

#[derive(Default)]
struct DirectoryState {
    sessions: BTreeMap<SessionId, Session>,
    heartbeats: BTreeMap<SessionId, DateTime<Utc>>,
    calls: Vec<(DirectoryCall, Option<SessionId>)>,
    fail_next: Option<DirectoryError>,
}

impl DirectoryState {
    fn record(&mut self, call: DirectoryCall, session: Option<&SessionId>) -> DirectoryResult<()> {
        self.calls.push((call, session.cloned()));
        match self.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn session_mut(&mut self, id: &SessionId) -> DirectoryResult<&mut Session> {
        self.sessions.get_mut(id).ok_or(DirectoryError::NotFound)
    }

    fn unique_join_code(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let code: String = (0..JOIN_CODE_LEN)
                .map(|_| JOIN_CODE_ALPHABET[rng.gen_range(0..JOIN_CODE_ALPHABET.len())] as char)
                .collect();
            if !self.sessions.values().any(|s| s.join_code == code) {
                return code;
            }
        }
    }
}

fn touch(session: &mut Session) {
    session.version += 1;
    session.updated_at = Utc::now();
}

fn add_member(session: &mut Session, record: &PlayerRecord) -> DirectoryResult<()> {
    if session.contains(&record.identity) {
        return Ok(());
    }
    if session.is_full() {
        return Err(DirectoryError::Forbidden);
    }
    session.players.push(record.clone());
    touch(session);
    Ok(())
}

/// Shared in-process directory. Hand out one [`InMemoryDirectoryClient`]
/// per player with [`InMemoryDirectory::client`].
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that calls as `record`.
    pub fn client(&self, record: PlayerRecord) -> InMemoryDirectoryClient {
        InMemoryDirectoryClient {
            state: self.state.clone(),
            record,
        }
    }

    /// Make the next call (from any client) fail with `err`.
    pub async fn fail_next(&self, err: DirectoryError) {
        self.state.lock().await.fail_next = Some(err);
    }

    /// Patch metadata directly, bypassing permission checks.
    pub async fn force_metadata(&self, session_id: &SessionId, key: &str, value: &str) -> DirectoryResult<()> {
        let mut state = self.state.lock().await;
        let session = state.session_mut(session_id)?;
        session.metadata.insert(key.to_string(), value.to_string());
        touch(session);
        Ok(())
    }

    /// Current snapshot, bypassing call accounting.
    pub async fn snapshot(&self, session_id: &SessionId) -> Option<Session> {
        self.state.lock().await.sessions.get(session_id).cloned()
    }

    /// Number of calls made against `session_id`.
    pub async fn calls_for(&self, session_id: &SessionId) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|(_, s)| s.as_ref() == Some(session_id))
            .count()
    }

    /// Number of calls of `kind`, across all sessions.
    pub async fn call_count(&self, kind: DirectoryCall) -> usize {
        self.state.lock().await.calls.iter().filter(|(c, _)| *c == kind).count()
    }

    /// When the host last sent a heartbeat for `session_id`.
    pub async fn last_heartbeat(&self, session_id: &SessionId) -> Option<DateTime<Utc>> {
        self.state.lock().await.heartbeats.get(session_id).copied()
    }
}

/// Per-player handle onto an [`InMemoryDirectory`].
#[derive(Clone)]
pub struct InMemoryDirectoryClient {
    state: Arc<Mutex<DirectoryState>>,
    record: PlayerRecord,
}

impl SessionDirectory for InMemoryDirectoryClient {
    fn identity(&self) -> &PlayerIdentity {
        &self.record.identity
    }

    fn create(
        &self,
        name: String,
        capacity: u32,
        initial_metadata: BTreeMap<String, String>,
    ) -> BoxFuture<'_, DirectoryResult<Session>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record(DirectoryCall::Create, None)?;
            if capacity == 0 {
                return Err(DirectoryError::Forbidden);
            }

            let session = Session {
                id: SessionId::generate(),
                name,
                join_code: state.unique_join_code(),
                host_identity: self.record.identity.clone(),
                capacity,
                players: vec![self.record.clone()],
                metadata: initial_metadata,
                version: 1,
                updated_at: Utc::now(),
            };
            debug!("Directory created session {} ({})", session.id, session.join_code);
            state.sessions.insert(session.id.clone(), session.clone());
            Ok(session)
        })
    }

    fn join_by_code(&self, code: String) -> BoxFuture<'_, DirectoryResult<Session>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let id = state
                .sessions
                .values()
                .find(|s| s.join_code.eq_ignore_ascii_case(code.trim()))
                .map(|s| s.id.clone());
            state.record(DirectoryCall::Join, id.as_ref())?;

            let id = id.ok_or(DirectoryError::NotFound)?;
            let session = state.session_mut(&id)?;
            add_member(session, &self.record)?;
            Ok(session.clone())
        })
    }

    fn join_by_id(&self, session_id: SessionId) -> BoxFuture<'_, DirectoryResult<Session>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record(DirectoryCall::Join, Some(&session_id))?;
            let session = state.session_mut(&session_id)?;
            add_member(session, &self.record)?;
            Ok(session.clone())
        })
    }

    fn leave(&self, session_id: SessionId, as_owner: bool) -> BoxFuture<'_, DirectoryResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record(DirectoryCall::Leave, Some(&session_id))?;

            let me = &self.record.identity;
            let session = state.session_mut(&session_id)?;
            if as_owner {
                if !session.is_host(me) {
                    return Err(DirectoryError::Forbidden);
                }
                state.sessions.remove(&session_id);
                state.heartbeats.remove(&session_id);
                return Ok(());
            }

            if !session.contains(me) {
                return Err(DirectoryError::NotFound);
            }
            session.players.retain(|p| !p.is_self(me));
            touch(session);
            if session.players.is_empty() {
                state.sessions.remove(&session_id);
                state.heartbeats.remove(&session_id);
            }
            Ok(())
        })
    }

    fn kick(&self, session_id: SessionId, player: PlayerIdentity) -> BoxFuture<'_, DirectoryResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record(DirectoryCall::Kick, Some(&session_id))?;

            let me = &self.record.identity;
            let session = state.session_mut(&session_id)?;
            if !session.is_host(me) || &player == me {
                return Err(DirectoryError::Forbidden);
            }
            if !session.contains(&player) {
                return Err(DirectoryError::NotFound);
            }
            session.players.retain(|p| p.identity != player);
            touch(session);
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, DirectoryResult<Vec<Session>>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record(DirectoryCall::List, None)?;
            Ok(state.sessions.values().filter(|s| !s.is_full()).cloned().collect())
        })
    }

    fn update_metadata(
        &self,
        session_id: SessionId,
        patch: BTreeMap<String, String>,
    ) -> BoxFuture<'_, DirectoryResult<Session>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record(DirectoryCall::UpdateMetadata, Some(&session_id))?;

            let session = state.session_mut(&session_id)?;
            if !session.is_host(&self.record.identity) {
                return Err(DirectoryError::Forbidden);
            }
            session.metadata.extend(patch);
            touch(session);
            Ok(session.clone())
        })
    }

    fn heartbeat(&self, session_id: SessionId) -> BoxFuture<'_, DirectoryResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record(DirectoryCall::Heartbeat, Some(&session_id))?;

            let session = state.session_mut(&session_id)?;
            if !session.is_host(&self.record.identity) {
                return Err(DirectoryError::Forbidden);
            }
            state.heartbeats.insert(session_id, Utc::now());
            Ok(())
        })
    }

    fn get(&self, session_id: SessionId) -> BoxFuture<'_, DirectoryResult<Session>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.record(DirectoryCall::Get, Some(&session_id))?;
            state.sessions.get(&session_id).cloned().ok_or(DirectoryError::NotFound)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(name: &str) -> PlayerRecord {
        PlayerRecord::new(PlayerIdentity::new(name), name)
    }

    #[tokio::test]
    async fn test_create_and_join_by_code() {
        let directory = InMemoryDirectory::new();
        let host = directory.client(player("host"));
        let guest = directory.client(player("guest"));

        let session = host.create("Lobby".into(), 4, initial_metadata()).await.unwrap();
        assert_eq!(session.join_code.len(), JOIN_CODE_LEN);
        assert!(session.is_host(host.identity()));
        assert_eq!(session.relay_join_code(), None);
        assert!(!session.game_started());

        let joined = guest.join_by_code(session.join_code.to_lowercase()).await.unwrap();
        assert_eq!(joined.player_count(), 2);
        assert!(joined.contains(guest.identity()));
        assert!(joined.version > session.version);
    }

    #[tokio::test]
    async fn test_join_unknown_code() {
        let directory = InMemoryDirectory::new();
        let guest = directory.client(player("guest"));
        let result = guest.join_by_code("NOPE42".into()).await;
        assert_eq!(result, Err(DirectoryError::NotFound));
    }

    #[tokio::test]
    async fn test_session_full() {
        let directory = InMemoryDirectory::new();
        let host = directory.client(player("host"));
        let session = host.create("Tiny".into(), 1, initial_metadata()).await.unwrap();

        let guest = directory.client(player("guest"));
        let result = guest.join_by_id(session.id.clone()).await;
        assert_eq!(result, Err(DirectoryError::Forbidden));
    }

    #[tokio::test]
    async fn test_update_metadata_host_only() {
        let directory = InMemoryDirectory::new();
        let host = directory.client(player("host"));
        let guest = directory.client(player("guest"));
        let session = host.create("Lobby".into(), 4, initial_metadata()).await.unwrap();
        guest.join_by_id(session.id.clone()).await.unwrap();

        let mut patch = BTreeMap::new();
        patch.insert(RELAY_JOIN_CODE_KEY.to_string(), "ABC123".to_string());

        let denied = guest.update_metadata(session.id.clone(), patch.clone()).await;
        assert_eq!(denied, Err(DirectoryError::Forbidden));

        let updated = host.update_metadata(session.id.clone(), patch).await.unwrap();
        assert_eq!(updated.relay_join_code(), Some("ABC123"));
        assert!(!updated.game_started());
    }

    #[tokio::test]
    async fn test_kick_rules() {
        let directory = InMemoryDirectory::new();
        let host = directory.client(player("host"));
        let guest = directory.client(player("guest"));
        let session = host.create("Lobby".into(), 4, initial_metadata()).await.unwrap();
        guest.join_by_id(session.id.clone()).await.unwrap();

        assert_eq!(
            guest.kick(session.id.clone(), host.identity().clone()).await,
            Err(DirectoryError::Forbidden)
        );
        assert_eq!(
            host.kick(session.id.clone(), host.identity().clone()).await,
            Err(DirectoryError::Forbidden)
        );

        host.kick(session.id.clone(), guest.identity().clone()).await.unwrap();
        let after = guest.get(session.id.clone()).await.unwrap();
        assert!(!after.contains(guest.identity()));
    }

    #[tokio::test]
    async fn test_leave_variants() {
        let directory = InMemoryDirectory::new();
        let host = directory.client(player("host"));
        let guest = directory.client(player("guest"));
        let session = host.create("Lobby".into(), 4, initial_metadata()).await.unwrap();
        guest.join_by_id(session.id.clone()).await.unwrap();

        // Non-host cannot delete
        assert_eq!(guest.leave(session.id.clone(), true).await, Err(DirectoryError::Forbidden));

        guest.leave(session.id.clone(), false).await.unwrap();
        assert_eq!(directory.snapshot(&session.id).await.unwrap().player_count(), 1);

        host.leave(session.id.clone(), true).await.unwrap();
        assert!(directory.snapshot(&session.id).await.is_none());
        assert_eq!(host.get(session.id.clone()).await, Err(DirectoryError::NotFound));
    }

    #[tokio::test]
    async fn test_last_member_leaving_deletes() {
        let directory = InMemoryDirectory::new();
        let host = directory.client(player("host"));
        let session = host.create("Solo".into(), 4, initial_metadata()).await.unwrap();

        host.leave(session.id.clone(), false).await.unwrap();
        assert!(directory.snapshot(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_host_only() {
        let directory = InMemoryDirectory::new();
        let host = directory.client(player("host"));
        let guest = directory.client(player("guest"));
        let session = host.create("Lobby".into(), 4, initial_metadata()).await.unwrap();
        guest.join_by_id(session.id.clone()).await.unwrap();

        assert_eq!(guest.heartbeat(session.id.clone()).await, Err(DirectoryError::Forbidden));
        host.heartbeat(session.id.clone()).await.unwrap();
        assert!(directory.last_heartbeat(&session.id).await.is_some());
    }

    #[tokio::test]
    async fn test_fail_next_is_one_shot() {
        let directory = InMemoryDirectory::new();
        let host = directory.client(player("host"));
        let session = host.create("Lobby".into(), 4, initial_metadata()).await.unwrap();

        directory.fail_next(DirectoryError::Transient("timeout".into())).await;
        assert!(matches!(host.get(session.id.clone()).await, Err(DirectoryError::Transient(_))));
        assert!(host.get(session.id.clone()).await.is_ok());
        assert_eq!(directory.calls_for(&session.id).await, 2);
    }

    #[tokio::test]
    async fn test_list_hides_full_sessions() {
        let directory = InMemoryDirectory::new();
        let a = directory.client(player("a"));
        let b = directory.client(player("b"));
        a.create("Full".into(), 1, initial_metadata()).await.unwrap();
        b.create("Open".into(), 4, initial_metadata()).await.unwrap();

        let listed = a.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Open");
    }
}
