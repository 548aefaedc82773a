//! Session Poller
//!
//! Reconciliation loop against the directory while a session is held.
//!
//! Each [`tick`](SessionPoller::tick) issues one `get` (and, for the host,
//! a heartbeat once per heartbeat window). Responses are applied by
//! [`pump`](SessionPoller::pump) in request order:
//!
//! 1. Refresh the snapshot; a directory error drops the session (`SessionLost`).
//! 2. Not host, not networked, self still listed, relay code published:
//!    ask for the client join, once.
//! 3. Self missing from the roster: drop the session (`SessionLost`).
//! 4. `game_started == "true"`: same join path as step 2.
//!
//! A response is stale when a newer request has already been applied or
//! its session version is older than the held snapshot; stale responses
//! are dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::ids::SessionId;
use crate::network::directory::{DirectoryError, DirectoryResult, Session, SessionDirectory};

/// Why the held session was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLostReason {
    /// Local player is no longer in the roster (kicked, or the host left).
    Removed,
    /// The directory refused or failed the refresh.
    Directory(DirectoryError),
}

/// Output of a reconciliation step.
#[derive(Debug, Clone, PartialEq)]
pub enum PollSignal {
    /// A newer snapshot was applied.
    SnapshotUpdated(Session),
    /// Start the lifecycle as a client with this relay code.
    JoinGame {
        /// Relay join code.
        join_code: String,
    },
    /// The session reference was dropped.
    SessionLost {
        /// Session that was held.
        session_id: SessionId,
        /// Why.
        reason: SessionLostReason,
    },
}

/// What the poller needs to know about the local network role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalRoleView {
    /// A network role is running or starting.
    pub in_network_role: bool,
    /// A start or shutdown is in flight.
    pub transitioning: bool,
}

#[derive(Debug)]
struct PollResult {
    seq: u64,
    session_id: SessionId,
    result: DirectoryResult<Session>,
}

/// Periodic directory reconciliation for the held session.
pub struct SessionPoller {
    directory: Arc<dyn SessionDirectory>,
    heartbeat_interval: Duration,
    session: Option<Session>,
    last_heartbeat: Option<Instant>,
    request_seq: u64,
    applied_seq: u64,
    join_requested: bool,
    results_tx: mpsc::UnboundedSender<PollResult>,
    results_rx: mpsc::UnboundedReceiver<PollResult>,
}

impl SessionPoller {
    /// Poller with nothing attached.
    pub fn new(directory: Arc<dyn SessionDirectory>, heartbeat_interval: Duration) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            directory,
            heartbeat_interval,
            session: None,
            last_heartbeat: None,
            request_seq: 0,
            applied_seq: 0,
            join_requested: false,
            results_tx,
            results_rx,
        }
    }

    /// Start reconciling `session`. Responses for anything held before are
    /// discarded.
    pub fn attach(&mut self, session: Session) {
        info!("Polling session {} ({})", session.name, session.id);
        self.session = Some(session);
        self.last_heartbeat = None;
        self.applied_seq = self.request_seq;
        self.join_requested = false;
    }

    /// Stop reconciling.
    pub fn detach(&mut self) -> Option<Session> {
        self.applied_seq = self.request_seq;
        self.join_requested = false;
        self.session.take()
    }

    /// Held snapshot.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Whether the local player hosts the held session.
    pub fn is_host(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.is_host(self.directory.identity()))
    }

    /// Whether a client join was requested and not yet reported failed.
    pub fn join_requested(&self) -> bool {
        self.join_requested
    }

    /// Let the next snapshot request the client join again.
    pub fn notify_join_failed(&mut self) {
        self.join_requested = false;
    }

    /// Issue this tick's directory calls. No-op without a session.
    pub fn tick(&mut self, now: Instant) {
        let Some(session) = &self.session else {
            return;
        };
        let session_id = session.id.clone();

        if self.is_host() {
            let due = self
                .last_heartbeat
                .map_or(true, |last| now.duration_since(last) >= self.heartbeat_interval);
            if due {
                self.last_heartbeat = Some(now);
                let directory = self.directory.clone();
                let id = session_id.clone();
                tokio::spawn(async move {
                    if let Err(err) = directory.heartbeat(id.clone()).await {
                        warn!("Heartbeat for {} failed: {}", id, err);
                    }
                });
            }
        }

        self.request_seq += 1;
        let seq = self.request_seq;
        let directory = self.directory.clone();
        let tx = self.results_tx.clone();
        tokio::spawn(async move {
            let result = directory.get(session_id.clone()).await;
            let _ = tx.send(PollResult { seq, session_id, result });
        });
    }

    /// Apply every response that has arrived.
    pub fn pump(&mut self, local: LocalRoleView) -> Vec<PollSignal> {
        let mut signals = Vec::new();
        while let Ok(result) = self.results_rx.try_recv() {
            signals.extend(self.apply(result, local));
        }
        signals
    }

    /// Wait for the next response and apply it.
    pub async fn next_signals(&mut self, local: LocalRoleView) -> Vec<PollSignal> {
        match self.results_rx.recv().await {
            Some(result) => self.apply(result, local),
            None => Vec::new(),
        }
    }

    fn apply(&mut self, poll: PollResult, local: LocalRoleView) -> Vec<PollSignal> {
        let Some(current) = &self.session else {
            return Vec::new();
        };
        if poll.session_id != current.id || poll.seq <= self.applied_seq {
            debug!("Discarding stale poll response #{}", poll.seq);
            return Vec::new();
        }
        self.applied_seq = poll.seq;

        // 1. Refresh
        let snapshot = match poll.result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("Poll of {} failed: {}", poll.session_id, err);
                self.session = None;
                return vec![PollSignal::SessionLost {
                    session_id: poll.session_id,
                    reason: SessionLostReason::Directory(err),
                }];
            }
        };
        if snapshot.version < current.version {
            debug!("Discarding snapshot v{} older than v{}", snapshot.version, current.version);
            return Vec::new();
        }

        let me = self.directory.identity();
        let present = snapshot.contains(me);
        let is_host = snapshot.is_host(me);
        let mut signals = vec![PollSignal::SnapshotUpdated(snapshot.clone())];

        // 2. Relay code published
        let can_join = !is_host
            && present
            && !local.in_network_role
            && !local.transitioning
            && !self.join_requested;
        if can_join {
            if let Some(code) = snapshot.relay_join_code() {
                info!("Relay code {} published, joining", code);
                self.join_requested = true;
                signals.push(PollSignal::JoinGame { join_code: code.to_string() });
            }
        }

        // 3. Removed from roster
        if !present {
            info!("No longer listed in {}", snapshot.id);
            self.session = None;
            signals.push(PollSignal::SessionLost {
                session_id: snapshot.id,
                reason: SessionLostReason::Removed,
            });
            return signals;
        }

        // 4. Game started
        if snapshot.game_started() && can_join && !self.join_requested {
            match snapshot.relay_join_code() {
                Some(code) => {
                    self.join_requested = true;
                    signals.push(PollSignal::JoinGame { join_code: code.to_string() });
                }
                None => debug!("Game started, waiting for relay code"),
            }
        }

        self.session = Some(snapshot);
        signals
    }
}
