use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc};
use tracing::{debug, trace};
use uuid::Uuid;

use murmur_types::events::ServerEvent;

/// Outbound side of one live connection.
///
/// Cloning is cheap; every clone feeds the same writer task, which writes one
/// event per frame, so events from different producers never interleave.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// The connection behind a handle has gone away.
#[derive(Debug, thiserror::Error)]
#[error("connection {0} is closed")]
pub struct SendError(pub Uuid);

impl SessionHandle {
    /// Create a handle for a new connection together with the receiver its
    /// writer task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Queue an event for this connection. Fails once the writer is gone.
    pub fn send(&self, event: ServerEvent) -> Result<(), SendError> {
        self.tx.send(event).map_err(|_| SendError(self.conn_id))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Outcome of a fan-out. Failures are isolated per target.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Tracks which username is reachable on which live connection.
///
/// One lock guards the map: mutations and snapshots are atomic with respect
/// to each other, and no send ever happens while it is held.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the handle for `username` (last writer wins).
    /// Returns the previous handle, if any.
    pub async fn put(&self, username: &str, handle: SessionHandle) -> Option<SessionHandle> {
        self.sessions
            .write()
            .await
            .insert(username.to_string(), handle)
    }

    pub async fn get(&self, username: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(username).cloned()
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.sessions.read().await.contains_key(username)
    }

    pub async fn remove(&self, username: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(username)
    }

    /// Remove the entry for `username` only if it still belongs to `conn_id`.
    /// A connection displaced by a newer login must not evict its successor.
    pub async fn remove_if_current(&self, username: &str, conn_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(username) {
            Some(handle) if handle.conn_id == conn_id => {
                sessions.remove(username);
                true
            }
            _ => false,
        }
    }

    pub async fn snapshot(&self) -> Vec<(String, SessionHandle)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(name, handle)| (name.clone(), handle.clone()))
            .collect()
    }

    pub async fn online_usernames(&self) -> HashSet<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Send `event` to every live session except `origin`.
    pub async fn broadcast_except(&self, origin: &str, event: &ServerEvent) -> FanoutReport {
        let targets: Vec<(String, SessionHandle)> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|(name, _)| name != origin)
            .collect();

        let mut report = FanoutReport::default();
        for (name, handle) in targets {
            match handle.send(event.clone()) {
                Ok(()) => {
                    trace!("fan-out to {} queued", name);
                    report.delivered += 1;
                }
                Err(e) => {
                    debug!("fan-out to {} skipped: {}", name, e);
                    report.failed += 1;
                }
            }
        }
        report
    }
}

/// Per-username locks ordering presence transitions.
///
/// A login and a disconnect for the same user each hold the user's lock
/// across store write, registry change and broadcast, so neither can slip
/// between the other's steps. The registry lock is never taken while
/// waiting here.
#[derive(Clone, Default)]
pub struct PresenceLocks {
    locks: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl PresenceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, username: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(username.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
