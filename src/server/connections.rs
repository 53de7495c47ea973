//! Connection state management

use crate::auth::KeyId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// WebSocket close codes used by the hub
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const UNSUPPORTED: u16 = 1003;
}

/// The connection's stream is gone or closing
#[derive(Debug, Clone, Copy, Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// Why a connection could not be registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterError {
    /// The key was revoked while the upgrade was in flight
    #[error("key {0} has been revoked")]
    Revoked(KeyId),

    /// The manager no longer accepts connections
    #[error("connection manager is closed")]
    Closed,
}

/// Why a connection is being closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame or the stream ended
    PeerClosed,
    /// Read or write failure on the stream
    Transport(String),
    /// The key that authorized the connection was revoked
    Revoked(String),
    /// A frame could not be parsed at all
    MalformedFrame,
    /// The hub is shutting down
    Shutdown,
}

impl CloseReason {
    /// Close frame to send before tearing the stream down, if any
    pub fn close_frame(&self) -> Option<(u16, String)> {
        match self {
            CloseReason::PeerClosed | CloseReason::Transport(_) => None,
            CloseReason::Revoked(reason) => Some((close_code::NORMAL, reason.clone())),
            CloseReason::MalformedFrame => {
                Some((close_code::UNSUPPORTED, "malformed frame".to_string()))
            }
            CloseReason::Shutdown => {
                Some((close_code::GOING_AWAY, "server shutting down".to_string()))
            }
        }
    }
}

/// A connected client
pub struct ClientConnection {
    /// Unique connection ID
    pub id: Uuid,
    /// Key that authorized this connection, if the validator could resolve it
    pub key_id: Option<KeyId>,
    /// Frames waiting for the writer task
    tx: mpsc::Sender<Vec<u8>>,
    closing: AtomicBool,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
}

impl ClientConnection {
    pub fn new(key_id: Option<KeyId>, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key_id,
            tx,
            closing: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Queue a binary frame for this client. Waits while the queue is full,
    /// unless the connection is closed in the meantime.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), ConnectionClosed> {
        if self.is_closing() {
            return Err(ConnectionClosed);
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ConnectionClosed),
            sent = self.tx.send(frame) => sent.map_err(|_| ConnectionClosed),
        }
    }

    /// Start closing. Only the first call wins; later calls return `false` and change nothing.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.close_reason.set(reason);
        self.cancel.cancel();
        true
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Reason given by whoever closed the connection first
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.get()
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

#[derive(Default)]
struct Registry {
    connections: HashMap<Uuid, Arc<ClientConnection>>,
    by_key: HashMap<KeyId, HashSet<Uuid>>,
    /// Revoked keys and the epoch they were revoked at
    revoked: HashMap<KeyId, u64>,
    /// Bumped on every revocation
    epoch: u64,
    /// Epochs at which in-flight upgrades started, with their counts
    in_flight: BTreeMap<u64, usize>,
    closed: bool,
}

impl Registry {
    /// Drop tombstones no in-flight upgrade can still run into.
    /// An upgrade only needs the ones written after it started.
    fn prune(&mut self) {
        match self.in_flight.keys().next().copied() {
            Some(oldest) => self.revoked.retain(|_, revoked_at| *revoked_at > oldest),
            None => self.revoked.clear(),
        }
    }

    fn detach(&mut self, id: Uuid) -> Option<Arc<ClientConnection>> {
        let conn = self.connections.remove(&id)?;

        if let Some(key_id) = conn.key_id {
            if let Some(ids) = self.by_key.get_mut(&key_id) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_key.remove(&key_id);
                }
            }
        }

        Some(conn)
    }
}

/// An upgrade between authentication and registration.
/// Keeps tombstones written after it started alive until it is dropped.
pub struct UpgradeTicket {
    registry: Weak<Mutex<Registry>>,
    epoch: u64,
}

impl Drop for UpgradeTicket {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock();

        if let Some(count) = registry.in_flight.get_mut(&self.epoch) {
            *count -= 1;
            if *count == 0 {
                registry.in_flight.remove(&self.epoch);
            }
        }
        registry.prune();
    }
}

/// Manages all active connections
///
/// The global set, the key index, the revoked-key tombstones and the closed flag share
/// one mutex, which is only held for map updates.
#[derive(Default)]
pub struct ConnectionManager {
    registry: Arc<Mutex<Registry>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an upgrade. Take the ticket before authenticating and hand it to [`add`](Self::add).
    pub fn begin_upgrade(&self) -> UpgradeTicket {
        let mut registry = self.registry.lock();
        let epoch = registry.epoch;
        *registry.in_flight.entry(epoch).or_default() += 1;

        UpgradeTicket {
            registry: Arc::downgrade(&self.registry),
            epoch,
        }
    }

    /// Register a new connection, refusing keys revoked since `ticket` was taken
    pub fn add(&self, conn: Arc<ClientConnection>, ticket: UpgradeTicket) -> Result<(), RegisterError> {
        let mut registry = self.registry.lock();

        if registry.closed {
            return Err(RegisterError::Closed);
        }

        if let Some(key_id) = conn.key_id {
            if let Some(&revoked_at) = registry.revoked.get(&key_id) {
                if revoked_at > ticket.epoch {
                    return Err(RegisterError::Revoked(key_id));
                }
            }
            registry.by_key.entry(key_id).or_default().insert(conn.id);
        }
        registry.connections.insert(conn.id, conn);
        drop(registry);

        // Releasing the ticket takes the lock again
        drop(ticket);
        Ok(())
    }

    /// Remove a connection. Removing an unknown or already removed one is a no-op.
    pub fn remove(&self, id: Uuid) -> Option<Arc<ClientConnection>> {
        self.registry.lock().detach(id)
    }

    /// Mark a key revoked and detach every connection it authorized
    pub fn revoke_key(&self, key_id: KeyId) -> Vec<Arc<ClientConnection>> {
        let mut registry = self.registry.lock();
        registry.epoch += 1;
        let epoch = registry.epoch;
        registry.revoked.insert(key_id, epoch);

        let ids = registry.by_key.remove(&key_id).unwrap_or_default();
        let detached = ids
            .into_iter()
            .filter_map(|id| registry.connections.remove(&id))
            .collect();

        registry.prune();
        detached
    }

    /// Stop accepting connections and detach every registered one
    pub fn close_all(&self) -> Vec<Arc<ClientConnection>> {
        let mut registry = self.registry.lock();
        registry.closed = true;
        registry.by_key.clear();
        registry.connections.drain().map(|(_, conn)| conn).collect()
    }

    /// Get a connection by ID
    pub fn get(&self, id: Uuid) -> Option<Arc<ClientConnection>> {
        self.registry.lock().connections.get(&id).cloned()
    }

    /// Get total connection count
    pub fn count(&self) -> usize {
        self.registry.lock().connections.len()
    }

    /// Number of live connections authorized by a key
    pub fn count_for_key(&self, key_id: &KeyId) -> usize {
        self.registry
            .lock()
            .by_key
            .get(key_id)
            .map_or(0, HashSet::len)
    }

    /// Whether a tombstone for `key_id` is still held for in-flight upgrades
    pub fn is_revoked(&self, key_id: &KeyId) -> bool {
        self.registry.lock().revoked.contains_key(key_id)
    }

    /// Number of tombstones currently held
    pub fn tombstone_count(&self) -> usize {
        self.registry.lock().revoked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn connection(key_id: Option<KeyId>) -> (Arc<ClientConnection>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(10);
        (Arc::new(ClientConnection::new(key_id, tx)), rx)
    }

    fn register(manager: &ConnectionManager, conn: &Arc<ClientConnection>) -> Result<(), RegisterError> {
        manager.add(conn.clone(), manager.begin_upgrade())
    }

    #[test]
    fn test_add_indexes_by_key() {
        let manager = ConnectionManager::new();
        let key = KeyId::new();
        let (a, _ra) = connection(Some(key));
        let (b, _rb) = connection(Some(key));
        let (anon, _rc) = connection(None);

        register(&manager, &a).unwrap();
        register(&manager, &b).unwrap();
        register(&manager, &anon).unwrap();

        assert_eq!(manager.count(), 3);
        assert_eq!(manager.count_for_key(&key), 2);

        manager.remove(a.id);
        assert_eq!(manager.count(), 2);
        assert_eq!(manager.count_for_key(&key), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let manager = ConnectionManager::new();
        let key = KeyId::new();
        let (conn, _rx) = connection(Some(key));
        register(&manager, &conn).unwrap();

        assert!(manager.remove(conn.id).is_some());
        assert!(manager.remove(conn.id).is_none());
        assert_eq!(manager.count(), 0);
        assert_eq!(manager.count_for_key(&key), 0);
    }

    #[test]
    fn test_revoke_key_detaches_only_that_key() {
        let manager = ConnectionManager::new();
        let revoked = KeyId::new();
        let kept = KeyId::new();
        let (a, _ra) = connection(Some(revoked));
        let (b, _rb) = connection(Some(revoked));
        let (c, _rc) = connection(Some(kept));

        for conn in [&a, &b, &c] {
            register(&manager, conn).unwrap();
        }

        let detached = manager.revoke_key(revoked);
        let mut ids: Vec<_> = detached.iter().map(|c| c.id).collect();
        ids.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(ids, expected);

        assert_eq!(manager.count(), 1);
        assert!(manager.get(c.id).is_some());
        assert_eq!(manager.count_for_key(&revoked), 0);
        assert_eq!(manager.count_for_key(&kept), 1);

        // Read loops exiting later must find nothing to remove
        assert!(manager.remove(a.id).is_none());
    }

    #[test]
    fn test_upgrade_in_flight_during_revocation_is_refused() {
        let manager = ConnectionManager::new();
        let key = KeyId::new();

        let ticket = manager.begin_upgrade();
        manager.revoke_key(key);
        assert!(manager.is_revoked(&key));

        let (conn, _rx) = connection(Some(key));
        let result = manager.add(conn, ticket);
        assert_eq!(result, Err(RegisterError::Revoked(key)));
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_tombstones_are_pruned_once_upgrades_finish() {
        let manager = ConnectionManager::new();

        // Nothing in flight: no tombstone is kept
        manager.revoke_key(KeyId::new());
        assert_eq!(manager.tombstone_count(), 0);

        let ticket = manager.begin_upgrade();
        for _ in 0..100 {
            manager.revoke_key(KeyId::new());
        }
        assert_eq!(manager.tombstone_count(), 100);

        drop(ticket);
        assert_eq!(manager.tombstone_count(), 0);
    }

    #[test]
    fn test_tombstones_older_than_every_upgrade_are_pruned() {
        let manager = ConnectionManager::new();
        let early = KeyId::new();
        let late = KeyId::new();

        let first = manager.begin_upgrade();
        manager.revoke_key(early);
        let second = manager.begin_upgrade();
        manager.revoke_key(late);
        assert_eq!(manager.tombstone_count(), 2);

        drop(first);
        assert!(!manager.is_revoked(&early));
        assert!(manager.is_revoked(&late));

        // Registered after its own revocation epoch: only later revocations matter
        let (conn, _rx) = connection(Some(early));
        assert!(manager.add(conn, second).is_ok());
        assert_eq!(manager.tombstone_count(), 0);
    }

    #[test]
    fn test_closed_manager_refuses_registration() {
        let manager = ConnectionManager::new();
        let (a, _ra) = connection(Some(KeyId::new()));
        register(&manager, &a).unwrap();

        let ticket = manager.begin_upgrade();
        assert_eq!(manager.close_all().len(), 1);

        let (b, _rb) = connection(None);
        assert_eq!(manager.add(b, ticket), Err(RegisterError::Closed));
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_close_only_once() {
        let (conn, _rx) = connection(None);

        assert!(conn.close(CloseReason::Revoked("credential revoked".to_string())));
        assert!(!conn.close(CloseReason::PeerClosed));
        assert!(conn.is_closing());
        assert_eq!(
            conn.close_reason(),
            Some(&CloseReason::Revoked("credential revoked".to_string()))
        );
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (conn, mut rx) = connection(None);

        conn.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(rx.recv().await, Some(vec![1, 2, 3]));

        conn.close(CloseReason::Shutdown);
        assert!(conn.send(vec![4]).await.is_err());
        conn.closed().await;
    }

    #[tokio::test]
    async fn test_blocked_send_released_by_close() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Arc::new(ClientConnection::new(None, tx));
        conn.send(vec![1]).await.unwrap();

        // Queue is full and nobody reads it
        let blocked = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(vec![2]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        conn.close(CloseReason::Revoked("credential revoked".to_string()));
        let result = timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn test_close_frames() {
        assert_eq!(CloseReason::PeerClosed.close_frame(), None);
        assert_eq!(CloseReason::Transport("eof".into()).close_frame(), None);
        assert_eq!(
            CloseReason::Revoked("credential revoked".into()).close_frame(),
            Some((1000, "credential revoked".to_string()))
        );
        assert_eq!(CloseReason::Shutdown.close_frame().map(|f| f.0), Some(1001));
        assert_eq!(CloseReason::MalformedFrame.close_frame().map(|f| f.0), Some(1003));
    }
}
