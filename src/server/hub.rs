//! Connection hub
//!
//! Gates connections by key, tracks them per key, and closes every connection of
//! a key as soon as the key is revoked.

use crate::auth::{KeyId, KeyValidator, Revocation, RevocationSource};
use crate::config::HubConfig;
use crate::server::connections::{
    ClientConnection, CloseReason, ConnectionManager, RegisterError, UpgradeTicket,
};
use crate::server::router::Dispatch;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Query parameter carrying the key
pub const API_KEY_PARAM: &str = "api_key";

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Error)]
pub enum HubError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("key {0} has been revoked")]
    Revoked(KeyId),

    #[error("hub is shutting down")]
    ShuttingDown,
}

impl From<RegisterError> for HubError {
    fn from(e: RegisterError) -> Self {
        match e {
            RegisterError::Revoked(key_id) => HubError::Revoked(key_id),
            RegisterError::Closed => HubError::ShuttingDown,
        }
    }
}

/// Pick the presented secret: the query parameter wins over the bearer header.
/// A non-empty query parameter is used even if a header is also present.
pub fn extract_credential<'a>(
    query_key: Option<&'a str>,
    authorization: Option<&'a str>,
) -> Option<&'a str> {
    if let Some(key) = query_key.filter(|k| !k.is_empty()) {
        return Some(key);
    }

    authorization
        .and_then(|h| h.strip_prefix(BEARER_PREFIX))
        .filter(|k| !k.is_empty())
}

/// Live connection registry plus the authorization gate in front of it
pub struct Hub {
    config: HubConfig,
    validator: Arc<dyn KeyValidator>,
    router: Arc<dyn Dispatch>,
    connections: ConnectionManager,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(config: HubConfig, validator: Arc<dyn KeyValidator>, router: Arc<dyn Dispatch>) -> Self {
        Self {
            config,
            validator,
            router,
            connections: ConnectionManager::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start an upgrade. Take the ticket before [`authenticate`](Self::authenticate)
    /// so a revocation landing in between is not missed by [`open`](Self::open).
    pub fn begin_upgrade(&self) -> UpgradeTicket {
        self.connections.begin_upgrade()
    }

    /// Check a presented secret. Returns the key identity when the validator can resolve one.
    pub async fn authenticate(&self, secret: Option<&str>) -> Result<Option<KeyId>, HubError> {
        let secret = secret.ok_or(HubError::Unauthorized)?;

        if !self.validator.validate(secret).await {
            return Err(HubError::Unauthorized);
        }

        match self.validator.resolver() {
            // Valid a moment ago but gone now: treat as revoked
            Some(resolver) => resolver
                .resolve(secret)
                .await
                .map(Some)
                .ok_or(HubError::Unauthorized),
            None => Ok(None),
        }
    }

    /// Create and register a connection for an authenticated client.
    /// Returns the handle and the receiving end of its outbound queue.
    pub fn open(
        &self,
        key_id: Option<KeyId>,
        ticket: UpgradeTicket,
    ) -> Result<(Arc<ClientConnection>, mpsc::Receiver<Vec<u8>>), HubError> {
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer);
        let conn = Arc::new(ClientConnection::new(key_id, tx));

        self.connections.add(conn.clone(), ticket)?;
        debug!(conn_id = %conn.id, key_id = ?key_id, "Registered connection");

        Ok((conn, rx))
    }

    /// Deregister and close a connection. Safe to call any number of times.
    pub fn close(&self, conn: &ClientConnection, reason: CloseReason) -> bool {
        self.connections.remove(conn.id);
        conn.close(reason)
    }

    /// Close every connection authorized by `key_id`, returning how many were closed
    pub fn revoke(&self, key_id: KeyId) -> usize {
        let detached = self.connections.revoke_key(key_id);
        let reason = CloseReason::Revoked(self.config.revoked_reason.clone());

        let closed = detached
            .iter()
            .filter(|conn| conn.close(reason.clone()))
            .count();

        info!(key_id = %key_id, connections = closed, "Closed connections for revoked key");
        closed
    }

    /// Spawn the task that applies revocations from `source` until shutdown
    pub fn watch_revocations(self: &Arc<Self>, source: &dyn RevocationSource) -> JoinHandle<()> {
        let (mut revocations, unsubscribe) = source.subscribe_revocations();
        let hub = self.clone();

        tokio::spawn(async move {
            let _unsubscribe = unsubscribe;

            loop {
                tokio::select! {
                    _ = hub.shutdown.cancelled() => break,
                    event = revocations.recv() => match event {
                        Some(Revocation { key_id }) => {
                            hub.revoke(key_id);
                        }
                        None => {
                            debug!("Revocation stream ended");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Stop accepting connections and close all open ones
    pub fn shutdown(&self) {
        self.shutdown.cancel();

        let drained = self.connections.close_all();
        let count = drained.len();
        for conn in drained {
            conn.close(CloseReason::Shutdown);
        }

        info!(connections = count, "Hub shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled on shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<dyn Dispatch> {
        &self.router
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }
}
