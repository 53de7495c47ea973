//! Configuration for the key store, the hub and the server

use crate::auth::{AdminKey, DEFAULT_SECRET_LEN};
use std::net::SocketAddr;
use std::time::Duration;

/// Key store settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Random bytes per issued secret (never fewer than 32)
    pub secret_len: usize,

    /// Buffer size of lossy revocation subscriptions
    pub subscriber_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            secret_len: DEFAULT_SECRET_LEN,
            subscriber_buffer: 1,
        }
    }
}

impl StoreConfig {
    pub fn secret_len(mut self, len: usize) -> Self {
        self.secret_len = len;
        self
    }

    pub fn subscriber_buffer(mut self, buffer: usize) -> Self {
        self.subscriber_buffer = buffer;
        self
    }
}

/// Connection hub settings
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound frames queued per connection before writers wait
    pub outbound_buffer: usize,

    /// Close reason sent to connections whose key was revoked
    pub revoked_reason: String,

    /// Longest a single socket write may take before the connection is dropped
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 64,
            revoked_reason: "credential revoked".to_string(),
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl HubConfig {
    pub fn outbound_buffer(mut self, buffer: usize) -> Self {
        self.outbound_buffer = buffer.max(1);
        self
    }

    pub fn revoked_reason(mut self, reason: impl Into<String>) -> Self {
        self.revoked_reason = reason.into();
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// HTTP server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Admin key required on key management routes, if set
    pub admin_key: Option<AdminKey>,

    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            admin_key: None,
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }

    pub fn admin_key(mut self, key: AdminKey) -> Self {
        self.admin_key = Some(key);
        self
    }

    pub fn hub(mut self, hub: HubConfig) -> Self {
        self.hub = hub;
        self
    }
}
