//! Server wiring
//!
//! Owns the hub and the key store, binds the HTTP listener and runs the revocation
//! watcher alongside it.

use crate::auth::KeyStore;
use crate::config::ServerConfig;
use crate::server::hub::Hub;
use crate::server::router::Dispatch;
use crate::server::websocket::{create_router, AppState};

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// The keyhub server
pub struct KeyhubServer {
    config: ServerConfig,
    store: Arc<KeyStore>,
    hub: Arc<Hub>,
}

impl KeyhubServer {
    pub fn new(config: ServerConfig, store: Arc<KeyStore>, router: Arc<dyn Dispatch>) -> Self {
        let hub = Arc::new(Hub::new(config.hub.clone(), store.clone(), router));

        Self { config, store, hub }
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    pub fn store(&self) -> Arc<KeyStore> {
        self.store.clone()
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.hub.connection_count()
    }

    fn app(&self) -> axum::Router {
        create_router(AppState {
            hub: self.hub.clone(),
            store: self.store.clone(),
            admin_key: self.config.admin_key.clone(),
        })
    }

    /// Bind the listener and start serving in the background.
    /// Returns the bound address (useful with port 0) and the serving task,
    /// which finishes after [`shutdown`](Self::shutdown).
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.bind_addr))?;
        let addr = listener.local_addr()?;

        let app = self.app();
        let watcher = self.hub.watch_revocations(self.store.as_ref());
        let shutdown = self.hub.shutdown_token();

        info!(addr = %addr, "keyhub server listening");

        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;

            if let Err(e) = result {
                error!(error = %e, "Server error");
            }
            let _ = watcher.await;
        });

        Ok((addr, handle))
    }

    /// Serve until `signal` resolves, then close every connection
    pub async fn run(&self, signal: impl Future<Output = ()>) -> Result<()> {
        let (_, handle) = self.listen().await?;

        signal.await;
        info!("Shutdown signal received, stopping server");

        self.shutdown();
        handle.await.context("Server task failed")?;

        Ok(())
    }

    /// Close all connections and stop the listener
    pub fn shutdown(&self) {
        self.hub.shutdown();
    }
}
