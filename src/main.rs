//! keyhub CLI entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use clap::Parser;
use keyhub::auth::{AdminKey, KeyDigest, KeyStore};
use keyhub::config::{HubConfig, ServerConfig};
use keyhub::server::{base_router, KeyhubServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            bind,
            admin_key,
            outbound_buffer,
            bootstrap_keys,
        } => serve(bind, admin_key, outbound_buffer, bootstrap_keys).await,
        Commands::Digest { secret } => {
            println!("{}", KeyDigest::of(&secret).encode());
            Ok(())
        }
    }
}

async fn serve(
    bind: String,
    admin_key: Option<String>,
    outbound_buffer: usize,
    bootstrap_keys: Vec<String>,
) -> Result<()> {
    let bind_addr: SocketAddr = bind.parse().context("Invalid bind address")?;

    let mut config = ServerConfig::new(bind_addr)
        .hub(HubConfig::default().outbound_buffer(outbound_buffer));
    if let Some(key) = admin_key.filter(|k| !k.is_empty()) {
        config = config.admin_key(AdminKey::new(key));
    } else {
        info!("No admin key configured, key management routes are open");
    }

    let store = Arc::new(KeyStore::in_memory());

    for name in &bootstrap_keys {
        let issued = store
            .issue(name)
            .await
            .with_context(|| format!("Failed to issue bootstrap key '{}'", name))?;
        println!("{}\t{}\t{}", issued.id, issued.name, issued.key);
    }

    let router = Arc::new(base_router().context("Failed to build routes")?);
    let server = KeyhubServer::new(config, store, router);

    info!(addr = %bind_addr, "keyhub starting");
    server.run(shutdown_signal()).await?;
    info!("keyhub stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
