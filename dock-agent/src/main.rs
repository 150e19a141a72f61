//! GameDock agent daemon: advertises itself over mDNS, accepts Hub
//! connections, receives game uploads, and registers library shortcuts.

mod advertise;
mod config;
mod library;
mod receiver;
mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use dock_core::trust::{load_or_create_identity, TrustStore};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::args().any(|a| a == "--version" || a == "-V") {
        println!("dock-agent {VERSION}");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::load();
    tracing::info!(name = %config.name, port = config.port, "starting agent");

    let state_dir = config::state_dir();
    let agent_id = load_or_create_identity(&state_dir.join("identity"))
        .context("failed to load agent identity")?;
    let trust = TrustStore::load(state_dir.join("trusted_hubs.json"))
        .context("failed to load trust store")?;

    let artwork_dir = config
        .shortcuts_path
        .parent()
        .map(|p| p.join("grid"))
        .unwrap_or_else(|| std::path::PathBuf::from("grid"));
    let library = library::ShortcutLibrary::new(config.shortcuts_path.clone(), artwork_dir);
    let receiver = receiver::UploadReceiver::new(config.install_dir.clone());

    // Bind before advertising so the record always carries a live port,
    // including when port 0 asked for an ephemeral one.
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    let bound_port = listener.local_addr()?.port();
    tracing::info!(port = bound_port, "listening");

    let mut advertiser = advertise::Advertiser::new()?;
    advertiser.start(&agent_id, &config.name, VERSION, bound_port)?;

    let state = Arc::new(server::AgentState {
        agent_id,
        version: VERSION.to_string(),
        config,
        trust: tokio::sync::Mutex::new(trust),
        library: tokio::sync::Mutex::new(library),
        receiver,
    });

    let cancel = CancellationToken::new();
    let server = tokio::spawn(server::run(Arc::clone(&state), listener, cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    cancel.cancel();
    advertiser.stop();
    server.await.context("server task panicked")??;
    Ok(())
}
