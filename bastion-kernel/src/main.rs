/**
 * BASTION KERNEL - Controller entry point
 *
 * ROLE: Wires config, directory, discovery, command channels and the HTTP API.
 *
 * ARCHITECTURE: discovery finds agents over UDP broadcast, one link task per
 * agent keeps a TCP command channel open, the HTTP API compiles intents and
 * dispatches them over those channels.
 */

mod channel;
mod compiler;
mod config;
mod directory;
mod discovery;
mod health;
mod http;
mod services;
mod sessions;
mod state;

use crate::channel::{ChannelManager, ChannelSettings};
use crate::config::load_config;
use crate::directory::Directory;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::sessions::SessionTable;
use crate::state::new_state;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bastion_kernel=info")),
        )
        .init();

    let cfg = load_config().await;
    let directory = new_state(Directory::from_config(&cfg));

    let shutdown = CancellationToken::new();
    let sessions = Arc::new(SessionTable::new());
    let channels = Arc::new(ChannelManager::new(
        sessions,
        ChannelSettings::from(&cfg.channel),
        shutdown.clone(),
    ));

    // discovery
    let socket = discovery::bind_socket(cfg.discovery.reply_port).await?;
    {
        let conf = cfg.discovery.clone();
        let channels = channels.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = discovery::run_discovery(socket, conf, channels, cancel).await {
                error!("[kernel] discovery stopped: {:#}", e);
            }
        });
    }

    let health_tracker = HealthTracker::new();
    health_tracker.spawn_health_reporter(
        directory.clone(),
        channels.clone(),
        Duration::from_secs(60),
        shutdown.clone(),
    );

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("[kernel] shutting down");
                    shutdown.cancel();
                }
                Err(e) => error!("[kernel] cannot listen for ctrl-c: {}", e),
            }
        });
    }

    let app = http::build_router(AppState { directory, channels, health_tracker });
    let listener = TcpListener::bind(cfg.http.listen.as_str())
        .await
        .with_context(|| format!("binding HTTP listener on {}", cfg.http.listen))?;
    info!("[kernel] listening on http://{}", cfg.http.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server failed")?;
    Ok(())
}
