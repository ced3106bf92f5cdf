//! Bastion Agent Host - firewall agent for managed devices
//!
//! Runs on each device the kernel manages:
//! - Answers discovery broadcasts with its identity and command port
//! - Accepts kernel connections and reads one rule per frame
//! - Validates every rule against the strict grammar before running it
//! - Applies rules with the firewall tool and reports one result per rule

mod config;
mod discovery;
mod execution;
mod identity;
mod listener;
mod validator;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use config::AgentConfig;
use execution::FirewallExecutor;
use identity::AgentIdentity;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Main agent state
struct Agent {
    config: AgentConfig,
    identity: AgentIdentity,
    started_at: DateTime<Utc>,
}

impl Agent {
    async fn new() -> Result<Self> {
        info!("Initializing Bastion Agent Host v{}", env!("CARGO_PKG_VERSION"));

        let first_run = AgentConfig::is_first_time_setup();
        let config = AgentConfig::load().await.context("Failed to load agent config")?;
        if first_run {
            match config.save().await {
                Ok(()) => info!("Wrote default config to {}", AgentConfig::config_file_path()?.display()),
                Err(e) => warn!("Could not write default config: {}", e),
            }
        }

        let identity = AgentIdentity::discover();
        Ok(Agent {
            config,
            identity,
            started_at: Utc::now(),
        })
    }

    async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();

        let tcp = listener::bind(&self.config.network.command_listen).await?;
        let command_port = self
            .config
            .network
            .advertise_port
            .unwrap_or(tcp.local_addr()?.port());
        let udp = discovery::bind_socket(self.config.network.discovery_port).await?;

        let executor = FirewallExecutor::from_config(&self.config.firewall);
        let listener_task = tokio::spawn(listener::run_listener(tcp, executor, shutdown.child_token()));
        let responder_task = tokio::spawn(discovery::run_responder(
            udp,
            self.identity.clone(),
            command_port,
            shutdown.child_token(),
        ));

        info!(
            "Agent {} ready - discovery on UDP {}, commands on TCP {}",
            self.identity.device_id, self.config.network.discovery_port, command_port
        );

        tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
        info!("Shutting down after {}s", (Utc::now() - self.started_at).num_seconds());
        shutdown.cancel();

        for (name, task) in [("listener", listener_task), ("responder", responder_task)] {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} stopped with error: {:#}", name, e),
                Err(e) => error!("{} task panicked: {}", name, e),
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bastion_agent_host=info")),
        )
        .init();

    info!("Bastion Agent Host starting...");

    let agent = Agent::new().await.context("Failed to create agent")?;
    agent.run().await.context("Agent execution failed")?;

    Ok(())
}
