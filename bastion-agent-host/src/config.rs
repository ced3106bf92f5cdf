//! Agent configuration
//!
//! TOML file under the OS config directory (`bastion-agent/config.toml`),
//! overridable with `BASTION_AGENT_CONFIG`. A missing file means defaults;
//! on first start the defaults are written out so they can be edited.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub firewall: FirewallConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port DISCOVER broadcasts arrive on
    pub discovery_port: u16,
    /// TCP address of the command listener
    pub command_listen: String,
    /// Port to announce instead of the bound one (port forwarding, NAT)
    pub advertise_port: Option<u16>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: 9999,
            command_listen: "0.0.0.0:10000".to_string(),
            advertise_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub binary: String,
    /// Non-interactive elevation prefix; empty when already privileged
    pub elevate_with: Vec<String>,
    pub timeout_secs: u64,
    /// Run `-C` before `-A` so re-applying a rule never duplicates it
    pub check_before_append: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            binary: "/usr/sbin/iptables".to_string(),
            elevate_with: vec!["sudo".to_string(), "-n".to_string()],
            timeout_secs: 10,
            check_before_append: true,
        }
    }
}

impl FirewallConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl AgentConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid agent config")
    }

    /// Load config from `BASTION_AGENT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::parse(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path()?;

        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&config_path, content).await?;
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("BASTION_AGENT_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("bastion-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn is_first_time_setup() -> bool {
        Self::config_file_path().map(|p| !p.exists()).unwrap_or(true)
    }
}
