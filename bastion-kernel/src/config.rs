use bastion_protocol::Protocol;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct KernelConfig {
    #[serde(default)]
    pub discovery: DiscoveryConf,
    #[serde(default)]
    pub channel: ChannelConf,
    #[serde(default)]
    pub http: HttpConf,
    /// alias -> address, registered at startup
    #[serde(default)]
    pub aliases: BTreeMap<String, Ipv4Addr>,
    /// group -> members (aliases or literal addresses)
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    /// extra or overriding service definitions
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConf {
    /// UDP port agents listen on
    pub port: u16,
    pub broadcast: Ipv4Addr,
    /// local UDP port for ANNOUNCE replies, 0 = ephemeral
    pub reply_port: u16,
    pub interval_secs: u64,
    pub sweep_secs: u64,
    /// no ANNOUNCE for this long -> LOST
    pub session_timeout_secs: u64,
    /// LOST for this long -> removed
    pub grace_secs: u64,
}

impl Default for DiscoveryConf {
    fn default() -> Self {
        Self {
            port: 9999,
            broadcast: Ipv4Addr::BROADCAST,
            reply_port: 0,
            interval_secs: 5,
            sweep_secs: 5,
            session_timeout_secs: 20,
            grace_secs: 120,
        }
    }
}

impl DiscoveryConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn sweep(&self) -> Duration {
        Duration::from_secs(self.sweep_secs.max(1))
    }

    pub fn session_timeout(&self) -> time::Duration {
        time::Duration::seconds(self.session_timeout_secs as i64)
    }

    pub fn grace(&self) -> time::Duration {
        time::Duration::seconds(self.grace_secs as i64)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ChannelConf {
    pub connect_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
    pub queue_depth: usize,
}

impl Default for ChannelConf {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_attempts: 6,
            queue_depth: 64,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub listen: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { listen: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServiceConf {
    #[serde(default)]
    pub port: Option<u16>,
    pub protocol: Protocol,
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("BASTION_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if !Path::new(&path).exists() {
        warn!("[kernel] no {path}, using default config");
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(&path).await.unwrap_or_default();
    match parse_config(&txt) {
        Ok(cfg) => {
            info!("[kernel] loaded config from {path}");
            cfg
        }
        Err(e) => {
            warn!("[kernel] invalid config {path}: {e}, using defaults");
            KernelConfig::default()
        }
    }
}
