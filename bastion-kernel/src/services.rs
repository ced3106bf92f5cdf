/**
 * SERVICE TABLE - Well-known service names for policy intents
 *
 * ROLE:
 * Maps a service name from an intent ("ssh", "dns", "ping") to the protocol
 * and destination port a rule should match.
 *
 * OPERATION:
 * - Built-in table covering the usual LAN services
 * - Kernel config may add services or override built-in ones at startup
 * - Read-only once the kernel runs
 * - "any", "all" and "traffic" are wildcards: no protocol filter at all
 */

use crate::config::ServiceConf;
use bastion_protocol::Protocol;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

const BUILTIN: &[(&str, Option<u16>, Protocol)] = &[
    ("ftp", Some(21), Protocol::Tcp),
    ("ssh", Some(22), Protocol::Tcp),
    ("telnet", Some(23), Protocol::Tcp),
    ("smtp", Some(25), Protocol::Tcp),
    ("dns", Some(53), Protocol::Udp),
    ("http", Some(80), Protocol::Tcp),
    ("ntp", Some(123), Protocol::Udp),
    ("snmp", Some(161), Protocol::Udp),
    ("https", Some(443), Protocol::Tcp),
    ("mqtt", Some(1883), Protocol::Tcp),
    ("mysql", Some(3306), Protocol::Tcp),
    ("rdp", Some(3389), Protocol::Tcp),
    ("postgres", Some(5432), Protocol::Tcp),
    ("ping", None, Protocol::Icmp),
    ("icmp", None, Protocol::Icmp),
];

const WILDCARDS: &[&str] = &["any", "all", "traffic"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEntry {
    pub name: String,
    pub port: Option<u16>,
    pub protocol: Protocol,
}

#[derive(Debug, Clone)]
pub struct ServiceTable {
    entries: HashMap<String, ServiceEntry>,
}

impl ServiceTable {
    pub fn builtin() -> Self {
        let entries = BUILTIN
            .iter()
            .map(|(name, port, protocol)| {
                let entry = ServiceEntry { name: name.to_string(), port: *port, protocol: *protocol };
                (name.to_string(), entry)
            })
            .collect();
        Self { entries }
    }

    /// Layer configured services over the built-in ones. Entries that could
    /// never render a valid rule are skipped with a warning.
    pub fn with_overrides(mut self, extra: &BTreeMap<String, ServiceConf>) -> Self {
        for (name, conf) in extra {
            let key = name.trim().to_lowercase();
            if key.is_empty() || Self::is_wildcard(&key) {
                warn!("[services] ignoring reserved service name '{}'", name);
                continue;
            }
            if conf.protocol.carries_port() && matches!(conf.port, None | Some(0)) {
                warn!("[services] '{}' needs a non-zero port for {}", name, conf.protocol);
                continue;
            }
            let port = if conf.protocol.carries_port() { conf.port } else { None };
            self.entries.insert(
                key.clone(),
                ServiceEntry { name: key, port, protocol: conf.protocol },
            );
        }
        self
    }

    pub fn is_wildcard(name: &str) -> bool {
        let name = name.trim();
        WILDCARDS.iter().any(|w| w.eq_ignore_ascii_case(name))
    }

    pub fn get(&self, name: &str) -> Option<&ServiceEntry> {
        self.entries.get(&name.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All services sorted by name
    pub fn list(&self) -> Vec<ServiceEntry> {
        let mut list: Vec<ServiceEntry> = self.entries.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}

impl Default for ServiceTable {
    fn default() -> Self {
        Self::builtin()
    }
}
