//! Agent identity for discovery
//!
//! - Primary MAC address detection with priority (Ethernet > WiFi > Other)
//! - Device id = primary MAC without colons, random UUID when no MAC is readable
//! - Hostname via `gethostname`

use if_addrs::get_if_addrs;
use tracing::{debug, info, warn};

/// Interface type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Other,
}

#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: String,
    pub interface_type: InterfaceType,
}

#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub device_id: String,
    pub hostname: String,
    pub primary_mac: Option<String>,
}

impl AgentIdentity {
    pub fn discover() -> Self {
        let interfaces = enumerate_interfaces();
        let primary_mac = select_primary_mac(&interfaces);
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let identity = Self::from_parts(primary_mac, hostname);
        info!(
            "Identity - Device ID: {}, Hostname: {}, MAC: {}",
            identity.device_id,
            identity.hostname,
            identity.primary_mac.as_deref().unwrap_or("none")
        );
        identity
    }

    fn from_parts(primary_mac: Option<String>, hostname: String) -> Self {
        let device_id = match &primary_mac {
            Some(mac) => mac.replace(':', ""),
            None => {
                warn!("No readable MAC address, using a random device id");
                uuid::Uuid::new_v4().simple().to_string()
            }
        };
        Self { device_id, hostname, primary_mac }
    }
}

fn enumerate_interfaces() -> Vec<NetworkInterface> {
    let if_addrs = match get_if_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("Failed to enumerate network interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut interfaces: Vec<NetworkInterface> = Vec::new();
    for if_addr in if_addrs {
        if if_addr.is_loopback() || interfaces.iter().any(|i| i.name == if_addr.name) {
            continue;
        }
        match mac_address::mac_address_by_name(&if_addr.name) {
            Ok(Some(mac)) => {
                let interface = NetworkInterface {
                    name: if_addr.name.clone(),
                    mac: mac.to_string().to_lowercase(),
                    interface_type: classify_interface(&if_addr.name),
                };
                debug!("Found interface: {} ({})", interface.name, interface.mac);
                interfaces.push(interface);
            }
            Ok(None) => debug!("No MAC found for interface: {}", if_addr.name),
            Err(e) => debug!("Error getting MAC for {}: {}", if_addr.name, e),
        }
    }
    interfaces
}

/// Classify interface type based on name patterns
fn classify_interface(name: &str) -> InterfaceType {
    let name_lower = name.to_lowercase();

    if name_lower == "lo" || name_lower.starts_with("lo0") || name_lower.contains("loopback") {
        return InterfaceType::Loopback;
    }

    if name_lower.contains("wlan") || name_lower.contains("wifi") || name_lower.starts_with("wlp") || name_lower.starts_with("wlo") {
        return InterfaceType::Wireless;
    }

    if name_lower.starts_with("eth") || name_lower.starts_with("en") {
        return InterfaceType::Ethernet;
    }

    InterfaceType::Other
}

/// Ethernet first, then wireless, then whatever else carries a MAC
fn select_primary_mac(interfaces: &[NetworkInterface]) -> Option<String> {
    let pick = |kind: InterfaceType| interfaces.iter().find(|i| i.interface_type == kind);
    let interface = pick(InterfaceType::Ethernet)
        .or_else(|| pick(InterfaceType::Wireless))
        .or_else(|| interfaces.iter().find(|i| i.interface_type != InterfaceType::Loopback))?;
    if interface.interface_type == InterfaceType::Other {
        warn!("No Ethernet/WiFi found, using interface: {}", interface.name);
    }
    Some(interface.mac.clone())
}
