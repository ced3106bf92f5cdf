/**
 * DIRECTORY - Human names for devices, groups and services
 *
 * ROLE:
 * Resolves the names used in policy intents ("DeviceA", "lab", "ssh") into
 * addresses and service definitions. Single source of truth for aliases.
 *
 * OPERATION:
 * - Aliases are case-insensitive and bidirectional: one name per address,
 *   one address per name
 * - Registering a name or an address that is already bound elsewhere is a
 *   conflict; replacing a binding is an explicit, separate call
 * - Groups are named sets of members, resolved to addresses when registered
 * - Services come from the ServiceTable and are fixed after startup
 *
 * CONCURRENCY:
 * Held behind a `Shared<Directory>` (RwLock); readers never observe a
 * half-applied alias change.
 */

use crate::config::KernelConfig;
use crate::services::{ServiceEntry, ServiceTable};
use bastion_protocol::AddrSpec;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use tracing::{info, warn};

const MAX_NAME_LEN: usize = 64;
const RESERVED_NAMES: &[&str] = &["any", "anywhere", "all", "self", "*"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("unknown alias '{0}'")]
    UnknownAlias(String),
    #[error("unknown service '{0}'")]
    UnknownService(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AliasError {
    #[error("'{alias}' conflicts with existing binding {existing_alias} -> {existing_address}")]
    Conflict {
        alias: String,
        existing_alias: String,
        existing_address: Ipv4Addr,
    },
    #[error("invalid name '{0}'")]
    InvalidAlias(String),
    #[error("name '{0}' is already used by a group or alias")]
    NameTaken(String),
    #[error("group member '{0}' does not resolve to an address")]
    UnknownMember(String),
    #[error("group '{0}' has no members")]
    EmptyGroup(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AliasEntry {
    pub alias: String,
    pub address: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupEntry {
    pub name: String,
    pub members: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Default)]
pub struct Directory {
    /// lowercase name -> (display name, address)
    aliases: HashMap<String, (String, Ipv4Addr)>,
    by_address: HashMap<Ipv4Addr, String>,
    /// lowercase name -> (display name, sorted members)
    groups: HashMap<String, (String, Vec<Ipv4Addr>)>,
    services: ServiceTable,
}

fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn validate_name(name: &str) -> Result<String, AliasError> {
    let trimmed = name.trim();
    let invalid = trimmed.is_empty()
        || trimmed.len() > MAX_NAME_LEN
        || trimmed.chars().any(|c| c.is_control())
        || RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(trimmed))
        || trimmed.parse::<AddrSpec>().is_ok();
    if invalid {
        return Err(AliasError::InvalidAlias(name.to_string()));
    }
    Ok(trimmed.to_string())
}

impl Directory {
    pub fn new(services: ServiceTable) -> Self {
        Self { services, ..Default::default() }
    }

    /// Build the startup directory; bad entries are logged and skipped
    pub fn from_config(cfg: &KernelConfig) -> Self {
        let mut directory = Self::new(ServiceTable::builtin().with_overrides(&cfg.services));
        for (alias, address) in &cfg.aliases {
            if let Err(e) = directory.register_alias(alias, *address) {
                warn!("[directory] skipping alias '{}': {}", alias, e);
            }
        }
        for (group, members) in &cfg.groups {
            if let Err(e) = directory.register_group(group, members) {
                warn!("[directory] skipping group '{}': {}", group, e);
            }
        }
        info!(
            "[directory] {} aliases, {} groups, {} services",
            directory.aliases.len(),
            directory.groups.len(),
            directory.services.len()
        );
        directory
    }

    pub fn resolve_alias(&self, name: &str) -> Result<Ipv4Addr, ResolutionError> {
        self.aliases
            .get(&key(name))
            .map(|(_, address)| *address)
            .ok_or_else(|| ResolutionError::UnknownAlias(name.trim().to_string()))
    }

    pub fn resolve_service(&self, name: &str) -> Result<ServiceEntry, ResolutionError> {
        self.services
            .get(name)
            .cloned()
            .ok_or_else(|| ResolutionError::UnknownService(name.trim().to_string()))
    }

    /// Display name bound to `address`, if any
    pub fn alias_for(&self, address: Ipv4Addr) -> Option<&str> {
        let k = self.by_address.get(&address)?;
        self.aliases.get(k).map(|(display, _)| display.as_str())
    }

    /// Addresses a device reference stands for: a group, an alias, or a
    /// literal address. Always non-empty and sorted.
    pub fn resolve_target(&self, reference: &str) -> Result<Vec<Ipv4Addr>, ResolutionError> {
        let k = key(reference);
        if let Some((_, members)) = self.groups.get(&k) {
            return Ok(members.clone());
        }
        if let Some((_, address)) = self.aliases.get(&k) {
            return Ok(vec![*address]);
        }
        reference
            .trim()
            .parse::<Ipv4Addr>()
            .map(|ip| vec![ip])
            .map_err(|_| ResolutionError::UnknownAlias(reference.trim().to_string()))
    }

    /// Bind `name` to `address`. Re-registering the identical binding is a no-op.
    pub fn register_alias(&mut self, name: &str, address: Ipv4Addr) -> Result<(), AliasError> {
        let display = validate_name(name)?;
        let k = key(&display);
        if self.groups.contains_key(&k) {
            return Err(AliasError::NameTaken(display));
        }
        if let Some((existing_alias, existing_address)) = self.aliases.get(&k) {
            if *existing_address == address {
                return Ok(());
            }
            return Err(AliasError::Conflict {
                alias: display,
                existing_alias: existing_alias.clone(),
                existing_address: *existing_address,
            });
        }
        if let Some(other) = self.by_address.get(&address) {
            let existing_alias = self.aliases.get(other).map(|(d, _)| d.clone()).unwrap_or_default();
            return Err(AliasError::Conflict { alias: display, existing_alias, existing_address: address });
        }
        self.by_address.insert(address, k.clone());
        self.aliases.insert(k, (display, address));
        Ok(())
    }

    /// Bind `name` to `address`, dropping whatever either side was bound to before
    pub fn replace_alias(&mut self, name: &str, address: Ipv4Addr) -> Result<(), AliasError> {
        let display = validate_name(name)?;
        let k = key(&display);
        if self.groups.contains_key(&k) {
            return Err(AliasError::NameTaken(display));
        }
        self.remove_alias(&display);
        if let Some(other) = self.by_address.remove(&address) {
            self.aliases.remove(&other);
        }
        self.by_address.insert(address, k.clone());
        self.aliases.insert(k, (display, address));
        Ok(())
    }

    pub fn remove_alias(&mut self, name: &str) -> Option<Ipv4Addr> {
        let (_, address) = self.aliases.remove(&key(name))?;
        self.by_address.remove(&address);
        Some(address)
    }

    /// Register a group; members are aliases or literal addresses
    pub fn register_group(&mut self, name: &str, members: &[String]) -> Result<Vec<Ipv4Addr>, AliasError> {
        let display = validate_name(name)?;
        let k = key(&display);
        if self.aliases.contains_key(&k) {
            return Err(AliasError::NameTaken(display));
        }
        let mut resolved = BTreeSet::new();
        for member in members {
            if self.groups.contains_key(&key(member)) {
                return Err(AliasError::UnknownMember(member.clone()));
            }
            let ip = match self.resolve_alias(member) {
                Ok(ip) => ip,
                Err(_) => member
                    .trim()
                    .parse::<Ipv4Addr>()
                    .map_err(|_| AliasError::UnknownMember(member.clone()))?,
            };
            resolved.insert(ip);
        }
        if resolved.is_empty() {
            return Err(AliasError::EmptyGroup(display));
        }
        let members: Vec<Ipv4Addr> = resolved.into_iter().collect();
        self.groups.insert(k, (display, members.clone()));
        Ok(members)
    }

    pub fn remove_group(&mut self, name: &str) -> Option<Vec<Ipv4Addr>> {
        self.groups.remove(&key(name)).map(|(_, members)| members)
    }

    pub fn aliases(&self) -> Vec<AliasEntry> {
        let mut list: Vec<AliasEntry> = self
            .aliases
            .values()
            .map(|(alias, address)| AliasEntry { alias: alias.clone(), address: *address })
            .collect();
        list.sort_by(|a, b| a.address.cmp(&b.address));
        list
    }

    pub fn groups(&self) -> Vec<GroupEntry> {
        let mut list: Vec<GroupEntry> = self
            .groups
            .values()
            .map(|(name, members)| GroupEntry { name: name.clone(), members: members.clone() })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn services(&self) -> &ServiceTable {
        &self.services
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_protocol::Protocol;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn directory() -> Directory {
        let mut d = Directory::new(ServiceTable::builtin());
        d.register_alias("DeviceA", ip("10.0.0.5")).unwrap();
        d.register_alias("DeviceB", ip("10.0.0.6")).unwrap();
        d
    }

    #[test]
    fn test_alias_resolution_case_insensitive() {
        let d = directory();
        assert_eq!(d.resolve_alias("devicea").unwrap(), ip("10.0.0.5"));
        assert_eq!(d.resolve_alias(" DEVICEA ").unwrap(), ip("10.0.0.5"));
        assert_eq!(d.alias_for(ip("10.0.0.6")), Some("DeviceB"));
        assert_eq!(d.resolve_alias("DeviceZ"), Err(ResolutionError::UnknownAlias("DeviceZ".into())));
    }

    #[test]
    fn test_register_conflicts() {
        let mut d = directory();
        // same binding is accepted
        assert!(d.register_alias("devicea", ip("10.0.0.5")).is_ok());

        // name already bound to another address
        let err = d.register_alias("DeviceA", ip("10.0.0.9")).unwrap_err();
        assert!(matches!(err, AliasError::Conflict { ref existing_alias, .. } if existing_alias == "DeviceA"));

        // address already bound to another name
        let err = d.register_alias("Printer", ip("10.0.0.6")).unwrap_err();
        assert!(matches!(err, AliasError::Conflict { ref existing_alias, .. } if existing_alias == "DeviceB"));

        assert_eq!(d.resolve_alias("DeviceA").unwrap(), ip("10.0.0.5"));
        assert!(d.resolve_alias("Printer").is_err());
    }

    #[test]
    fn test_invalid_names() {
        let mut d = directory();
        for bad in ["", "   ", "10.0.0.7", "10.0.0.0/24", "any", "Self", "*", "Anywhere", "x".repeat(65).as_str()] {
            assert!(matches!(d.register_alias(bad, ip("10.0.0.7")), Err(AliasError::InvalidAlias(_))), "{bad:?}");
        }
    }

    #[test]
    fn test_replace_keeps_bijection() {
        let mut d = directory();
        d.replace_alias("DeviceA", ip("10.0.0.6")).unwrap();
        assert_eq!(d.resolve_alias("DeviceA").unwrap(), ip("10.0.0.6"));
        assert!(d.resolve_alias("DeviceB").is_err());
        assert_eq!(d.alias_for(ip("10.0.0.5")), None);
        assert_eq!(d.aliases().len(), 1);
    }

    #[test]
    fn test_remove_alias() {
        let mut d = directory();
        assert_eq!(d.remove_alias("deviceb"), Some(ip("10.0.0.6")));
        assert_eq!(d.remove_alias("deviceb"), None);
        d.register_alias("Printer", ip("10.0.0.6")).unwrap();
    }

    #[test]
    fn test_groups() {
        let mut d = directory();
        let members = d
            .register_group("lab", &["DeviceB".to_string(), "10.0.0.1".to_string(), "devicea".to_string()])
            .unwrap();
        assert_eq!(members, vec![ip("10.0.0.1"), ip("10.0.0.5"), ip("10.0.0.6")]);
        assert_eq!(d.resolve_target("LAB").unwrap(), members);
        assert_eq!(d.resolve_target("DeviceA").unwrap(), vec![ip("10.0.0.5")]);
        assert_eq!(d.resolve_target("192.168.1.2").unwrap(), vec![ip("192.168.1.2")]);
        assert!(d.resolve_target("nowhere").is_err());

        assert!(matches!(d.register_group("DeviceA", &["10.0.0.1".into()]), Err(AliasError::NameTaken(_))));
        assert!(matches!(d.register_alias("Lab", ip("10.0.0.9")), Err(AliasError::NameTaken(_))));
        assert!(matches!(d.register_group("empty", &[]), Err(AliasError::EmptyGroup(_))));
        assert!(matches!(d.register_group("bad", &["ghost".into()]), Err(AliasError::UnknownMember(_))));
    }

    #[test]
    fn test_resolve_service() {
        let d = directory();
        let ssh = d.resolve_service("ssh").unwrap();
        assert_eq!((ssh.port, ssh.protocol), (Some(22), Protocol::Tcp));
        assert_eq!(d.resolve_service("foo"), Err(ResolutionError::UnknownService("foo".into())));
    }

    #[test]
    fn test_from_config_skips_conflicts() {
        let cfg = crate::config::parse_config(
            r#"
aliases:
  DeviceA: 10.0.0.5
  Other: 10.0.0.5
groups:
  lab: [DeviceA]
"#,
        )
        .unwrap();
        let d = Directory::from_config(&cfg);
        assert_eq!(d.alias_count(), 1);
        assert_eq!(d.resolve_target("lab").unwrap(), vec![ip("10.0.0.5")]);
    }
}
