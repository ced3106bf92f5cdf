/**
 * POLICY COMPILER - Structured intent to firewall rule commands
 *
 * ROLE:
 * Turns one StructuredIntent into the exact command texts that will be sent
 * to the target devices, or a typed reason why it cannot.
 *
 * OPERATION:
 * - Pure function of (intent, fallback target, directory snapshot)
 * - Every intent field is untrusted and validated here
 * - Each command is built as a RuleSpec first; the text is rendered from it,
 *   so preview and wire payload are the same bytes
 * - Groups expand to one command per member, ascending by address
 *
 * CHAIN SELECTION (per target device):
 * 1. explicit chain hint
 * 2. source is exactly the target host -> OUTPUT
 * 3. source and destination both given, target is neither -> FORWARD
 * 4. INPUT
 */

use crate::directory::Directory;
use crate::services::ServiceTable;
use bastion_protocol::{AddrSpec, Chain, Protocol, RuleSpec, Verdict};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Words meaning "no address filter"
const ANY_ADDRESS: &[&str] = &["any", "anywhere", "all", "*"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[serde(alias = "permit", alias = "accept")]
    Allow,
    #[serde(alias = "reject")]
    Deny,
    #[serde(alias = "drop")]
    Block,
}

impl Action {
    /// deny answers the sender (REJECT), block stays silent (DROP)
    pub fn verdict(self) -> Verdict {
        match self {
            Action::Allow => Verdict::Accept,
            Action::Deny => Verdict::Reject,
            Action::Block => Verdict::Drop,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredIntent {
    pub action: Action,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub chain_hint: Option<Chain>,
}

impl StructuredIntent {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            service: None,
            source: None,
            destination: None,
            target: None,
            chain_hint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("intent names no target device and no fallback device was selected")]
    NoTarget,
    #[error("target '{0}' is neither a group, an alias nor an IPv4 address")]
    UnresolvedTarget(String),
    #[error("source '{0}' is neither an alias nor an address or network")]
    UnresolvedSource(String),
    #[error("destination '{0}' is neither an alias nor an address or network")]
    UnresolvedDestination(String),
    #[error("unknown service '{0}'")]
    UnknownService(String),
}

impl CompileError {
    /// Stable machine-readable kind for API responses
    pub fn kind(&self) -> &'static str {
        match self {
            CompileError::NoTarget => "no_target",
            CompileError::UnresolvedTarget(_) => "unresolved_target",
            CompileError::UnresolvedSource(_) => "unresolved_source",
            CompileError::UnresolvedDestination(_) => "unresolved_destination",
            CompileError::UnknownService(_) => "unknown_service",
        }
    }
}

/// One rule bound to the device it must be applied on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledCommand {
    target_device: Ipv4Addr,
    rule: RuleSpec,
    raw_text: String,
}

impl CompiledCommand {
    pub fn new(target_device: Ipv4Addr, rule: RuleSpec) -> Self {
        let raw_text = rule.render();
        Self { target_device, rule, raw_text }
    }

    pub fn target_device(&self) -> Ipv4Addr {
        self.target_device
    }

    pub fn rule(&self) -> &RuleSpec {
        &self.rule
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn chain(&self) -> Chain {
        self.rule.chain
    }

    pub fn verdict(&self) -> Verdict {
        self.rule.verdict
    }

    pub fn protocol(&self) -> Protocol {
        self.rule.protocol
    }

    pub fn src(&self) -> Option<AddrSpec> {
        self.rule.src
    }

    pub fn dst(&self) -> Option<AddrSpec> {
        self.rule.dst
    }

    pub fn dport(&self) -> Option<u16> {
        self.rule.dport
    }
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn resolve_targets(
    intent: &StructuredIntent,
    fallback_target: Option<&str>,
    directory: &Directory,
) -> Result<Vec<Ipv4Addr>, CompileError> {
    let explicit = present(&intent.target).filter(|t| !t.eq_ignore_ascii_case("self"));
    let fallback = fallback_target.map(str::trim).filter(|t| !t.is_empty());
    let reference = explicit.or(fallback).ok_or(CompileError::NoTarget)?;
    directory
        .resolve_target(reference)
        .map_err(|_| CompileError::UnresolvedTarget(reference.to_string()))
}

/// `Ok(None)` means no filter on this side of the rule
fn resolve_endpoint(field: &Option<String>, directory: &Directory) -> Result<Option<AddrSpec>, String> {
    let Some(name) = present(field) else { return Ok(None) };
    if ANY_ADDRESS.iter().any(|w| w.eq_ignore_ascii_case(name)) {
        return Ok(None);
    }
    if let Ok(ip) = directory.resolve_alias(name) {
        return Ok(Some(AddrSpec::Host(ip)));
    }
    name.parse::<AddrSpec>().map(Some).map_err(|_| name.to_string())
}

fn resolve_service(
    intent: &StructuredIntent,
    directory: &Directory,
) -> Result<(Protocol, Option<u16>), CompileError> {
    let Some(name) = present(&intent.service) else { return Ok((Protocol::Any, None)) };
    if ServiceTable::is_wildcard(name) {
        return Ok((Protocol::Any, None));
    }
    let entry = directory
        .resolve_service(name)
        .map_err(|_| CompileError::UnknownService(name.to_string()))?;
    Ok((entry.protocol, entry.port))
}

pub fn choose_chain(
    hint: Option<Chain>,
    target: Ipv4Addr,
    src: Option<AddrSpec>,
    dst: Option<AddrSpec>,
) -> Chain {
    if let Some(chain) = hint {
        return chain;
    }
    if src.and_then(|s| s.host()) == Some(target) {
        return Chain::Output;
    }
    if let (Some(src), Some(dst)) = (src, dst) {
        if !src.contains(target) && !dst.contains(target) {
            return Chain::Forward;
        }
    }
    Chain::Input
}

pub fn compile(
    intent: &StructuredIntent,
    fallback_target: Option<&str>,
    directory: &Directory,
) -> Result<Vec<CompiledCommand>, CompileError> {
    let verdict = intent.action.verdict();
    let targets = resolve_targets(intent, fallback_target, directory)?;
    let src = resolve_endpoint(&intent.source, directory).map_err(CompileError::UnresolvedSource)?;
    let dst = resolve_endpoint(&intent.destination, directory).map_err(CompileError::UnresolvedDestination)?;
    let (protocol, dport) = resolve_service(intent, directory)?;

    let commands = targets
        .into_iter()
        .map(|target| {
            let chain = choose_chain(intent.chain_hint, target, src, dst);
            let rule = RuleSpec::new(chain, verdict)
                .with_source(src)
                .with_destination(dst)
                .with_service(protocol, dport);
            CompiledCommand::new(target, rule)
        })
        .collect();
    Ok(commands)
}

/// Human-readable listing, one command per line
pub fn preview(commands: &[CompiledCommand], directory: &Directory) -> String {
    commands
        .iter()
        .map(|cmd| {
            let target = cmd.target_device();
            match directory.alias_for(target) {
                Some(alias) => format!("{} ({})  {}", target, alias, cmd.raw_text()),
                None => format!("{}  {}", target, cmd.raw_text()),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn directory() -> Directory {
        let mut d = Directory::new(ServiceTable::builtin());
        d.register_alias("DeviceA", ip("10.0.0.5")).unwrap();
        d.register_alias("DeviceB", ip("10.0.0.6")).unwrap();
        d.register_alias("Laptop", ip("192.168.1.100")).unwrap();
        d.register_group("lab", &["DeviceB".into(), "DeviceA".into()]).unwrap();
        d
    }

    fn intent(action: Action) -> StructuredIntent {
        StructuredIntent::new(action)
    }

    #[test]
    fn test_deny_ssh_from_host_to_device() {
        let mut i = intent(Action::Deny);
        i.service = Some("ssh".into());
        i.source = Some("192.168.1.100".into());
        i.target = Some("DeviceA".into());

        let commands = compile(&i, None, &directory()).unwrap();
        assert_eq!(commands.len(), 1);
        let cmd = &commands[0];
        assert_eq!(cmd.target_device(), ip("10.0.0.5"));
        assert_eq!(cmd.chain(), Chain::Input);
        assert_eq!(cmd.verdict(), Verdict::Reject);
        assert_eq!(cmd.protocol(), Protocol::Tcp);
        assert_eq!(cmd.dport(), Some(22));
        assert_eq!(cmd.src(), Some(AddrSpec::Host(ip("192.168.1.100"))));
        assert_eq!(cmd.dst(), None);
        assert_eq!(cmd.raw_text(), "iptables -A INPUT -s 192.168.1.100 -p tcp --dport 22 -j REJECT");
    }

    #[test]
    fn test_unknown_service_compiles_nothing() {
        let mut i = intent(Action::Allow);
        i.service = Some("foo".into());
        i.target = Some("DeviceA".into());
        assert_eq!(compile(&i, None, &directory()), Err(CompileError::UnknownService("foo".into())));
    }

    #[test]
    fn test_block_and_deny_stay_distinct() {
        let d = directory();
        let mut i = intent(Action::Block);
        i.target = Some("DeviceA".into());
        assert_eq!(compile(&i, None, &d).unwrap()[0].verdict(), Verdict::Drop);
        i.action = Action::Deny;
        assert_eq!(compile(&i, None, &d).unwrap()[0].verdict(), Verdict::Reject);
        i.action = Action::Allow;
        assert_eq!(compile(&i, None, &d).unwrap()[0].verdict(), Verdict::Accept);
    }

    #[test]
    fn test_action_synonyms() {
        let parsed: StructuredIntent = serde_json::from_str(r#"{"action":"drop","target":"DeviceA"}"#).unwrap();
        assert_eq!(parsed.action, Action::Block);
        let parsed: StructuredIntent = serde_json::from_str(r#"{"action":"permit"}"#).unwrap();
        assert_eq!(parsed.action, Action::Allow);
        let parsed: StructuredIntent = serde_json::from_str(r#"{"action":"reject"}"#).unwrap();
        assert_eq!(parsed.action, Action::Deny);
        assert!(serde_json::from_str::<StructuredIntent>(r#"{"action":"maybe"}"#).is_err());
    }

    #[test]
    fn test_target_resolution() {
        let d = directory();
        let mut i = intent(Action::Block);
        assert_eq!(compile(&i, None, &d), Err(CompileError::NoTarget));
        assert_eq!(compile(&i, Some("  "), &d), Err(CompileError::NoTarget));

        // fallback used when the intent names no target, or names itself
        assert_eq!(compile(&i, Some("DeviceB"), &d).unwrap()[0].target_device(), ip("10.0.0.6"));
        i.target = Some("self".into());
        assert_eq!(compile(&i, Some("DeviceB"), &d).unwrap()[0].target_device(), ip("10.0.0.6"));

        // explicit target beats fallback, literal address needs no alias
        i.target = Some("172.16.0.9".into());
        assert_eq!(compile(&i, Some("DeviceB"), &d).unwrap()[0].target_device(), ip("172.16.0.9"));

        i.target = Some("ghost".into());
        assert_eq!(compile(&i, None, &d), Err(CompileError::UnresolvedTarget("ghost".into())));
    }

    #[test]
    fn test_source_resolution() {
        let d = directory();
        let mut i = intent(Action::Block);
        i.target = Some("DeviceA".into());

        i.source = Some("any".into());
        assert_eq!(compile(&i, None, &d).unwrap()[0].src(), None);

        i.source = Some("laptop".into());
        assert_eq!(compile(&i, None, &d).unwrap()[0].src(), Some(AddrSpec::Host(ip("192.168.1.100"))));

        i.source = Some("10.1.0.0/16".into());
        let cmd = &compile(&i, None, &d).unwrap()[0];
        assert_eq!(cmd.raw_text(), "iptables -A INPUT -s 10.1.0.0/16 -j DROP");

        i.source = Some("10.1.0.1/16".into());
        assert_eq!(compile(&i, None, &d), Err(CompileError::UnresolvedSource("10.1.0.1/16".into())));

        i.source = Some("kitchen".into());
        assert_eq!(compile(&i, None, &d), Err(CompileError::UnresolvedSource("kitchen".into())));

        i.source = None;
        i.destination = Some("nowhere".into());
        assert_eq!(compile(&i, None, &d), Err(CompileError::UnresolvedDestination("nowhere".into())));
    }

    #[test]
    fn test_icmp_and_wildcard_services_emit_no_port() {
        let d = directory();
        let mut i = intent(Action::Block);
        i.target = Some("DeviceA".into());
        i.service = Some("ping".into());
        let cmd = &compile(&i, None, &d).unwrap()[0];
        assert_eq!(cmd.protocol(), Protocol::Icmp);
        assert_eq!(cmd.dport(), None);
        assert_eq!(cmd.raw_text(), "iptables -A INPUT -p icmp -j DROP");

        i.service = Some("traffic".into());
        let cmd = &compile(&i, None, &d).unwrap()[0];
        assert_eq!(cmd.protocol(), Protocol::Any);
        assert_eq!(cmd.raw_text(), "iptables -A INPUT -j DROP");
    }

    #[test]
    fn test_chain_selection() {
        let target = ip("10.0.0.5");
        let host = |s: &str| Some(AddrSpec::Host(ip(s)));

        // hint always wins
        assert_eq!(choose_chain(Some(Chain::Forward), target, host("10.0.0.5"), None), Chain::Forward);
        // traffic originating at the target itself
        assert_eq!(choose_chain(None, target, host("10.0.0.5"), host("8.8.8.8")), Chain::Output);
        // target routes between two other parties
        assert_eq!(choose_chain(None, target, host("192.168.1.2"), host("8.8.8.8")), Chain::Forward);
        // destination network includes the target: inbound
        let lan: AddrSpec = "10.0.0.0/24".parse().unwrap();
        assert_eq!(choose_chain(None, target, host("192.168.1.2"), Some(lan)), Chain::Input);
        // default
        assert_eq!(choose_chain(None, target, host("192.168.1.2"), None), Chain::Input);
        assert_eq!(choose_chain(None, target, None, None), Chain::Input);
    }

    #[test]
    fn test_outbound_intent_compiles_to_output() {
        let d = directory();
        let mut i = intent(Action::Block);
        i.source = Some("DeviceA".into());
        i.destination = Some("8.8.8.8".into());
        i.service = Some("dns".into());
        i.target = Some("DeviceA".into());
        let cmd = &compile(&i, None, &d).unwrap()[0];
        assert_eq!(cmd.raw_text(), "iptables -A OUTPUT -s 10.0.0.5 -d 8.8.8.8 -p udp --dport 53 -j DROP");
    }

    #[test]
    fn test_group_expands_in_address_order() {
        let d = directory();
        let mut i = intent(Action::Deny);
        i.service = Some("telnet".into());
        i.target = Some("LAB".into());
        let commands = compile(&i, None, &d).unwrap();
        let targets: Vec<Ipv4Addr> = commands.iter().map(|c| c.target_device()).collect();
        assert_eq!(targets, vec![ip("10.0.0.5"), ip("10.0.0.6")]);
        assert!(commands.iter().all(|c| c.raw_text() == "iptables -A INPUT -p tcp --dport 23 -j REJECT"));
    }

    #[test]
    fn test_compile_is_deterministic_and_round_trips() {
        let d = directory();
        let mut i = intent(Action::Allow);
        i.service = Some("https".into());
        i.source = Some("192.168.0.0/16".into());
        i.target = Some("lab".into());
        let first = compile(&i, None, &d).unwrap();
        let second = compile(&i, None, &d).unwrap();
        assert_eq!(first, second);
        for cmd in &first {
            assert_eq!(&RuleSpec::parse(cmd.raw_text()).unwrap(), cmd.rule());
        }
    }

    #[test]
    fn test_preview_lists_alias() {
        let d = directory();
        let mut i = intent(Action::Block);
        i.target = Some("DeviceA".into());
        let commands = compile(&i, None, &d).unwrap();
        assert_eq!(preview(&commands, &d), "10.0.0.5 (DeviceA)  iptables -A INPUT -j DROP");

        i.target = Some("172.16.0.9".into());
        let commands = compile(&i, None, &d).unwrap();
        assert_eq!(preview(&commands, &d), "172.16.0.9  iptables -A INPUT -j DROP");
    }
}
