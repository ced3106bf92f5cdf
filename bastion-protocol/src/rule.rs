//! Rule model and canonical command text
//!
//! A `RuleSpec` is the structured form of one packet-filter rule. `render()`
//! is the only producer of command text, and `parse()` accepts exactly what
//! `render()` produces: same token order, single spaces, no aliases.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Program name at the head of every command
pub const PROGRAM: &str = "iptables";

/// Errors raised while parsing command text against the rule grammar
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GrammarError {
    #[error("empty command")]
    Empty,
    #[error("unexpected program '{0}'")]
    BadProgram(String),
    #[error("missing '-A <chain>' operation")]
    MissingOperation,
    #[error("unknown chain '{0}'")]
    UnknownChain(String),
    #[error("unknown verdict '{0}'")]
    UnknownVerdict(String),
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    #[error("--dport requires -p tcp or -p udp")]
    PortWithoutProtocol,
    #[error("unknown or misplaced flag '{0}'")]
    UnknownFlag(String),
    #[error("flag '{0}' is missing its value")]
    MissingValue(&'static str),
    #[error("missing '-j <verdict>'")]
    MissingVerdict,
    #[error("unexpected trailing tokens after verdict: '{0}'")]
    TrailingTokens(String),
    #[error("command text is not in canonical form")]
    NotCanonical,
}

/// Firewall hook point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Chain {
    #[serde(alias = "input")]
    Input,
    #[serde(alias = "output")]
    Output,
    #[serde(alias = "forward")]
    Forward,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
            Chain::Output => "OUTPUT",
            Chain::Forward => "FORWARD",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = GrammarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INPUT" => Ok(Chain::Input),
            "OUTPUT" => Ok(Chain::Output),
            "FORWARD" => Ok(Chain::Forward),
            other => Err(GrammarError::UnknownChain(other.to_string())),
        }
    }
}

/// Disposition applied to matching traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Accept,
    /// Silent discard, no response to the sender
    Drop,
    /// Discard with an ICMP error back to the sender
    Reject,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
            Verdict::Reject => "REJECT",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = GrammarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACCEPT" => Ok(Verdict::Accept),
            "DROP" => Ok(Verdict::Drop),
            "REJECT" => Ok(Verdict::Reject),
            other => Err(GrammarError::UnknownVerdict(other.to_string())),
        }
    }
}

/// Transport protocol matched by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Any,
}

impl Protocol {
    /// Token rendered after `-p`; `Any` renders nothing
    pub fn token(&self) -> Option<&'static str> {
        match self {
            Protocol::Tcp => Some("tcp"),
            Protocol::Udp => Some("udp"),
            Protocol::Icmp => Some("icmp"),
            Protocol::Any => None,
        }
    }

    /// Whether a destination port is meaningful for this protocol
    pub fn carries_port(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }

    fn from_token(token: &str) -> Result<Self, GrammarError> {
        match token {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            other => Err(GrammarError::UnknownProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token().unwrap_or("any"))
    }
}

/// IPv4 host or network in CIDR notation
///
/// Networks must have their host bits cleared so that every value has a
/// single textual form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AddrSpec {
    Host(Ipv4Addr),
    Network { addr: Ipv4Addr, prefix: u8 },
}

impl AddrSpec {
    pub fn network(addr: Ipv4Addr, prefix: u8) -> Result<Self, GrammarError> {
        if prefix > 32 {
            return Err(GrammarError::InvalidAddress(format!("{addr}/{prefix}")));
        }
        if u32::from(addr) & !prefix_mask(prefix) != 0 {
            return Err(GrammarError::InvalidAddress(format!("{addr}/{prefix}")));
        }
        Ok(AddrSpec::Network { addr, prefix })
    }

    /// The single host this spec names, if it is not a network
    pub fn host(&self) -> Option<Ipv4Addr> {
        match self {
            AddrSpec::Host(ip) => Some(*ip),
            AddrSpec::Network { .. } => None,
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        match self {
            AddrSpec::Host(host) => *host == ip,
            AddrSpec::Network { addr, prefix } => {
                let mask = prefix_mask(*prefix);
                u32::from(ip) & mask == u32::from(*addr) & mask
            }
        }
    }
}

fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl fmt::Display for AddrSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrSpec::Host(ip) => write!(f, "{ip}"),
            AddrSpec::Network { addr, prefix } => write!(f, "{addr}/{prefix}"),
        }
    }
}

impl FromStr for AddrSpec {
    type Err = GrammarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GrammarError::InvalidAddress(s.to_string());
        match s.split_once('/') {
            None => s.parse::<Ipv4Addr>().map(AddrSpec::Host).map_err(|_| invalid()),
            Some((addr, prefix)) => {
                let addr = addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
                if prefix.is_empty() || prefix.len() > 2 || !prefix.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                let prefix = prefix.parse::<u8>().map_err(|_| invalid())?;
                AddrSpec::network(addr, prefix)
            }
        }
    }
}

impl TryFrom<String> for AddrSpec {
    type Error = GrammarError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AddrSpec> for String {
    fn from(value: AddrSpec) -> Self {
        value.to_string()
    }
}

/// Structured form of one firewall rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub chain: Chain,
    pub verdict: Verdict,
    pub protocol: Protocol,
    pub src: Option<AddrSpec>,
    pub dst: Option<AddrSpec>,
    pub dport: Option<u16>,
}

impl RuleSpec {
    pub fn new(chain: Chain, verdict: Verdict) -> Self {
        Self {
            chain,
            verdict,
            protocol: Protocol::Any,
            src: None,
            dst: None,
            dport: None,
        }
    }

    pub fn with_source(mut self, src: Option<AddrSpec>) -> Self {
        self.src = src;
        self
    }

    pub fn with_destination(mut self, dst: Option<AddrSpec>) -> Self {
        self.dst = dst;
        self
    }

    /// Set protocol and port; the port is dropped for protocols that carry none
    pub fn with_service(mut self, protocol: Protocol, dport: Option<u16>) -> Self {
        self.protocol = protocol;
        self.dport = if protocol.carries_port() { dport } else { None };
        self
    }

    /// Canonical command text
    pub fn render(&self) -> String {
        let mut parts = Vec::with_capacity(12);
        parts.push(PROGRAM.to_string());
        parts.extend(self.append_args());
        parts.join(" ")
    }

    /// Argument vector appending the rule (program name excluded)
    pub fn append_args(&self) -> Vec<String> {
        self.args_with("-A")
    }

    /// Argument vector checking whether the rule already exists
    pub fn check_args(&self) -> Vec<String> {
        self.args_with("-C")
    }

    fn args_with(&self, operation: &str) -> Vec<String> {
        let mut args = vec![operation.to_string(), self.chain.to_string()];
        if let Some(src) = &self.src {
            args.push("-s".into());
            args.push(src.to_string());
        }
        if let Some(dst) = &self.dst {
            args.push("-d".into());
            args.push(dst.to_string());
        }
        if let Some(token) = self.protocol.token() {
            args.push("-p".into());
            args.push(token.into());
            if let (true, Some(port)) = (self.protocol.carries_port(), self.dport) {
                args.push("--dport".into());
                args.push(port.to_string());
            }
        }
        args.push("-j".into());
        args.push(self.verdict.to_string());
        args
    }

    /// Strict inverse of `render`
    pub fn parse(text: &str) -> Result<Self, GrammarError> {
        if text.is_empty() {
            return Err(GrammarError::Empty);
        }
        let mut tokens = Tokens::new(text);

        match tokens.next() {
            Some(PROGRAM) => {}
            Some(other) => return Err(GrammarError::BadProgram(other.to_string())),
            None => return Err(GrammarError::Empty),
        }
        if tokens.next() != Some("-A") {
            return Err(GrammarError::MissingOperation);
        }
        let chain: Chain = tokens.value("-A")?.parse()?;
        let mut spec = RuleSpec::new(chain, Verdict::Accept);

        if tokens.peek() == Some("-s") {
            tokens.next();
            spec.src = Some(tokens.value("-s")?.parse()?);
        }
        if tokens.peek() == Some("-d") {
            tokens.next();
            spec.dst = Some(tokens.value("-d")?.parse()?);
        }
        if tokens.peek() == Some("-p") {
            tokens.next();
            spec.protocol = Protocol::from_token(tokens.value("-p")?)?;
        }
        if tokens.peek() == Some("--dport") {
            tokens.next();
            if !spec.protocol.carries_port() {
                return Err(GrammarError::PortWithoutProtocol);
            }
            spec.dport = Some(parse_port(tokens.value("--dport")?)?);
        }
        match tokens.next() {
            Some("-j") => {}
            Some(other) => return Err(GrammarError::UnknownFlag(other.to_string())),
            None => return Err(GrammarError::MissingVerdict),
        }
        spec.verdict = tokens.value("-j")?.parse()?;

        let rest = tokens.rest();
        if !rest.is_empty() {
            return Err(GrammarError::TrailingTokens(rest.join(" ")));
        }
        if spec.render() != text {
            return Err(GrammarError::NotCanonical);
        }
        Ok(spec)
    }
}

fn parse_port(token: &str) -> Result<u16, GrammarError> {
    let invalid = || GrammarError::InvalidPort(token.to_string());
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let port = token.parse::<u16>().map_err(|_| invalid())?;
    if port == 0 || port.to_string() != token {
        return Err(invalid());
    }
    Ok(port)
}

struct Tokens<'a> {
    tokens: Vec<&'a str>,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            tokens: text.split(' ').collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<&'a str> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Value following `flag`; a value that looks like a flag counts as missing
    fn value(&mut self, flag: &'static str) -> Result<&'a str, GrammarError> {
        match self.next() {
            Some(v) if !v.is_empty() && !v.starts_with('-') => Ok(v),
            _ => Err(GrammarError::MissingValue(flag)),
        }
    }

    fn rest(&self) -> &[&'a str] {
        &self.tokens[self.pos.min(self.tokens.len())..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh_reject() -> RuleSpec {
        RuleSpec::new(Chain::Input, Verdict::Reject)
            .with_source(Some(AddrSpec::Host(Ipv4Addr::new(192, 168, 1, 100))))
            .with_service(Protocol::Tcp, Some(22))
    }

    #[test]
    fn test_render_full_rule() {
        assert_eq!(
            ssh_reject().render(),
            "iptables -A INPUT -s 192.168.1.100 -p tcp --dport 22 -j REJECT"
        );
    }

    #[test]
    fn test_render_minimal_rule() {
        let spec = RuleSpec::new(Chain::Output, Verdict::Accept)
            .with_destination(Some("10.0.0.0/8".parse().unwrap()));
        assert_eq!(spec.render(), "iptables -A OUTPUT -d 10.0.0.0/8 -j ACCEPT");
    }

    #[test]
    fn test_parse_accepts_rendered_text() {
        let spec = ssh_reject();
        assert_eq!(RuleSpec::parse(&spec.render()).unwrap(), spec);
    }

    #[test]
    fn test_port_dropped_for_icmp() {
        let spec = RuleSpec::new(Chain::Input, Verdict::Drop).with_service(Protocol::Icmp, Some(8));
        assert_eq!(spec.dport, None);
        assert_eq!(spec.render(), "iptables -A INPUT -p icmp -j DROP");
    }

    #[test]
    fn test_check_args_mirror_append_args() {
        let spec = ssh_reject();
        let mut check = spec.check_args();
        let mut append = spec.append_args();
        assert_eq!(check.remove(0), "-C");
        assert_eq!(append.remove(0), "-A");
        assert_eq!(check, append);
    }

    #[test]
    fn test_parse_rejects_reordered_flags() {
        let err = RuleSpec::parse("iptables -A INPUT -p tcp -s 10.0.0.1 -j DROP").unwrap_err();
        assert_eq!(err, GrammarError::UnknownFlag("-s".into()));
    }

    #[test]
    fn test_parse_rejects_bad_tokens() {
        assert_eq!(
            RuleSpec::parse("ip6tables -A INPUT -j DROP").unwrap_err(),
            GrammarError::BadProgram("ip6tables".into())
        );
        assert_eq!(
            RuleSpec::parse("iptables -I INPUT -j DROP").unwrap_err(),
            GrammarError::MissingOperation
        );
        assert_eq!(
            RuleSpec::parse("iptables -A PREROUTING -j DROP").unwrap_err(),
            GrammarError::UnknownChain("PREROUTING".into())
        );
        assert_eq!(
            RuleSpec::parse("iptables -A INPUT -j LOG").unwrap_err(),
            GrammarError::UnknownVerdict("LOG".into())
        );
        assert_eq!(
            RuleSpec::parse("iptables -A INPUT -p icmp --dport 8 -j DROP").unwrap_err(),
            GrammarError::PortWithoutProtocol
        );
        assert_eq!(
            RuleSpec::parse("iptables -A INPUT -p tcp --dport 0 -j DROP").unwrap_err(),
            GrammarError::InvalidPort("0".into())
        );
        assert_eq!(
            RuleSpec::parse("iptables -A INPUT -p tcp --dport 022 -j DROP").unwrap_err(),
            GrammarError::InvalidPort("022".into())
        );
        assert_eq!(
            RuleSpec::parse("iptables -A INPUT -j DROP -j ACCEPT").unwrap_err(),
            GrammarError::TrailingTokens("-j ACCEPT".into())
        );
    }

    #[test]
    fn test_parse_rejects_extra_whitespace() {
        assert!(RuleSpec::parse("iptables  -A INPUT -j DROP").is_err());
        assert!(RuleSpec::parse("iptables -A INPUT -j DROP ").is_err());
    }

    #[test]
    fn test_addr_spec_parsing() {
        assert_eq!(
            "10.1.2.3".parse::<AddrSpec>().unwrap(),
            AddrSpec::Host(Ipv4Addr::new(10, 1, 2, 3))
        );
        assert!("192.168.0.0/16".parse::<AddrSpec>().is_ok());
        assert!("192.168.0.1/16".parse::<AddrSpec>().is_err());
        assert!("10.0.0.0/33".parse::<AddrSpec>().is_err());
        assert!("10.0.0.0/+8".parse::<AddrSpec>().is_err());
        assert!("fe80::1".parse::<AddrSpec>().is_err());
        assert!("devicea".parse::<AddrSpec>().is_err());
    }

    #[test]
    fn test_addr_spec_contains() {
        let net: AddrSpec = "10.0.0.0/24".parse().unwrap();
        assert!(net.contains(Ipv4Addr::new(10, 0, 0, 77)));
        assert!(!net.contains(Ipv4Addr::new(10, 0, 1, 1)));
        assert_eq!(net.host(), None);
    }

    #[test]
    fn test_addr_spec_serde_as_string() {
        let net: AddrSpec = "172.16.0.0/12".parse().unwrap();
        let json = serde_json::to_string(&net).unwrap();
        assert_eq!(json, "\"172.16.0.0/12\"");
        let back: AddrSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, net);
    }
}
