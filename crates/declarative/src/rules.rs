//! Security group rules
//!
//! Rules are stored in a security group's `ingress` / `egress` properties as
//! maps so that peer-group sources are ordinary references (and therefore
//! ordinary dependency edges). This module converts between the two forms
//! and validates each rule.

use crate::resource::{Resource, props};
use crate::value::{Reference, Value};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    fn key(self) -> &'static str {
        match self {
            Self::Ingress => props::INGRESS,
            Self::Egress => props::EGRESS,
        }
    }

    fn peer_group_key(self) -> &'static str {
        match self {
            Self::Ingress => props::SOURCE_GROUP,
            Self::Egress => props::DESTINATION_GROUP,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    All,
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Self::All => "-1",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRange {
    All,
    Range { from: u16, to: u16 },
}

/// The other side of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    Cidr(String),
    Group(Reference),
}

/// Errors in a single declared rule
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule is not a map")]
    NotAMap,

    #[error("rule specifies neither a CIDR nor a peer security group")]
    MissingPeer,

    #[error("rule specifies both a CIDR and a peer security group")]
    ConflictingPeer,

    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("peer group must be a reference to a security group id")]
    PeerNotAReference,

    #[error("peer {0} is not a security group")]
    PeerNotSecurityGroup(String),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("invalid port range: {0}")]
    InvalidPorts(String),
}

/// A single ingress or egress rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityRule {
    pub direction: Direction,
    pub protocol: Protocol,
    pub ports: PortRange,
    pub peer: Peer,
}

impl SecurityRule {
    /// TCP rule on a single port
    pub fn tcp(direction: Direction, port: u16, peer: Peer) -> Self {
        Self {
            direction,
            protocol: Protocol::Tcp,
            ports: PortRange::Range {
                from: port,
                to: port,
            },
            peer,
        }
    }

    /// All protocols, all ports
    pub fn all(direction: Direction, peer: Peer) -> Self {
        Self {
            direction,
            protocol: Protocol::All,
            ports: PortRange::All,
            peer,
        }
    }

    /// Whether the peer is the whole internet
    pub fn is_open_to_world(&self) -> bool {
        matches!(&self.peer, Peer::Cidr(cidr) if cidr == "0.0.0.0/0" || cidr == "::/0")
    }

    pub fn to_value(&self) -> Value {
        let mut entries = vec![(props::IP_PROTOCOL, Value::string(self.protocol.as_str()))];
        if let PortRange::Range { from, to } = self.ports {
            entries.push((props::FROM_PORT, Value::Integer(i64::from(from))));
            entries.push((props::TO_PORT, Value::Integer(i64::from(to))));
        }
        match &self.peer {
            Peer::Cidr(cidr) => entries.push((props::CIDR_IP, Value::string(cidr))),
            Peer::Group(reference) => {
                entries.push((self.direction.peer_group_key(), Value::Ref(reference.clone())));
            }
        }
        Value::map(entries)
    }

    pub fn from_value(direction: Direction, value: &Value) -> Result<Self, RuleError> {
        let map = value.as_map().ok_or(RuleError::NotAMap)?;

        let protocol = match map.get(props::IP_PROTOCOL) {
            None => Protocol::All,
            Some(Value::Integer(-1)) => Protocol::All,
            Some(Value::String(s)) => match s.to_lowercase().as_str() {
                "-1" | "all" => Protocol::All,
                "tcp" => Protocol::Tcp,
                "udp" => Protocol::Udp,
                "icmp" => Protocol::Icmp,
                other => return Err(RuleError::InvalidProtocol(other.to_string())),
            },
            Some(other) => return Err(RuleError::InvalidProtocol(other.to_string())),
        };

        let ports = match (map.get(props::FROM_PORT), map.get(props::TO_PORT)) {
            (None, None) => PortRange::All,
            (Some(from), Some(to)) => {
                let from = parse_port(from)?;
                let to = parse_port(to)?;
                if from > to {
                    return Err(RuleError::InvalidPorts(format!("{from} > {to}")));
                }
                PortRange::Range { from, to }
            }
            _ => {
                return Err(RuleError::InvalidPorts(
                    "from_port and to_port must be set together".to_string(),
                ));
            }
        };

        let cidr = map.get(props::CIDR_IP);
        let group = map.get(direction.peer_group_key());
        let peer = match (cidr, group) {
            (None, None) => return Err(RuleError::MissingPeer),
            (Some(_), Some(_)) => return Err(RuleError::ConflictingPeer),
            (Some(cidr), None) => {
                let cidr = cidr
                    .as_str()
                    .ok_or_else(|| RuleError::InvalidCidr(cidr.to_string()))?;
                if !is_valid_cidr(cidr) {
                    return Err(RuleError::InvalidCidr(cidr.to_string()));
                }
                Peer::Cidr(cidr.to_string())
            }
            (None, Some(group)) => {
                let reference = group.as_reference().ok_or(RuleError::PeerNotAReference)?;
                if !reference.attribute.is_structural() {
                    return Err(RuleError::PeerNotAReference);
                }
                Peer::Group(reference.clone())
            }
        };

        Ok(Self {
            direction,
            protocol,
            ports,
            peer,
        })
    }
}

fn parse_port(value: &Value) -> Result<u16, RuleError> {
    value
        .as_integer()
        .and_then(|i| u16::try_from(i).ok())
        .ok_or_else(|| RuleError::InvalidPorts(value.to_string()))
}

/// Validate `a.b.c.d/n` or an IPv6 prefix
pub fn is_valid_cidr(cidr: &str) -> bool {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(address) = IpAddr::from_str(addr) else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    let max = match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    prefix <= max
}

/// Parse every declared rule of a security group, keeping per-rule errors
pub fn security_rules(resource: &Resource) -> Vec<(Direction, usize, Result<SecurityRule, RuleError>)> {
    let mut out = Vec::new();
    for direction in [Direction::Ingress, Direction::Egress] {
        let Some(value) = resource.property(direction.key()) else {
            continue;
        };
        match value.as_list() {
            Some(items) => {
                for (index, item) in items.iter().enumerate() {
                    out.push((direction, index, SecurityRule::from_value(direction, item)));
                }
            }
            None => out.push((direction, 0, Err(RuleError::NotAMap))),
        }
    }
    out
}

/// Rules that parsed cleanly, in one direction
pub fn valid_rules(resource: &Resource, direction: Direction) -> Vec<SecurityRule> {
    security_rules(resource)
        .into_iter()
        .filter(|(d, _, _)| *d == direction)
        .filter_map(|(_, _, rule)| rule.ok())
        .collect()
}

/// Build the `ingress` / `egress` list values for a set of rules
pub fn rules_value(rules: &[SecurityRule]) -> Value {
    Value::list(rules.iter().map(SecurityRule::to_value))
}
