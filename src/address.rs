//! Address classification and allow-list targets.
//!
//! Every component that needs to know whether an address is "local" calls
//! [`is_local_address`] itself.  The answer depends on the address alone, so
//! a flag received from a peer is only ever a hint.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// Private and reserved blocks exempt from masquerade and forwarding.
const LOCAL_BLOCKS: [(Ipv4Addr, u8); 6] = [
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
];

/// Ranges every agent accepts before the catch-all deny goes in.
pub const RESERVED_RANGES: [&str; 7] = [
    "127.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "100.64.0.0/10",
    "169.254.0.0/16",
    "255.255.255.255/32",
];

/// Returns true when `address` (a bare IPv4 address or a CIDR block) lies in
/// a private or reserved range.  Anything unparseable is non-local.
pub fn is_local_address(address: &str) -> bool {
    let host = address.split('/').next().unwrap_or(address).trim();
    match host.parse::<Ipv4Addr>() {
        Ok(ip) => LOCAL_BLOCKS
            .iter()
            .any(|(network, prefix)| in_block(*network, *prefix, ip)),
        Err(_) => false,
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn in_block(network: Ipv4Addr, prefix: u8, ip: Ipv4Addr) -> bool {
    let mask = mask(prefix);
    u32::from(ip) & mask == u32::from(network) & mask
}

/// An IPv4 network in CIDR notation, normalized to its network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        in_block(self.network, self.prefix, ip)
    }
}

impl FromStr for Cidr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressError::InvalidCidr(s.to_string());
        let (ip, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let ip: Ipv4Addr = ip.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 32 {
            return Err(invalid());
        }
        let network = Ipv4Addr::from(u32::from(ip) & mask(prefix));
        Ok(Self { network, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Where a registry entry came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Address,
    Cidr,
    Domain { name: String },
}

impl Origin {
    pub fn domain(&self) -> Option<&str> {
        match self {
            Origin::Domain { name } => Some(name),
            _ => None,
        }
    }
}

/// A submission target, classified once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Address(Ipv4Addr),
    Cidr(Cidr),
    DomainDerived {
        domain: String,
        addresses: Vec<Ipv4Addr>,
    },
}

impl Target {
    /// Interprets `input` as an address or CIDR literal.  Returns `Ok(None)`
    /// when the input is a syntactically valid domain name that still needs
    /// resolving.
    pub fn from_literal(input: &str) -> Result<Option<Self>, AddressError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AddressError::Empty);
        }
        if input.contains('/') {
            return input.parse().map(|cidr| Some(Target::Cidr(cidr)));
        }
        match input.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => return Ok(Some(Target::Address(ip))),
            Ok(IpAddr::V6(_)) => return Err(AddressError::Ipv6(input.to_string())),
            Err(_) => {}
        }
        if looks_numeric(input) {
            return Err(AddressError::InvalidIpv4(input.to_string()));
        }
        if !is_domain_name(input) {
            return Err(AddressError::InvalidDomain(input.to_string()));
        }
        Ok(None)
    }

    /// The registry keys this target expands to.
    pub fn addresses(&self) -> Vec<String> {
        match self {
            Target::Address(ip) => vec![ip.to_string()],
            Target::Cidr(cidr) => vec![cidr.to_string()],
            Target::DomainDerived { addresses, .. } => {
                addresses.iter().map(ToString::to_string).collect()
            }
        }
    }

    pub fn origin(&self) -> Origin {
        match self {
            Target::Address(_) => Origin::Address,
            Target::Cidr(_) => Origin::Cidr,
            Target::DomainDerived { domain, .. } => Origin::Domain {
                name: domain.clone(),
            },
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Address(ip) => write!(f, "{}", ip),
            Target::Cidr(cidr) => write!(f, "{}", cidr),
            Target::DomainDerived { domain, .. } => write!(f, "{}", domain),
        }
    }
}

fn looks_numeric(input: &str) -> bool {
    input.chars().all(|c| c.is_ascii_digit() || c == '.')
}

fn is_domain_name(input: &str) -> bool {
    input.len() <= 253
        && input.trim_end_matches('.').split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_and_shared_ranges_are_local() {
        for addr in ["10.1.2.3", "192.168.0.1", "172.20.1.1", "100.70.0.1"] {
            assert!(is_local_address(addr), "{} should be local", addr);
        }
        assert!(is_local_address("127.0.0.1"));
        assert!(is_local_address("169.254.10.10"));
    }

    #[test]
    fn public_addresses_are_not_local() {
        assert!(!is_local_address("8.8.8.8"));
        // just past 172.16.0.0/12
        assert!(!is_local_address("172.32.1.1"));
        assert!(!is_local_address("100.128.0.1"));
        assert!(!is_local_address("not-an-ip"));
        assert!(!is_local_address(""));
    }

    #[test]
    fn cidr_is_classified_by_its_network_address() {
        assert!(is_local_address("10.0.0.0/8"));
        assert!(!is_local_address("8.8.0.0/16"));
    }

    #[test]
    fn cidr_parsing_normalizes_host_bits() {
        let cidr: Cidr = "10.1.2.3/8".parse().unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.0/8");
        assert!(cidr.contains(Ipv4Addr::new(10, 200, 0, 1)));
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("10.0.0/8".parse::<Cidr>().is_err());
    }

    #[test]
    fn literals_are_tagged_once() {
        assert_eq!(
            Target::from_literal("8.8.8.8").unwrap(),
            Some(Target::Address(Ipv4Addr::new(8, 8, 8, 8)))
        );
        assert!(matches!(
            Target::from_literal("1.2.3.0/24").unwrap(),
            Some(Target::Cidr(_))
        ));
        assert_eq!(Target::from_literal("example.com").unwrap(), None);
        assert_eq!(
            Target::from_literal("::1"),
            Err(AddressError::Ipv6("::1".into()))
        );
        assert_eq!(
            Target::from_literal("300.1.1.1"),
            Err(AddressError::InvalidIpv4("300.1.1.1".into()))
        );
        assert_eq!(Target::from_literal("  "), Err(AddressError::Empty));
        assert!(Target::from_literal("bad domain!").is_err());
    }

    #[test]
    fn domain_target_expands_to_every_address() {
        let target = Target::DomainDerived {
            domain: "example.com".into(),
            addresses: vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2)],
        };
        assert_eq!(target.addresses(), vec!["1.1.1.1", "2.2.2.2"]);
        assert_eq!(target.origin().domain(), Some("example.com"));
    }
}
