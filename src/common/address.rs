//! Host and address-family types, plus name resolution

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use async_trait::async_trait;
use tracing::trace;

use crate::error::{Error, Result};

/// Address family restriction carried by the URL scheme (`tcp4`, `tcp6`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    /// Family implied by a scheme name such as `tls+tcp4`
    pub fn from_scheme(scheme: &str) -> Self {
        if scheme.ends_with('4') {
            Family::V4
        } else if scheme.ends_with('6') {
            Family::V6
        } else {
            Family::Any
        }
    }

    pub fn admits(&self, ip: &IpAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => ip.is_ipv4(),
            Family::V6 => ip.is_ipv6(),
        }
    }

    /// The "any local address" for this family
    pub fn unspecified(&self) -> IpAddr {
        match self {
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            Family::Any | Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// A host component of a transport URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// `*` or empty: any local address
    Wildcard,
    /// IP literal
    Ip(IpAddr),
    /// DNS name, syntactically validated
    Domain(String),
}

impl Host {
    /// Parse and validate one host. `[v6]` brackets must already be stripped.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() || s == "*" {
            return Ok(Host::Wildcard);
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Host::Ip(ip));
        }
        validate_domain(s)?;
        Ok(Host::Domain(s.to_ascii_lowercase()))
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Host::Wildcard)
    }

    /// Reject literals that contradict the scheme's family
    pub fn check_family(&self, family: Family) -> Result<()> {
        match self {
            Host::Ip(ip) if !family.admits(ip) => Err(Error::AddressInvalid(format!(
                "{} does not match address family {:?}",
                ip, family
            ))),
            _ => Ok(()),
        }
    }

    /// Resolve without touching the network. Domains return `None`.
    pub fn literal(&self, port: u16, family: Family) -> Option<SocketAddr> {
        match self {
            Host::Wildcard => Some(SocketAddr::new(family.unspecified(), port)),
            Host::Ip(ip) => Some(SocketAddr::new(*ip, port)),
            Host::Domain(_) => None,
        }
    }

    /// Blocking resolution, used where the caller is already synchronous
    /// (binding a listener).
    pub fn resolve_blocking(&self, port: u16, family: Family) -> Result<Vec<SocketAddr>> {
        if let Some(addr) = self.literal(port, family) {
            return Ok(vec![addr]);
        }
        let name = self.to_string();
        let addrs = (name.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| Error::AddressInvalid(format!("{}: {}", name, e)))?;
        filter_family(&name, addrs, family)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Wildcard => write!(f, "*"),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
            Host::Ip(ip) => write!(f, "{}", ip),
            Host::Domain(name) => write!(f, "{}", name),
        }
    }
}

/// RFC 1123 host names. A final label made only of digits would make a
/// dotted string like `127.0.0.1.32` look like a name, so it is refused.
fn validate_domain(s: &str) -> Result<()> {
    let invalid = || Error::AddressInvalid(format!("malformed host: {}", s));

    if s.len() > 253 {
        return Err(invalid());
    }
    let labels: Vec<&str> = s.trim_end_matches('.').split('.').collect();
    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid());
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(invalid());
        }
    }
    match labels.last() {
        Some(last) if last.bytes().all(|b| b.is_ascii_digit()) => Err(invalid()),
        Some(_) => Ok(()),
        None => Err(invalid()),
    }
}

fn filter_family(
    name: &str,
    addrs: impl Iterator<Item = SocketAddr>,
    family: Family,
) -> Result<Vec<SocketAddr>> {
    let found: Vec<SocketAddr> = addrs.filter(|a| family.admits(&a.ip())).collect();
    if found.is_empty() {
        return Err(Error::AddressInvalid(format!(
            "{} has no {:?} address",
            name, family
        )));
    }
    trace!("Resolved {} to {:?}", name, found);
    Ok(found)
}

/// Name resolution used by dialers
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &Host, port: u16, family: Family) -> Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo` via tokio)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &Host, port: u16, family: Family) -> Result<Vec<SocketAddr>> {
        if let Some(addr) = host.literal(port, family) {
            return Ok(vec![addr]);
        }
        let name = host.to_string();
        let addrs = tokio::net::lookup_host((name.as_str(), port))
            .await
            .map_err(|e| Error::AddressInvalid(format!("{}: {}", name, e)))?;
        filter_family(&name, addrs, family)
    }
}
