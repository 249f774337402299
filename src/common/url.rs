//! Transport URL parsing
//!
//! ```text
//! scheme://host[;host...][:port]
//! ```
//!
//! For dial URLs every host but the last is a preferred local source
//! address. Listen URLs take a single host, where `*` means any local address
//! and port 0 asks the OS for an ephemeral port. All validation here happens
//! before any socket exists.

use std::fmt;
use std::net::SocketAddr;

use super::address::{Family, Host};
use crate::error::{Error, Result};

/// A parsed transport URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    scheme: String,
    hosts: Vec<Host>,
    port: Option<u16>,
}

/// Where a dialer connects from and to
#[derive(Debug, Clone)]
pub struct DialTarget {
    pub local: Vec<Host>,
    pub remote: Host,
    pub port: u16,
    pub family: Family,
}

/// Where a listener binds
#[derive(Debug, Clone)]
pub struct BindTarget {
    pub host: Host,
    pub port: u16,
    pub family: Family,
}

impl Url {
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::AddressInvalid(format!("missing scheme: {}", s)))?;
        if scheme.is_empty()
            || !scheme
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.')
        {
            return Err(Error::AddressInvalid(format!("bad scheme: {}", s)));
        }
        if rest.contains('/') || rest.contains('?') || rest.contains('#') {
            return Err(Error::AddressInvalid(format!("unexpected path: {}", s)));
        }

        let (hosts_part, port) = split_port(rest)?;
        let family = Family::from_scheme(scheme);
        let hosts = hosts_part
            .split(';')
            .map(|h| {
                let host = Host::parse(strip_brackets(h)?)?;
                host.check_family(family)?;
                Ok(host)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            hosts,
            port,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn family(&self) -> Family {
        Family::from_scheme(&self.scheme)
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Same URL with a different scheme, used when a layered transport
    /// hands the address to the transport below it.
    pub fn with_scheme(&self, scheme: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            hosts: self.hosts.clone(),
            port: self.port,
        }
    }

    /// The URL of a bound listener, with the real address substituted
    pub fn bound(&self, addr: SocketAddr) -> String {
        format!("{}://{}", self.scheme, addr)
    }

    pub fn dial_target(&self) -> Result<DialTarget> {
        let (remote, local) = self
            .hosts
            .split_last()
            .ok_or_else(|| Error::AddressInvalid(self.to_string()))?;
        if remote.is_wildcard() {
            return Err(Error::AddressInvalid(format!(
                "cannot dial wildcard address: {}",
                self
            )));
        }
        let port = match self.port {
            Some(0) | None => {
                return Err(Error::AddressInvalid(format!("dial requires a port: {}", self)))
            }
            Some(port) => port,
        };
        Ok(DialTarget {
            local: local.to_vec(),
            remote: remote.clone(),
            port,
            family: self.family(),
        })
    }

    pub fn bind_target(&self) -> Result<BindTarget> {
        let host = match self.hosts.as_slice() {
            [host] => host.clone(),
            _ => {
                return Err(Error::AddressInvalid(format!(
                    "listen takes exactly one host: {}",
                    self
                )))
            }
        };
        let port = self
            .port
            .ok_or_else(|| Error::AddressInvalid(format!("listen requires a port: {}", self)))?;
        Ok(BindTarget {
            host,
            port,
            family: self.family(),
        })
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        for (i, host) in self.hosts.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}", host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Url {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Url::parse(s)
    }
}

/// Split `hosts[:port]`, ignoring colons inside `[...]`.
fn split_port(s: &str) -> Result<(&str, Option<u16>)> {
    let mut depth = 0i32;
    let mut colon = None;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            ':' if depth == 0 => colon = Some(i),
            _ => {}
        }
        if !(0..=1).contains(&depth) {
            return Err(Error::AddressInvalid(format!("unbalanced brackets: {}", s)));
        }
    }
    if depth != 0 {
        return Err(Error::AddressInvalid(format!("unbalanced brackets: {}", s)));
    }

    match colon {
        None => Ok((s, None)),
        Some(i) => {
            let port_str = &s[i + 1..];
            if port_str.is_empty() || !port_str.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::AddressInvalid(format!("bad port: {}", port_str)));
            }
            let port = port_str
                .parse::<u16>()
                .map_err(|_| Error::AddressInvalid(format!("port out of range: {}", port_str)))?;
            Ok((&s[..i], Some(port)))
        }
    }
}

fn strip_brackets(h: &str) -> Result<&str> {
    match (h.starts_with('['), h.ends_with(']')) {
        (true, true) => Ok(&h[1..h.len() - 1]),
        (false, false) if !h.contains('[') && !h.contains(']') => Ok(h),
        _ => Err(Error::AddressInvalid(format!("malformed host: {}", h))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let url = Url::parse("tls+tcp://127.0.0.1:5555").unwrap();
        assert_eq!(url.scheme(), "tls+tcp");
        assert_eq!(url.port(), Some(5555));
        assert_eq!(url.to_string(), "tls+tcp://127.0.0.1:5555");

        let target = url.dial_target().unwrap();
        assert!(target.local.is_empty());
        assert_eq!(target.remote, Host::Ip("127.0.0.1".parse().unwrap()));
        assert_eq!(target.port, 5555);
    }

    #[test]
    fn test_parse_ipv6_and_local_list() {
        let url = Url::parse("tcp6://[::1];[::1]:80").unwrap();
        let target = url.dial_target().unwrap();
        assert_eq!(target.local, vec![Host::Ip("::1".parse().unwrap())]);
        assert_eq!(target.family, Family::V6);
        assert_eq!(url.to_string(), "tcp6://[::1];[::1]:80");
    }

    #[test]
    fn test_wildcard() {
        let url = Url::parse("tls+tcp4://*:4000").unwrap();
        let bind = url.bind_target().unwrap();
        assert!(bind.host.is_wildcard());
        assert_eq!(bind.family, Family::V4);
        assert!(matches!(url.dial_target(), Err(Error::AddressInvalid(_))));

        let url = Url::parse("tcp://:0").unwrap();
        assert!(url.bind_target().unwrap().host.is_wildcard());
    }

    #[test]
    fn test_malformed() {
        for bad in [
            "tls+tcp://127.0.0.1.32:80",
            "tls+tcp://127.0.x.1.32:80",
            "tcp://127.0.0.1:http",
            "tcp://127.0.0.1:70000",
            "tcp://127.0.0.1:",
            "tcp://[::1:80",
            "tcp4://[::1]:80",
            "tcp6://127.0.0.1:80",
            "127.0.0.1:80",
            "tcp://host/path:80",
        ] {
            assert!(
                matches!(Url::parse(bad), Err(Error::AddressInvalid(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_port_requirements() {
        let url = Url::parse("tls+tcp://127.0.0.1").unwrap();
        assert!(matches!(url.dial_target(), Err(Error::AddressInvalid(_))));
        assert!(matches!(url.bind_target(), Err(Error::AddressInvalid(_))));

        let url = Url::parse("tcp://127.0.0.1:0").unwrap();
        assert!(url.dial_target().is_err());
        assert_eq!(url.bind_target().unwrap().port, 0);

        let url = Url::parse("tcp://127.0.0.1;127.0.0.1:9").unwrap();
        assert!(url.bind_target().is_err());
    }

    #[test]
    fn test_bound_url() {
        let url = Url::parse("tls+tcp://127.0.0.1:0").unwrap();
        assert_eq!(
            url.bound("127.0.0.1:4321".parse().unwrap()),
            "tls+tcp://127.0.0.1:4321"
        );
        assert_eq!(url.with_scheme("tcp").scheme(), "tcp");
    }
}
