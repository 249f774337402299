//! Typed option surface shared by dialers, listeners and connections
//!
//! Every option has exactly one declared [`OptionType`]. The typed accessors
//! on [`Configurable`] check the requested type against the declared one
//! before any object-specific code runs, so a bool option read through
//! `get_int` fails with `TypeMismatch` everywhere, uniformly.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::session::TlsConfig;

/// Declared value type of an option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    Bool,
    Int,
    Duration,
    Size,
    String,
    Addr,
    Tls,
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptionType::Bool => "bool",
            OptionType::Int => "int",
            OptionType::Duration => "duration",
            OptionType::Size => "size",
            OptionType::String => "string",
            OptionType::Addr => "address",
            OptionType::Tls => "tls-config",
        };
        f.write_str(name)
    }
}

/// The closed set of option keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionName {
    /// Disable send coalescing (Nagle)
    NoDelay,
    /// TCP keepalive probes
    KeepAlive,
    /// Largest message the receiver accepts, 0 for unlimited
    RecvMaxSize,
    RecvTimeout,
    SendTimeout,
    LocalAddr,
    RemoteAddr,
    Url,
    /// Shared TLS configuration handle
    TlsConfig,
    /// Whether the peer was authenticated
    TlsVerified,
    TlsPskIdentity,
}

const ALL_OPTIONS: [OptionName; 11] = [
    OptionName::NoDelay,
    OptionName::KeepAlive,
    OptionName::RecvMaxSize,
    OptionName::RecvTimeout,
    OptionName::SendTimeout,
    OptionName::LocalAddr,
    OptionName::RemoteAddr,
    OptionName::Url,
    OptionName::TlsConfig,
    OptionName::TlsVerified,
    OptionName::TlsPskIdentity,
];

impl OptionName {
    /// Wire name of the option
    pub fn key(&self) -> &'static str {
        match self {
            OptionName::NoDelay => "tcp-nodelay",
            OptionName::KeepAlive => "tcp-keepalive",
            OptionName::RecvMaxSize => "recv-size-max",
            OptionName::RecvTimeout => "recv-timeout",
            OptionName::SendTimeout => "send-timeout",
            OptionName::LocalAddr => "local-address",
            OptionName::RemoteAddr => "remote-address",
            OptionName::Url => "url",
            OptionName::TlsConfig => "tls-config",
            OptionName::TlsVerified => "tls-verified",
            OptionName::TlsPskIdentity => "tls-psk-identity",
        }
    }

    /// Declared type of the option
    pub fn kind(&self) -> OptionType {
        match self {
            OptionName::NoDelay | OptionName::KeepAlive | OptionName::TlsVerified => {
                OptionType::Bool
            }
            OptionName::RecvMaxSize => OptionType::Size,
            OptionName::RecvTimeout | OptionName::SendTimeout => OptionType::Duration,
            OptionName::LocalAddr | OptionName::RemoteAddr => OptionType::Addr,
            OptionName::Url | OptionName::TlsPskIdentity => OptionType::String,
            OptionName::TlsConfig => OptionType::Tls,
        }
    }

    /// Options that can be read but never set
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            OptionName::LocalAddr
                | OptionName::RemoteAddr
                | OptionName::Url
                | OptionName::TlsVerified
                | OptionName::TlsPskIdentity
        )
    }

    fn check(&self, requested: OptionType) -> Result<()> {
        if self.kind() == requested {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                option: self.key(),
                declared: self.kind(),
                requested,
            })
        }
    }
}

impl fmt::Display for OptionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for OptionName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ALL_OPTIONS
            .iter()
            .copied()
            .find(|name| name.key() == s)
            .ok_or_else(|| Error::NotSupported(format!("option {}", s)))
    }
}

/// A typed option value
#[derive(Debug, Clone)]
pub enum OptionValue {
    Bool(bool),
    Int(i32),
    Duration(Option<Duration>),
    Size(usize),
    String(String),
    Addr(SocketAddr),
    Tls(Arc<TlsConfig>),
}

impl OptionValue {
    pub fn kind(&self) -> OptionType {
        match self {
            OptionValue::Bool(_) => OptionType::Bool,
            OptionValue::Int(_) => OptionType::Int,
            OptionValue::Duration(_) => OptionType::Duration,
            OptionValue::Size(_) => OptionType::Size,
            OptionValue::String(_) => OptionType::String,
            OptionValue::Addr(_) => OptionType::Addr,
            OptionValue::Tls(_) => OptionType::Tls,
        }
    }
}

/// Option access for dialers, listeners and connections
///
/// Implementors provide [`option`](Configurable::option) and
/// [`set_option_value`](Configurable::set_option_value). Both are only called
/// after the value type has been checked, so an implementation may assume the
/// value variant matches `name.kind()`.
pub trait Configurable {
    /// Read an option. Unknown options return `NotSupported`.
    fn option(&self, name: OptionName) -> Result<OptionValue>;

    /// Store an option whose type has already been validated.
    fn set_option_value(&self, name: OptionName, value: OptionValue) -> Result<()>;

    /// Type-checked get
    fn get_option(&self, name: OptionName, requested: OptionType) -> Result<OptionValue> {
        name.check(requested)?;
        self.option(name)
    }

    /// Type-checked set
    fn set_option(&self, name: OptionName, value: OptionValue) -> Result<()> {
        name.check(value.kind())?;
        if name.is_read_only() {
            // Still has to be an option this object knows.
            self.option(name)?;
            return Err(Error::ReadOnly(name.key().to_string()));
        }
        self.set_option_value(name, value)
    }

    fn get_bool(&self, name: OptionName) -> Result<bool> {
        match self.get_option(name, OptionType::Bool)? {
            OptionValue::Bool(v) => Ok(v),
            other => Err(mismatch(name, other)),
        }
    }

    fn set_bool(&self, name: OptionName, value: bool) -> Result<()> {
        self.set_option(name, OptionValue::Bool(value))
    }

    fn get_int(&self, name: OptionName) -> Result<i32> {
        match self.get_option(name, OptionType::Int)? {
            OptionValue::Int(v) => Ok(v),
            other => Err(mismatch(name, other)),
        }
    }

    fn set_int(&self, name: OptionName, value: i32) -> Result<()> {
        self.set_option(name, OptionValue::Int(value))
    }

    /// `None` means no timeout
    fn get_duration(&self, name: OptionName) -> Result<Option<Duration>> {
        match self.get_option(name, OptionType::Duration)? {
            OptionValue::Duration(v) => Ok(v),
            other => Err(mismatch(name, other)),
        }
    }

    fn set_duration(&self, name: OptionName, value: Option<Duration>) -> Result<()> {
        self.set_option(name, OptionValue::Duration(value))
    }

    fn get_size(&self, name: OptionName) -> Result<usize> {
        match self.get_option(name, OptionType::Size)? {
            OptionValue::Size(v) => Ok(v),
            other => Err(mismatch(name, other)),
        }
    }

    fn set_size(&self, name: OptionName, value: usize) -> Result<()> {
        self.set_option(name, OptionValue::Size(value))
    }

    fn get_string(&self, name: OptionName) -> Result<String> {
        match self.get_option(name, OptionType::String)? {
            OptionValue::String(v) => Ok(v),
            other => Err(mismatch(name, other)),
        }
    }

    fn set_string(&self, name: OptionName, value: &str) -> Result<()> {
        self.set_option(name, OptionValue::String(value.to_string()))
    }

    fn get_addr(&self, name: OptionName) -> Result<SocketAddr> {
        match self.get_option(name, OptionType::Addr)? {
            OptionValue::Addr(v) => Ok(v),
            other => Err(mismatch(name, other)),
        }
    }

    /// Returns the same `Arc` that was stored with [`set_tls`](Configurable::set_tls)
    fn get_tls(&self) -> Result<Arc<TlsConfig>> {
        match self.get_option(OptionName::TlsConfig, OptionType::Tls)? {
            OptionValue::Tls(v) => Ok(v),
            other => Err(mismatch(OptionName::TlsConfig, other)),
        }
    }

    fn set_tls(&self, config: Arc<TlsConfig>) -> Result<()> {
        self.set_option(OptionName::TlsConfig, OptionValue::Tls(config))
    }
}

fn mismatch(name: OptionName, got: OptionValue) -> Error {
    Error::TypeMismatch {
        option: name.key(),
        declared: name.kind(),
        requested: got.kind(),
    }
}

/// Stream options carried by TCP dialers and listeners and stamped onto the
/// connections they produce.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub nodelay: bool,
    pub keepalive: bool,
    pub recv_max_size: usize,
    pub recv_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: false,
            recv_max_size: 0,
            recv_timeout: None,
            send_timeout: None,
        }
    }
}

impl StreamOptions {
    /// Read one of the stream options, or `None` if `name` is not one.
    pub fn get(&self, name: OptionName) -> Option<OptionValue> {
        let value = match name {
            OptionName::NoDelay => OptionValue::Bool(self.nodelay),
            OptionName::KeepAlive => OptionValue::Bool(self.keepalive),
            OptionName::RecvMaxSize => OptionValue::Size(self.recv_max_size),
            OptionName::RecvTimeout => OptionValue::Duration(self.recv_timeout),
            OptionName::SendTimeout => OptionValue::Duration(self.send_timeout),
            _ => return None,
        };
        Some(value)
    }

    /// Store one of the stream options. Returns `false` if `name` is not one.
    pub fn set(&mut self, name: OptionName, value: &OptionValue) -> bool {
        match (name, value) {
            (OptionName::NoDelay, OptionValue::Bool(v)) => self.nodelay = *v,
            (OptionName::KeepAlive, OptionValue::Bool(v)) => self.keepalive = *v,
            (OptionName::RecvMaxSize, OptionValue::Size(v)) => self.recv_max_size = *v,
            (OptionName::RecvTimeout, OptionValue::Duration(v)) => self.recv_timeout = *v,
            (OptionName::SendTimeout, OptionValue::Duration(v)) => self.send_timeout = *v,
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Bag(Mutex<StreamOptions>);

    impl Configurable for Bag {
        fn option(&self, name: OptionName) -> Result<OptionValue> {
            match name {
                OptionName::LocalAddr => Ok(OptionValue::Addr("127.0.0.1:1".parse().unwrap())),
                _ => self
                    .0
                    .lock()
                    .get(name)
                    .ok_or_else(|| Error::NotSupported(name.to_string())),
            }
        }

        fn set_option_value(&self, name: OptionName, value: OptionValue) -> Result<()> {
            if self.0.lock().set(name, &value) {
                Ok(())
            } else {
                Err(Error::NotSupported(name.to_string()))
            }
        }
    }

    fn bag() -> Bag {
        Bag(Mutex::new(StreamOptions::default()))
    }

    #[test]
    fn test_option_names_parse() {
        for name in ALL_OPTIONS {
            assert_eq!(name.key().parse::<OptionName>().unwrap(), name);
        }
        assert!(matches!(
            "no-such-option".parse::<OptionName>(),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_bool_through_int_accessor() {
        let b = bag();
        assert!(b.get_bool(OptionName::NoDelay).unwrap());
        assert!(matches!(
            b.get_int(OptionName::NoDelay),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            b.set_int(OptionName::KeepAlive, 1),
            Err(Error::TypeMismatch { .. })
        ));
        b.set_bool(OptionName::KeepAlive, true).unwrap();
        assert!(b.get_bool(OptionName::KeepAlive).unwrap());
    }

    #[test]
    fn test_read_only_and_unknown() {
        let b = bag();
        assert!(b.get_addr(OptionName::LocalAddr).is_ok());
        assert!(matches!(
            b.get_bool(OptionName::TlsVerified),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            b.set_option(
                OptionName::LocalAddr,
                OptionValue::Addr("127.0.0.1:2".parse().unwrap())
            ),
            Err(Error::ReadOnly(_))
        ));
    }

    #[test]
    fn test_duration_and_size() {
        let b = bag();
        assert_eq!(b.get_duration(OptionName::RecvTimeout).unwrap(), None);
        b.set_duration(OptionName::RecvTimeout, Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(
            b.get_duration(OptionName::RecvTimeout).unwrap(),
            Some(Duration::from_millis(100))
        );
        b.set_size(OptionName::RecvMaxSize, 200).unwrap();
        assert_eq!(b.get_size(OptionName::RecvMaxSize).unwrap(), 200);
        assert!(b.get_bool(OptionName::RecvMaxSize).is_err());
    }
}
