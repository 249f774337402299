//! Process-wide scheme → transport table

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use tracing::debug;

use super::{Dialer, Listener, TcpTransport, TlsTransport, Transport};
use crate::common::Url;
use crate::error::{Error, Result};

lazy_static! {
    static ref TRANSPORTS: RwLock<HashMap<String, Arc<dyn Transport>>> = {
        let mut table: HashMap<String, Arc<dyn Transport>> = HashMap::new();
        for scheme in ["tcp", "tcp4", "tcp6"] {
            table.insert(scheme.to_string(), Arc::new(TcpTransport::new(scheme)));
        }
        for scheme in ["tls+tcp", "tls+tcp4", "tls+tcp6"] {
            table.insert(scheme.to_string(), Arc::new(TlsTransport::new(scheme)));
        }
        RwLock::new(table)
    };
}

/// Add a transport. The first registration of a scheme wins; later ones
/// return `false` and change nothing.
pub fn register(transport: Arc<dyn Transport>) -> bool {
    let scheme = transport.scheme().to_ascii_lowercase();
    let mut table = TRANSPORTS.write();
    if table.contains_key(&scheme) {
        debug!("Transport {} already registered", scheme);
        return false;
    }
    debug!("Registered transport {}", scheme);
    table.insert(scheme, transport);
    true
}

pub fn lookup(scheme: &str) -> Result<Arc<dyn Transport>> {
    TRANSPORTS
        .read()
        .get(&scheme.to_ascii_lowercase())
        .cloned()
        .ok_or_else(|| Error::TransportUnsupported(scheme.to_string()))
}

/// Build a dialer for `url` on the transport its scheme names
pub fn dialer(url: &str) -> Result<Box<dyn Dialer>> {
    let url = Url::parse(url)?;
    lookup(url.scheme())?.dialer(&url)
}

/// Build a listener for `url` on the transport its scheme names
pub fn listener(url: &str) -> Result<Box<dyn Listener>> {
    let url = Url::parse(url)?;
    lookup(url.scheme())?.listener(&url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_schemes() {
        for scheme in ["tcp", "tcp4", "tcp6", "tls+tcp", "tls+tcp4", "TLS+TCP6"] {
            assert!(lookup(scheme).is_ok(), "{} should be registered", scheme);
        }
        assert!(matches!(
            lookup("ipc"),
            Err(Error::TransportUnsupported(_))
        ));
        assert!(matches!(
            dialer("udp://127.0.0.1:80"),
            Err(Error::TransportUnsupported(_))
        ));
    }

    #[test]
    fn test_register_is_idempotent() {
        assert!(!register(Arc::new(TcpTransport::new("tcp"))));
        assert!(register(Arc::new(TcpTransport::new("tcp-extra"))));
        assert!(!register(Arc::new(TcpTransport::new("tcp-extra"))));
        assert!(dialer("tcp-extra://127.0.0.1:80").is_ok());
    }
}
