//! Session Layer
//!
//! Responsibilities:
//! - TLS credentials ([`TlsConfig`])
//! - Secure record engines that turn ciphertext into plaintext and back
//!
//! Engines never do I/O. The TLS transport moves their output over the lower
//! stream and feeds them what it receives.

mod cert;
mod config;
mod psk;

pub use config::{AuthMode, PskCredentials, TlsConfig, TlsConfigBuilder, TlsMode};

use tokio_rustls::rustls::pki_types::ServerName;

use crate::error::Result;

pub(crate) use cert::CertSession;
pub(crate) use psk::PskSession;

/// Outcome of a plaintext read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readable {
    /// Bytes copied into the caller's buffer
    Data(usize),
    /// More ciphertext is needed
    Pending,
    /// Peer sent close-notify
    Closed,
}

/// Lifecycle of a TLS connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Initial,
    Handshaking,
    Established,
    Closing,
    Closed,
    Failed,
}

/// A secure session engine
pub(crate) trait RecordLayer: Send {
    fn is_handshaking(&self) -> bool;

    /// Process ciphertext received from the peer. On error any alert for
    /// the peer is left in the output queue.
    fn feed(&mut self, data: &[u8]) -> Result<()>;

    fn wants_write(&self) -> bool;

    /// Drain ciphertext waiting to be sent
    fn take_output(&mut self) -> Vec<u8>;

    fn read_plaintext(&mut self, buf: &mut [u8]) -> Result<Readable>;

    fn write_plaintext(&mut self, data: &[u8]) -> Result<()>;

    /// Queue close-notify
    fn send_close(&mut self);

    fn peer_verified(&self) -> bool;

    fn psk_identity(&self) -> Option<String>;
}

/// Client engine for `config`. PSK credentials win over certificates.
pub(crate) fn client_session(
    config: &TlsConfig,
    server_name: ServerName<'static>,
) -> Result<Box<dyn RecordLayer>> {
    if config.psk().is_some() {
        Ok(Box::new(PskSession::client(config)?))
    } else {
        Ok(Box::new(CertSession::client(config, server_name)?))
    }
}

pub(crate) fn server_session(config: &TlsConfig) -> Result<Box<dyn RecordLayer>> {
    if config.psk().is_some() {
        Ok(Box::new(PskSession::server(config)?))
    } else {
        Ok(Box::new(CertSession::server(config)?))
    }
}
