//! Error types for loomwire

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::common::OptionType;

/// Main error type for loomwire
///
/// Errors are `Clone` so that a single completion result can be read back
/// from an [`AsyncOp`](crate::aio::AsyncOp) any number of times.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid address: {0}")]
    AddressInvalid(String),

    #[error("Address in use: {0}")]
    AddressInUse(String),

    #[error("Option {option} has type {declared}, not {requested}")]
    TypeMismatch {
        option: &'static str,
        declared: OptionType,
        requested: OptionType,
    },

    #[error("Timed out")]
    Timeout,

    #[error("Operation canceled")]
    Canceled,

    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("No transport registered for scheme: {0}")]
    TransportUnsupported(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection reset by peer")]
    ConnectionReset,

    #[error("Operation already in progress")]
    Busy,

    #[error("Incorrect state: {0}")]
    State(String),

    #[error("Operation handle has been freed")]
    Freed,

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Option {0} is read-only")]
    ReadOnly(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => Error::AddressInUse(err.to_string()),
            io::ErrorKind::AddrNotAvailable => Error::AddressInvalid(err.to_string()),
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Error::ConnectionReset,
            io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(Arc::new(err)),
        }
    }
}

/// Result type alias for loomwire
pub type Result<T> = std::result::Result<T, Error>;
