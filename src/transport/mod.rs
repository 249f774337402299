//! Transport Layer
//!
//! Responsibilities:
//! - Turn a URL into a dialer or listener for the scheme's transport
//! - Move bytes over established connections through [`AsyncOp`]s
//! - NO message framing, NO protocol semantics
//!
//! Every transport implements the same three objects. Layered transports
//! (TLS) are built purely from the objects of the transport below them.

pub mod registry;
pub mod tcp;
pub mod tls;

pub use registry::{dialer, listener, lookup, register};
pub use tcp::{TcpConnection, TcpDialer, TcpListener, TcpTransport};
pub use tls::{TlsConnection, TlsDialer, TlsListener, TlsTransport};

use crate::aio::AsyncOp;
use crate::common::{Configurable, Url};
use crate::error::Result;

/// An established, bidirectional byte stream
///
/// One send and one receive may be outstanding at a time. A second op on a
/// busy direction completes at once with `Busy`. Dropping the connection
/// closes it.
pub trait StreamConnection: Configurable + Send + Sync {
    /// Send the op's I/O vectors. Completes once every byte is written.
    fn send(&self, aio: &AsyncOp);

    /// Receive at most the op's I/O vector length. Completes with at least
    /// one byte unless the vectors are empty.
    fn recv(&self, aio: &AsyncOp);

    /// Idempotent. Outstanding ops complete with `Canceled`.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Outgoing connection factory
pub trait Dialer: Configurable + Send + Sync {
    /// On success, output slot 0 holds the new connection.
    fn dial(&self, aio: &AsyncOp);

    /// Abort in-flight dials and refuse new ones
    fn close(&self);
}

/// Incoming connection factory
pub trait Listener: Configurable + Send + Sync {
    /// Bind and start listening. Synchronous; the bound address is fixed
    /// from here on.
    fn listen(&self) -> Result<()>;

    /// On success, output slot 0 holds the new connection.
    fn accept(&self, aio: &AsyncOp);

    /// Abort in-flight accepts and release the socket
    fn close(&self);
}

/// A transport registered under one URL scheme
pub trait Transport: Send + Sync {
    fn scheme(&self) -> &str;

    /// Validate `url` and build a dialer for it. No I/O happens here.
    fn dialer(&self, url: &Url) -> Result<Box<dyn Dialer>>;

    /// Validate `url` and build a listener for it. Binding waits for
    /// [`Listener::listen`].
    fn listener(&self, url: &Url) -> Result<Box<dyn Listener>>;
}
