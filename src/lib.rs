//! loomwire - transport-agnostic asynchronous stream messaging
//!
//! # Architecture (Layered Transports)
//!
//! ```text
//! caller
//! → AsyncOp (submission, completion, cancel, timeout)
//! → MessagePipe (optional length-prefixed framing)
//! → StreamConnection
//! → TLS (rustls or PSK record layer)
//! → TCP
//! ```
//!
//! ## Core Principles
//!
//! - Every operation is an [`AsyncOp`] that completes exactly once
//! - Transports are found by URL scheme in a process-wide registry
//! - Layered transports are built only from the layer below
//! - Options are typed and checked before they reach a transport
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── aio/             # AsyncOp and the worker pool
//! ├── common/          # URLs, addresses, options, framing
//! ├── transport/       # Registry, TCP, TLS
//! ├── session/         # TLS credentials and record engines
//! └── crypto/          # Primitives for the PSK handshake
//! ```

// Core types
pub mod aio;
pub mod common;
pub mod error;

// Layered architecture
pub mod session;
pub mod transport;

// Supporting modules
pub mod config;
pub mod crypto;
pub mod metrics;

// Re-exports for convenience
pub use aio::{AsyncOp, OpState};
pub use common::{Configurable, MessagePipe, OptionName, OptionValue, Url};
pub use config::Config;
pub use error::{Error, Result};

// Architecture re-exports
pub use session::{AuthMode, TlsConfig, TlsMode};
pub use transport::{Dialer, Listener, StreamConnection, Transport};
