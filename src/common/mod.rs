//! Common types and abstractions
//!
//! This module defines the core types used throughout the crate:
//! - Url / Host: transport addresses and their resolution
//! - Options: the typed option surface
//! - MessagePipe: length-prefixed messages over any stream
//! - CloseSignal: close notification for in-flight work

mod address;
mod options;
mod pipe;
mod shutdown;
mod url;

pub use address::{Family, Host, Resolver, SystemResolver};
pub use options::{Configurable, OptionName, OptionType, OptionValue, StreamOptions};
pub use pipe::MessagePipe;
pub use shutdown::CloseSignal;
pub use url::{BindTarget, DialTarget, Url};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
