//! Configuration module for loomwire
//!
//! JSON configuration for the `loomwire` binary and for embedders that want
//! file-driven defaults.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::aio::pool::PoolConfig;
use crate::common::{Configurable, OptionName};
use crate::error::{Error, Result};
use crate::session::{AuthMode, TlsConfig, TlsMode};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Options applied to every dialer and listener
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// TLS credentials for `tls+` URLs
    #[serde(default)]
    pub tls: Option<TlsSettings>,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Example configuration for a dialing client
    pub fn default_client() -> Self {
        Config {
            tls: Some(TlsSettings {
                mode: TlsModeSetting::Client,
                ca_file: Some("ca.crt".to_string()),
                server_name: Some("example.com".to_string()),
                auth_mode: Some("required".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Example configuration for a listening server
    pub fn default_server() -> Self {
        Config {
            tls: Some(TlsSettings {
                mode: TlsModeSetting::Server,
                certificate_file: Some("server.crt".to_string()),
                key_file: Some("server.key".to_string()),
                auth_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the TLS configuration object, if a `tls` section is present
    pub fn tls_config(&self) -> Result<Option<Arc<TlsConfig>>> {
        self.tls.as_ref().map(TlsSettings::build).transpose()
    }

    /// Stamp the `defaults` section onto a dialer or listener
    pub fn apply_defaults<T: Configurable + ?Sized>(&self, target: &T) -> Result<()> {
        self.defaults.apply(target)
    }

    pub fn pool_config(&self) -> PoolConfig {
        let mut pool = PoolConfig::default();
        if let Some(workers) = self.runtime.worker_threads {
            pool.worker_threads = workers;
        }
        pool
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads; defaults to the available parallelism, capped
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

/// Stream option defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub nodelay: Option<bool>,

    #[serde(default)]
    pub keepalive: Option<bool>,

    /// Largest message accepted, in bytes; 0 means unlimited
    #[serde(default)]
    pub recv_max_size: Option<usize>,

    /// Receive timeout in milliseconds
    #[serde(default)]
    pub recv_timeout_ms: Option<u64>,

    /// Send timeout in milliseconds
    #[serde(default)]
    pub send_timeout_ms: Option<u64>,
}

impl DefaultsConfig {
    fn apply<T: Configurable + ?Sized>(&self, target: &T) -> Result<()> {
        if let Some(nodelay) = self.nodelay {
            target.set_bool(OptionName::NoDelay, nodelay)?;
        }
        if let Some(keepalive) = self.keepalive {
            target.set_bool(OptionName::KeepAlive, keepalive)?;
        }
        if let Some(size) = self.recv_max_size {
            target.set_size(OptionName::RecvMaxSize, size)?;
        }
        if let Some(ms) = self.recv_timeout_ms {
            target.set_duration(OptionName::RecvTimeout, Some(Duration::from_millis(ms)))?;
        }
        if let Some(ms) = self.send_timeout_ms {
            target.set_duration(OptionName::SendTimeout, Some(Duration::from_millis(ms)))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsModeSetting {
    #[default]
    Client,
    Server,
}

impl From<TlsModeSetting> for TlsMode {
    fn from(mode: TlsModeSetting) -> Self {
        match mode {
            TlsModeSetting::Client => TlsMode::Client,
            TlsModeSetting::Server => TlsMode::Server,
        }
    }
}

/// TLS settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub mode: TlsModeSetting,

    /// Own certificate chain (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_file: Option<String>,

    /// Own private key (PEM, optionally encrypted PKCS#8)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,

    /// Passphrase for an encrypted key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,

    /// Trust anchors (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,

    /// Revocation list (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crl_file: Option<String>,

    /// Expected server name (client mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    /// none, optional or required
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk_identity: Option<String>,

    /// Base64-encoded pre-shared key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk_key: Option<String>,
}

impl TlsSettings {
    pub fn build(&self) -> Result<Arc<TlsConfig>> {
        let mut builder = TlsConfig::builder(self.mode.into());

        if let Some(mode) = &self.auth_mode {
            builder = builder.auth_mode(mode.parse::<AuthMode>()?);
        }
        if let Some(name) = &self.server_name {
            builder = builder.server_name(name);
        }
        match (&self.certificate_file, &self.key_file) {
            (Some(cert), Some(key)) => {
                builder = builder.own_cert_file(cert, key, self.passphrase.as_deref())?;
            }
            (None, None) => {}
            _ => {
                return Err(Error::Config(
                    "certificate_file and key_file must be given together".into(),
                ))
            }
        }
        if let Some(ca) = &self.ca_file {
            builder = builder.ca_file(ca, self.crl_file.as_deref().map(Path::new))?;
        }
        match (&self.psk_identity, &self.psk_key) {
            (Some(identity), Some(key)) => {
                let key = base64::engine::general_purpose::STANDARD
                    .decode(key)
                    .map_err(|e| Error::Config(format!("Invalid psk_key: {}", e)))?;
                builder = builder.psk(identity, &key)?;
            }
            (None, None) => {}
            _ => {
                return Err(Error::Config(
                    "psk_identity and psk_key must be given together".into(),
                ))
            }
        }
        builder.build()
    }
}
