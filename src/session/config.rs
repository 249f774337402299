//! Shared, immutable TLS configuration
//!
//! A [`TlsConfig`] is built once and handed around as `Arc<TlsConfig>`.
//! Dialers, listeners and every connection they produce hold a reference;
//! the configuration is freed when the last one goes away. The rustls
//! client or server configuration is compiled in [`TlsConfigBuilder::build`],
//! so handshakes only ever read it.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    client::WebPkiServerVerifier,
    crypto::{ring, CryptoProvider},
    pki_types::{
        CertificateDer, CertificateRevocationListDer, PrivateKeyDer, PrivatePkcs8KeyDer,
        ServerName, UnixTime,
    },
    server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier},
    sign::CertifiedKey,
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};
use tracing::debug;

use crate::crypto::CipherKind;
use crate::error::{Error, Result};

/// Which end of the handshake a configuration is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Client,
    Server,
}

/// Peer authentication policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Accept any peer
    None,
    /// Verify a certificate if the peer sends one (servers only)
    Optional,
    /// Fail the handshake unless the peer authenticates
    Required,
}

impl std::str::FromStr for AuthMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(AuthMode::None),
            "optional" => Ok(AuthMode::Optional),
            "required" => Ok(AuthMode::Required),
            _ => Err(Error::Config(format!("unknown auth mode: {}", s))),
        }
    }
}

/// Pre-shared key credentials
#[derive(Clone)]
pub struct PskCredentials {
    pub identity: String,
    pub key: Vec<u8>,
}

/// Immutable TLS credential bundle
pub struct TlsConfig {
    mode: TlsMode,
    auth_mode: AuthMode,
    server_name: Option<String>,
    psk: Option<PskCredentials>,
    psk_ciphers: Vec<CipherKind>,
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
}

impl TlsConfig {
    pub fn builder(mode: TlsMode) -> TlsConfigBuilder {
        TlsConfigBuilder::new(mode)
    }

    /// Client configuration with an empty trust store
    pub fn client() -> Result<Arc<TlsConfig>> {
        Self::builder(TlsMode::Client).build()
    }

    /// Server configuration without a certificate; handshakes fail until
    /// one is supplied.
    pub fn server() -> Result<Arc<TlsConfig>> {
        Self::builder(TlsMode::Server).build()
    }

    pub fn psk_client(identity: &str, key: &[u8]) -> Result<Arc<TlsConfig>> {
        Self::builder(TlsMode::Client).psk(identity, key)?.build()
    }

    pub fn psk_server(identity: &str, key: &[u8]) -> Result<Arc<TlsConfig>> {
        Self::builder(TlsMode::Server).psk(identity, key)?.build()
    }

    pub fn mode(&self) -> TlsMode {
        self.mode
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth_mode
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// PSK credentials. When present they take precedence over certificates.
    pub fn psk(&self) -> Option<&PskCredentials> {
        self.psk.as_ref()
    }

    /// PSK ciphers in preference order
    pub fn psk_ciphers(&self) -> &[CipherKind] {
        &self.psk_ciphers
    }

    pub(crate) fn rustls_client(&self) -> Option<Arc<ClientConfig>> {
        self.client.clone()
    }

    pub(crate) fn rustls_server(&self) -> Option<Arc<ServerConfig>> {
        self.server.clone()
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("mode", &self.mode)
            .field("auth_mode", &self.auth_mode)
            .field("server_name", &self.server_name)
            .field("psk_identity", &self.psk.as_ref().map(|p| &p.identity))
            .field("psk_ciphers", &self.psk_ciphers)
            .finish_non_exhaustive()
    }
}

/// Collects credentials for a [`TlsConfig`]
pub struct TlsConfigBuilder {
    mode: TlsMode,
    auth_mode: AuthMode,
    server_name: Option<String>,
    certs: Vec<CertificateDer<'static>>,
    key: Option<PrivateKeyDer<'static>>,
    roots: Vec<CertificateDer<'static>>,
    crls: Vec<CertificateRevocationListDer<'static>>,
    psk: Option<PskCredentials>,
    psk_ciphers: Vec<CipherKind>,
}

impl TlsConfigBuilder {
    fn new(mode: TlsMode) -> Self {
        Self {
            mode,
            auth_mode: match mode {
                TlsMode::Client => AuthMode::Required,
                TlsMode::Server => AuthMode::None,
            },
            server_name: None,
            certs: Vec::new(),
            key: None,
            roots: Vec::new(),
            crls: Vec::new(),
            psk: None,
            psk_ciphers: vec![CipherKind::ChaCha20Poly1305, CipherKind::Aes256Gcm],
        }
    }

    /// Own certificate chain and private key, both PEM. An encrypted PKCS#8
    /// key needs `passphrase`.
    pub fn own_cert(mut self, cert_pem: &str, key_pem: &str, passphrase: Option<&str>) -> Result<Self> {
        self.certs = load_certs(cert_pem)?;
        if self.certs.is_empty() {
            return Err(Error::Config("no certificate found in PEM input".into()));
        }
        self.key = Some(load_private_key(key_pem, passphrase)?);
        Ok(self)
    }

    pub fn own_cert_file(
        self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        passphrase: Option<&str>,
    ) -> Result<Self> {
        let cert = read_file(cert_path.as_ref())?;
        let key = read_file(key_path.as_ref())?;
        self.own_cert(&cert, &key, passphrase)
    }

    /// Trust anchors, plus optional revocation lists, both PEM
    pub fn ca_chain(mut self, ca_pem: &str, crl_pem: Option<&str>) -> Result<Self> {
        let roots = load_certs(ca_pem)?;
        if roots.is_empty() {
            return Err(Error::Config("no CA certificate found in PEM input".into()));
        }
        self.roots.extend(roots);
        if let Some(crl_pem) = crl_pem {
            let crls = rustls_pemfile::crls(&mut crl_pem.as_bytes())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::Config(format!("Failed to parse CRL: {}", e)))?;
            self.crls.extend(crls);
        }
        Ok(self)
    }

    pub fn ca_file(self, ca_path: impl AsRef<Path>, crl_path: Option<&Path>) -> Result<Self> {
        let ca = read_file(ca_path.as_ref())?;
        let crl = crl_path.map(read_file).transpose()?;
        self.ca_chain(&ca, crl.as_deref())
    }

    /// Pre-shared key. The identity is 1 to 255 bytes and the key non-empty.
    pub fn psk(mut self, identity: &str, key: &[u8]) -> Result<Self> {
        if identity.is_empty() || identity.len() > 255 {
            return Err(Error::Config(format!(
                "PSK identity must be 1-255 bytes, got {}",
                identity.len()
            )));
        }
        if key.is_empty() {
            return Err(Error::Config("PSK key must not be empty".into()));
        }
        self.psk = Some(PskCredentials {
            identity: identity.to_string(),
            key: key.to_vec(),
        });
        Ok(self)
    }

    /// Name the client expects in the server's certificate, overriding the
    /// host of the dialed URL.
    pub fn server_name(mut self, name: &str) -> Self {
        self.server_name = Some(name.to_string());
        self
    }

    pub fn auth_mode(mut self, mode: AuthMode) -> Self {
        self.auth_mode = mode;
        self
    }

    /// PSK cipher preference, most preferred first
    pub fn psk_cipher(mut self, ciphers: &[CipherKind]) -> Self {
        if !ciphers.is_empty() {
            self.psk_ciphers = ciphers.to_vec();
        }
        self
    }

    pub fn build(self) -> Result<Arc<TlsConfig>> {
        if self.mode == TlsMode::Client && self.auth_mode == AuthMode::Optional {
            return Err(Error::Config("optional authentication is server-only".into()));
        }
        if let Some(name) = &self.server_name {
            ServerName::try_from(name.clone())
                .map_err(|_| Error::Config(format!("Invalid server name: {}", name)))?;
        }

        let (client, server) = match self.mode {
            TlsMode::Client => (Some(Arc::new(self.client_config()?)), None),
            TlsMode::Server => (None, Some(Arc::new(self.server_config()?))),
        };
        debug!(
            "Built {:?} TLS config (auth {:?}, psk {})",
            self.mode,
            self.auth_mode,
            self.psk.is_some()
        );

        Ok(Arc::new(TlsConfig {
            mode: self.mode,
            auth_mode: self.auth_mode,
            server_name: self.server_name,
            psk: self.psk,
            psk_ciphers: self.psk_ciphers,
            client,
            server,
        }))
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut store = RootCertStore::empty();
        for cert in &self.roots {
            store
                .add(cert.clone())
                .map_err(|e| Error::Config(format!("Invalid CA certificate: {}", e)))?;
        }
        Ok(store)
    }

    fn client_config(&self) -> Result<ClientConfig> {
        let provider = provider();
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?;

        let builder = if self.auth_mode == AuthMode::None {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureVerifier { provider }))
        } else if self.roots.is_empty() {
            // Nothing to verify against: every certificate is rejected.
            builder.with_root_certificates(RootCertStore::empty())
        } else {
            let verifier =
                WebPkiServerVerifier::builder_with_provider(Arc::new(self.root_store()?), provider)
                    .with_crls(self.crls.clone())
                    .build()
                    .map_err(|e| Error::Config(format!("Failed to build verifier: {}", e)))?;
            builder.with_webpki_verifier(verifier)
        };

        match &self.key {
            Some(key) => builder
                .with_client_auth_cert(self.certs.clone(), key.clone_key())
                .map_err(tls_error),
            None => Ok(builder.with_no_client_auth()),
        }
    }

    fn server_config(&self) -> Result<ServerConfig> {
        let provider = provider();
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?;

        let builder = if self.auth_mode != AuthMode::None && !self.roots.is_empty() {
            let mut verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(self.root_store()?), provider)
                    .with_crls(self.crls.clone());
            if self.auth_mode == AuthMode::Optional {
                verifier = verifier.allow_unauthenticated();
            }
            let verifier = verifier
                .build()
                .map_err(|e| Error::Config(format!("Failed to build verifier: {}", e)))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        match &self.key {
            Some(key) => builder
                .with_single_cert(self.certs.clone(), key.clone_key())
                .map_err(tls_error),
            None => Ok(builder.with_cert_resolver(Arc::new(NoCertificate))),
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn tls_error(e: rustls::Error) -> Error {
    Error::Config(format!("TLS configuration rejected: {}", e))
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to open {}: {}", path.display(), e)))
}

fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse certificates: {}", e)))
}

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

fn load_private_key(pem: &str, passphrase: Option<&str>) -> Result<PrivateKeyDer<'static>> {
    if pem.contains(ENCRYPTED_KEY_LABEL) {
        let passphrase = passphrase
            .ok_or_else(|| Error::Config("private key is encrypted, passphrase required".into()))?;
        return decrypt_private_key(pem, passphrase);
    }

    let items = rustls_pemfile::read_all(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("Failed to parse private key: {}", e)))?;

    for item in items {
        match item {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    Err(Error::Config("No valid private key found".into()))
}

fn decrypt_private_key(pem: &str, passphrase: &str) -> Result<PrivateKeyDer<'static>> {
    let (label, doc) = pkcs8::Document::from_pem(pem)
        .map_err(|e| Error::Config(format!("Failed to parse encrypted key: {}", e)))?;
    if label != ENCRYPTED_KEY_LABEL {
        return Err(Error::Config(format!("unexpected PEM label {}", label)));
    }
    let info = pkcs8::EncryptedPrivateKeyInfo::try_from(doc.as_bytes())
        .map_err(|e| Error::Config(format!("Failed to parse encrypted key: {}", e)))?;
    let secret = info
        .decrypt(passphrase.as_bytes())
        .map_err(|_| Error::Config("Failed to decrypt private key (wrong passphrase?)".into()))?;
    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        secret.as_bytes().to_vec(),
    )))
}

/// Server without a certificate: every handshake is refused.
#[derive(Debug)]
struct NoCertificate;

impl ResolvesServerCert for NoCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        None
    }
}

/// Accepts any server certificate. Handshake signatures are still checked
/// against the presented key.
#[derive(Debug)]
struct InsecureVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA: &str = include_str!("../../tests/certs/ca.crt");
    const SERVER_CERT: &str = include_str!("../../tests/certs/server.crt");
    const SERVER_KEY: &str = include_str!("../../tests/certs/server.key");
    const SERVER_KEY_ENCRYPTED: &str = include_str!("../../tests/certs/server-encrypted.key");

    #[test]
    fn test_defaults() {
        let client = TlsConfig::client().unwrap();
        assert_eq!(client.mode(), TlsMode::Client);
        assert_eq!(client.auth_mode(), AuthMode::Required);
        assert!(client.rustls_client().is_some());
        assert!(client.rustls_server().is_none());

        let server = TlsConfig::server().unwrap();
        assert_eq!(server.auth_mode(), AuthMode::None);
        assert!(server.rustls_server().is_some());
    }

    #[test]
    fn test_server_with_cert_and_ca() {
        let config = TlsConfig::builder(TlsMode::Server)
            .own_cert(SERVER_CERT, SERVER_KEY, None)
            .unwrap()
            .ca_chain(CA, None)
            .unwrap()
            .auth_mode(AuthMode::Required)
            .build()
            .unwrap();
        assert_eq!(config.auth_mode(), AuthMode::Required);
    }

    #[test]
    fn test_encrypted_key() {
        assert!(TlsConfig::builder(TlsMode::Server)
            .own_cert(SERVER_CERT, SERVER_KEY_ENCRYPTED, Some("loomwire"))
            .is_ok());
        assert!(matches!(
            TlsConfig::builder(TlsMode::Server).own_cert(SERVER_CERT, SERVER_KEY_ENCRYPTED, None),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            TlsConfig::builder(TlsMode::Server).own_cert(
                SERVER_CERT,
                SERVER_KEY_ENCRYPTED,
                Some("wrong")
            ),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_bad_credentials() {
        assert!(TlsConfig::builder(TlsMode::Client)
            .ca_chain("not a pem", None)
            .is_err());
        assert!(TlsConfig::builder(TlsMode::Client).psk("", b"key").is_err());
        assert!(TlsConfig::builder(TlsMode::Client)
            .psk(&"x".repeat(256), b"key")
            .is_err());
        assert!(TlsConfig::builder(TlsMode::Client).psk("id", b"").is_err());
        assert!(TlsConfig::builder(TlsMode::Client)
            .auth_mode(AuthMode::Optional)
            .build()
            .is_err());
        assert!(TlsConfig::builder(TlsMode::Client)
            .server_name("not a valid name!")
            .build()
            .is_err());
    }

    #[test]
    fn test_psk_shortcuts() {
        let config = TlsConfig::psk_client("device-7", b"0123456789abcdef").unwrap();
        let psk = config.psk().unwrap();
        assert_eq!(psk.identity, "device-7");
        assert_eq!(config.psk_ciphers()[0], CipherKind::ChaCha20Poly1305);
        assert!(format!("{:?}", config).contains("device-7"));
        assert!(!format!("{:?}", config).contains("0123456789abcdef"));
    }
}
