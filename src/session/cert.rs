//! Certificate-authenticated sessions driven by rustls
//!
//! rustls never touches a socket here. Ciphertext from the lower stream is
//! pushed in with `read_tls`, and records to transmit are pulled out with
//! `write_tls`.

use std::io::{self, Read, Write};
use std::sync::Arc;

use tokio_rustls::rustls::{self, pki_types::ServerName, ClientConnection, ServerConnection};
use tracing::{debug, warn};

use super::{AuthMode, Readable, RecordLayer, TlsConfig, TlsMode};
use crate::error::{Error, Result};

enum Engine {
    Client(ClientConnection),
    Server(ServerConnection),
}

macro_rules! with_engine {
    ($engine:expr, $conn:ident => $body:expr) => {
        match $engine {
            Engine::Client($conn) => $body,
            Engine::Server($conn) => $body,
        }
    };
}

pub(crate) struct CertSession {
    engine: Engine,
    /// Ciphertext rustls has not taken yet
    backlog: Vec<u8>,
    verify_peer: bool,
}

impl CertSession {
    pub fn client(config: &TlsConfig, server_name: ServerName<'static>) -> Result<Self> {
        let rustls_config = config
            .rustls_client()
            .ok_or_else(|| Error::Config("not a client configuration".into()))?;
        let mut conn = ClientConnection::new(rustls_config, server_name)
            .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
        conn.set_buffer_limit(None);
        Ok(Self {
            engine: Engine::Client(conn),
            backlog: Vec::new(),
            verify_peer: config.auth_mode() != AuthMode::None,
        })
    }

    pub fn server(config: &TlsConfig) -> Result<Self> {
        let rustls_config: Arc<rustls::ServerConfig> = config
            .rustls_server()
            .ok_or_else(|| Error::Config("not a server configuration".into()))?;
        let mut conn =
            ServerConnection::new(rustls_config).map_err(|e| Error::HandshakeFailed(e.to_string()))?;
        conn.set_buffer_limit(None);
        Ok(Self {
            engine: Engine::Server(conn),
            backlog: Vec::new(),
            verify_peer: config.auth_mode() != AuthMode::None,
        })
    }

    fn mode(&self) -> TlsMode {
        match self.engine {
            Engine::Client(_) => TlsMode::Client,
            Engine::Server(_) => TlsMode::Server,
        }
    }

    /// Hand as much of the backlog to rustls as it will take right now
    fn absorb(&mut self) -> Result<()> {
        while !self.backlog.is_empty() {
            let wants_read = with_engine!(&self.engine, c => c.wants_read());
            if !wants_read {
                break;
            }
            let mut rd = &self.backlog[..];
            let n = with_engine!(&mut self.engine, c => c.read_tls(&mut rd))?;
            self.backlog.drain(..n);

            let processed = with_engine!(&mut self.engine, c => c.process_new_packets());
            if let Err(e) = processed {
                warn!("{:?} TLS session failed: {}", self.mode(), e);
                return Err(Error::HandshakeFailed(e.to_string()));
            }
            if n == 0 {
                break;
            }
        }
        Ok(())
    }
}

impl RecordLayer for CertSession {
    fn is_handshaking(&self) -> bool {
        with_engine!(&self.engine, c => c.is_handshaking())
    }

    fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.backlog.extend_from_slice(data);
        self.absorb()
    }

    fn wants_write(&self) -> bool {
        with_engine!(&self.engine, c => c.wants_write())
    }

    fn take_output(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while self.wants_write() {
            // Writing into a Vec cannot fail.
            if with_engine!(&mut self.engine, c => c.write_tls(&mut out)).is_err() {
                break;
            }
        }
        out
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> Result<Readable> {
        for _ in 0..2 {
            let read = with_engine!(&mut self.engine, c => c.reader().read(buf));
            match read {
                Ok(0) => return Ok(Readable::Closed),
                Ok(n) => return Ok(Readable::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.absorb()?,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Readable::Closed),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Readable::Pending)
    }

    fn write_plaintext(&mut self, data: &[u8]) -> Result<()> {
        with_engine!(&mut self.engine, c => c.writer().write_all(data))?;
        Ok(())
    }

    fn send_close(&mut self) {
        with_engine!(&mut self.engine, c => c.send_close_notify());
    }

    fn peer_verified(&self) -> bool {
        if self.is_handshaking() {
            return false;
        }
        match &self.engine {
            Engine::Client(_) => self.verify_peer,
            Engine::Server(c) => {
                let verified = self.verify_peer && c.peer_certificates().is_some();
                debug!("Client certificate verified: {}", verified);
                verified
            }
        }
    }

    fn psk_identity(&self) -> Option<String> {
        None
    }
}
