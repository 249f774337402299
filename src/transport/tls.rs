//! TLS transport: `tls+tcp`, `tls+tcp4` and `tls+tcp6`
//!
//! Built entirely from the dialer, listener and connection of the transport
//! named by the scheme without its `tls+` prefix. The handshake runs before a
//! dial or accept completes, so callers only ever see established sessions.
//!
//! ```text
//!  caller ops ──▶ TlsConnection ──(Pump)──▶ lower StreamConnection
//!                      │
//!                 RecordLayer (rustls or PSK engine)
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{debug, trace, warn};

use super::{registry, Dialer, Listener, StreamConnection, Transport};
use crate::aio::{self, pool, AsyncOp, Completion, Lane, OpKind, Output, Pump};
use crate::common::{CloseSignal, Configurable, Host, OptionName, OptionValue, Url};
use crate::error::{Error, Result};
use crate::metrics;
use crate::session::{self, Readable, RecordLayer, TlsConfig, TlsMode, TlsState};

/// Largest single read from the lower stream
const READ_CHUNK: usize = 16 * 1024 + 512;

/// How long close waits to deliver close-notify
const CLOSE_NOTIFY_TIMEOUT: Duration = Duration::from_millis(250);

/// TLS transport - secure sessions over a lower stream transport
pub struct TlsTransport {
    scheme: String,
}

impl TlsTransport {
    pub fn new(scheme: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
        }
    }
}

impl Transport for TlsTransport {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn dialer(&self, url: &Url) -> Result<Box<dyn Dialer>> {
        Ok(Box::new(TlsDialer::new(url)?))
    }

    fn listener(&self, url: &Url) -> Result<Box<dyn Listener>> {
        Ok(Box::new(TlsListener::new(url)?))
    }
}

/// `tls+tcp4` → `tcp4`
fn lower_url(url: &Url) -> Url {
    let scheme = url.scheme();
    url.with_scheme(scheme.strip_prefix("tls+").unwrap_or(scheme))
}

fn credential_mode(config: &TlsConfig) -> &'static str {
    if config.psk().is_some() {
        "psk"
    } else {
        "cert"
    }
}

/// Handshake errors other than cancellation and timeout become
/// `HandshakeFailed`.
fn handshake_error(err: Error) -> Error {
    match err {
        Error::Timeout | Error::Canceled | Error::HandshakeFailed(_) => err,
        other => Error::HandshakeFailed(other.to_string()),
    }
}

/// Outgoing TLS connections to one URL
pub struct TlsDialer {
    url: Url,
    lower: Arc<dyn Dialer>,
    server_name: Option<ServerName<'static>>,
    config: RwLock<Arc<TlsConfig>>,
    closer: CloseSignal,
}

impl TlsDialer {
    pub fn new(url: &Url) -> Result<Self> {
        let lower_url = lower_url(url);
        let lower: Arc<dyn Dialer> =
            Arc::from(registry::lookup(lower_url.scheme())?.dialer(&lower_url)?);
        let server_name = match url.dial_target()?.remote {
            Host::Ip(ip) => Some(ServerName::IpAddress(ip.into())),
            Host::Domain(name) => ServerName::try_from(name).ok(),
            Host::Wildcard => None,
        };
        Ok(Self {
            url: url.clone(),
            lower,
            server_name,
            config: RwLock::new(TlsConfig::client()?),
            closer: CloseSignal::new(),
        })
    }

    fn server_name(&self, config: &TlsConfig) -> Result<ServerName<'static>> {
        match config.server_name() {
            Some(name) => ServerName::try_from(name.to_string())
                .map_err(|_| Error::Config(format!("Invalid server name: {}", name))),
            None => self
                .server_name
                .clone()
                .ok_or_else(|| Error::Config(format!("no server name for {}", self.url))),
        }
    }
}

impl Dialer for TlsDialer {
    fn dial(&self, aio: &AsyncOp) {
        let Some(sub) = aio.begin(OpKind::Dial) else {
            return;
        };
        if self.closer.is_closed() {
            return sub.finish(Err(Error::State("dialer closed".into())));
        }
        let config = self.config.read().clone();
        let server_name = match self.server_name(&config) {
            Ok(name) => name,
            Err(e) => return sub.finish(Err(e)),
        };

        let lower = self.lower.clone();
        let closer = self.closer.clone();
        let scheme = self.url.scheme().to_string();
        sub.spawn(None, async move {
            closer
                .guard(async {
                    let op = AsyncOp::new();
                    aio::drive(&op, |op| lower.dial(op)).await?;
                    let conn = op
                        .take_connection(0)
                        .ok_or_else(|| Error::State("dial produced no connection".into()))?;
                    let engine = session::client_session(&config, server_name)
                        .map_err(handshake_error)?;
                    let tls = TlsConnection::establish(conn, engine, &config).await?;
                    metrics::DIALS_TOTAL.with_label_values(&[&scheme]).inc();
                    Ok(Completion::output(Output::Connection(Box::new(tls))))
                })
                .await
        });
    }

    fn close(&self) {
        if self.closer.close() {
            trace!("Dialer for {} closed", self.url);
        }
        self.lower.close();
    }
}

impl Configurable for TlsDialer {
    fn option(&self, name: OptionName) -> Result<OptionValue> {
        match name {
            OptionName::TlsConfig => Ok(OptionValue::Tls(self.config.read().clone())),
            OptionName::Url => Ok(OptionValue::String(self.url.to_string())),
            OptionName::TlsVerified | OptionName::TlsPskIdentity => {
                Err(Error::NotSupported(name.to_string()))
            }
            _ => self.lower.option(name),
        }
    }

    fn set_option_value(&self, name: OptionName, value: OptionValue) -> Result<()> {
        match value {
            OptionValue::Tls(config) => {
                if config.mode() != TlsMode::Client {
                    return Err(Error::Config("dialer needs a client TLS configuration".into()));
                }
                *self.config.write() = config;
                Ok(())
            }
            value => self.lower.set_option_value(name, value),
        }
    }
}

impl Drop for TlsDialer {
    fn drop(&mut self) {
        self.closer.close();
    }
}

/// Accepts TLS connections on one bound address
pub struct TlsListener {
    url: Url,
    lower: Arc<dyn Listener>,
    config: RwLock<Arc<TlsConfig>>,
    closer: CloseSignal,
}

impl TlsListener {
    pub fn new(url: &Url) -> Result<Self> {
        let lower_url = lower_url(url);
        let lower: Arc<dyn Listener> =
            Arc::from(registry::lookup(lower_url.scheme())?.listener(&lower_url)?);
        Ok(Self {
            url: url.clone(),
            lower,
            config: RwLock::new(TlsConfig::server()?),
            closer: CloseSignal::new(),
        })
    }
}

impl Listener for TlsListener {
    fn listen(&self) -> Result<()> {
        if self.closer.is_closed() {
            return Err(Error::State("listener closed".into()));
        }
        self.lower.listen()
    }

    fn accept(&self, aio: &AsyncOp) {
        let Some(sub) = aio.begin(OpKind::Accept) else {
            return;
        };
        if self.closer.is_closed() {
            return sub.finish(Err(Error::ConnectionClosed));
        }

        let config = self.config.read().clone();
        let lower = self.lower.clone();
        let closer = self.closer.clone();
        let scheme = self.url.scheme().to_string();
        sub.spawn(None, async move {
            closer
                .guard(async {
                    let op = AsyncOp::new();
                    aio::drive(&op, |op| lower.accept(op)).await?;
                    let conn = op
                        .take_connection(0)
                        .ok_or_else(|| Error::State("accept produced no connection".into()))?;
                    let engine = session::server_session(&config).map_err(handshake_error)?;
                    let tls = TlsConnection::establish(conn, engine, &config).await?;
                    metrics::ACCEPTS_TOTAL.with_label_values(&[&scheme]).inc();
                    Ok(Completion::output(Output::Connection(Box::new(tls))))
                })
                .await
        });
    }

    fn close(&self) {
        if self.closer.close() {
            trace!("Listener for {} closed", self.url);
        }
        self.lower.close();
    }
}

impl Configurable for TlsListener {
    fn option(&self, name: OptionName) -> Result<OptionValue> {
        match name {
            OptionName::TlsConfig => Ok(OptionValue::Tls(self.config.read().clone())),
            OptionName::Url => Ok(OptionValue::String(
                match self.lower.get_addr(OptionName::LocalAddr) {
                    Ok(local) => self.url.bound(local),
                    Err(_) => self.url.to_string(),
                },
            )),
            OptionName::TlsVerified | OptionName::TlsPskIdentity => {
                Err(Error::NotSupported(name.to_string()))
            }
            _ => self.lower.option(name),
        }
    }

    fn set_option_value(&self, name: OptionName, value: OptionValue) -> Result<()> {
        match value {
            OptionValue::Tls(config) => {
                if config.mode() != TlsMode::Server {
                    return Err(Error::Config(
                        "listener needs a server TLS configuration".into(),
                    ));
                }
                *self.config.write() = config;
                Ok(())
            }
            value => self.lower.set_option_value(name, value),
        }
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// An established TLS session over a lower stream
pub struct TlsConnection {
    inner: Arc<TlsInner>,
}

struct TlsInner {
    lower: Box<dyn StreamConnection>,
    engine: Mutex<Box<dyn RecordLayer>>,
    tx: tokio::sync::Mutex<Pump>,
    rx: tokio::sync::Mutex<Pump>,
    state: Mutex<TlsState>,
    closer: CloseSignal,
    tx_lane: Lane,
    rx_lane: Lane,
    verified: bool,
    psk_identity: Option<String>,
}

impl TlsConnection {
    /// Run the handshake over `lower`. On failure `lower` is dropped, which
    /// closes it.
    async fn establish(
        lower: Box<dyn StreamConnection>,
        engine: Box<dyn RecordLayer>,
        config: &TlsConfig,
    ) -> Result<Self> {
        let mut inner = TlsInner {
            lower,
            engine: Mutex::new(engine),
            tx: tokio::sync::Mutex::new(Pump::new()),
            rx: tokio::sync::Mutex::new(Pump::new()),
            state: Mutex::new(TlsState::Initial),
            closer: CloseSignal::new(),
            tx_lane: Lane::default(),
            rx_lane: Lane::default(),
            verified: false,
            psk_identity: None,
        };
        let mode = credential_mode(config);

        inner.set_state(TlsState::Handshaking);
        if let Err(e) = inner.handshake().await {
            inner.set_state(TlsState::Failed);
            metrics::HANDSHAKES_TOTAL
                .with_label_values(&[mode, "failed"])
                .inc();
            debug!("TLS handshake failed: {}", e);
            return Err(handshake_error(e));
        }
        metrics::HANDSHAKES_TOTAL.with_label_values(&[mode, "ok"]).inc();

        {
            let engine = inner.engine.lock();
            inner.verified = engine.peer_verified();
            inner.psk_identity = engine.psk_identity();
        }
        inner.set_state(TlsState::Established);
        debug!(
            "TLS session established ({}, verified {})",
            mode, inner.verified
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn state(&self) -> TlsState {
        *self.inner.state.lock()
    }

    /// Whether the peer authenticated during the handshake
    pub fn peer_verified(&self) -> bool {
        self.inner.verified
    }
}

impl TlsInner {
    fn set_state(&self, state: TlsState) {
        *self.state.lock() = state;
    }

    fn pending_output(&self) -> Vec<u8> {
        self.engine.lock().take_output()
    }

    fn handshaking(&self) -> bool {
        self.engine.lock().is_handshaking()
    }

    fn wants_write(&self) -> bool {
        self.engine.lock().wants_write()
    }

    fn feed(&self, data: &[u8]) -> Result<()> {
        self.engine.lock().feed(data)
    }

    fn seal(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut engine = self.engine.lock();
        engine.write_plaintext(data)?;
        Ok(engine.take_output())
    }

    fn read_buffered(&self, buf: &mut [u8]) -> Result<Readable> {
        self.engine.lock().read_plaintext(buf)
    }

    fn close_notify(&self) -> Vec<u8> {
        let mut engine = self.engine.lock();
        engine.send_close();
        engine.take_output()
    }

    fn check_usable(&self) -> Result<()> {
        match *self.state.lock() {
            TlsState::Failed => Err(Error::HandshakeFailed("session failed".into())),
            TlsState::Closing | TlsState::Closed => Err(Error::ConnectionClosed),
            _ => Ok(()),
        }
    }

    async fn handshake(&self) -> Result<()> {
        let mut tx = self.tx.lock().await;
        let mut rx = self.rx.lock().await;
        loop {
            let out = self.pending_output();
            if !out.is_empty() {
                tx.send(&*self.lower, &out).await?;
            }
            if !self.handshaking() {
                return Ok(());
            }
            let data = rx.recv(&*self.lower, READ_CHUNK).await?;
            if let Err(e) = self.feed(&data) {
                let alert = self.pending_output();
                if !alert.is_empty() {
                    // Best effort; the handshake has already failed.
                    let _ = tx.send(&*self.lower, &alert).await;
                }
                return Err(e);
            }
        }
    }

    /// Send whatever the engine queued outside of a plaintext write
    async fn flush(&self) -> Result<()> {
        let mut tx = self.tx.lock().await;
        let out = self.pending_output();
        if out.is_empty() {
            return Ok(());
        }
        tx.send(&*self.lower, &out).await
    }

    /// Encrypt and send `data`. Records are sealed only once the previous
    /// send has drained, so an interrupted write never leaves a gap in the
    /// record sequence. Once sealed, the ciphertext is delivered even if the
    /// op reports `Timeout` or `Canceled` meanwhile.
    async fn write(&self, data: Bytes) -> Result<Completion> {
        self.check_usable()?;
        let mut tx = self.tx.lock().await;
        tx.settle().await?;
        let out = self.seal(&data)?;
        tx.send(&*self.lower, &out).await?;
        Ok(Completion::sent(data.len()))
    }

    async fn read(&self, capacity: usize) -> Result<Completion> {
        let mut rx = self.rx.lock().await;
        let mut buf = BytesMut::zeroed(capacity);
        loop {
            self.check_usable()?;
            match self.read_buffered(&mut buf)? {
                Readable::Data(n) => {
                    buf.truncate(n);
                    return Ok(Completion::received(buf.freeze()));
                }
                Readable::Closed => {
                    trace!("close-notify received");
                    self.set_state(TlsState::Closed);
                    return Err(Error::ConnectionClosed);
                }
                Readable::Pending => {}
            }

            let data = match rx.recv(&*self.lower, READ_CHUNK).await {
                Ok(data) => data,
                Err(e @ (Error::ConnectionClosed | Error::ConnectionReset)) => {
                    self.set_state(TlsState::Closed);
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            let fed = self.feed(&data);
            if self.wants_write() {
                let flushed = self.flush().await;
                if fed.is_ok() {
                    flushed?;
                }
            }
            if let Err(e) = fed {
                warn!("TLS session failed: {}", e);
                self.set_state(TlsState::Failed);
                return Err(e);
            }
        }
    }

    async fn shutdown(&self) {
        let notify = async {
            let mut tx = self.tx.lock().await;
            let out = self.close_notify();
            if !out.is_empty() {
                tx.send(&*self.lower, &out).await?;
            }
            Ok::<_, Error>(())
        };
        match tokio::time::timeout(CLOSE_NOTIFY_TIMEOUT, notify).await {
            Ok(Ok(())) => trace!("close-notify sent"),
            Ok(Err(e)) => debug!("close-notify not sent: {}", e),
            Err(_) => debug!("close-notify timed out"),
        }
        self.lower.close();
        self.set_state(TlsState::Closed);
    }
}

impl StreamConnection for TlsConnection {
    fn send(&self, aio: &AsyncOp) {
        let Some(sub) = aio.begin(OpKind::Send) else {
            return;
        };
        let Some((sub, lane)) = sub.admit(self.is_closed(), &self.inner.tx_lane) else {
            return;
        };
        let data = sub.payload();
        if data.is_empty() {
            drop(lane);
            return sub.finish(Ok(Completion::sent(0)));
        }

        let timeout = self
            .inner
            .lower
            .get_duration(OptionName::SendTimeout)
            .ok()
            .flatten();
        let inner = self.inner.clone();
        sub.spawn(timeout, async move {
            let _lane = lane;
            inner.closer.guard(inner.write(data)).await
        });
    }

    fn recv(&self, aio: &AsyncOp) {
        let Some(sub) = aio.begin(OpKind::Recv) else {
            return;
        };
        let Some((sub, lane)) = sub.admit(self.is_closed(), &self.inner.rx_lane) else {
            return;
        };
        let capacity = sub.capacity();
        if capacity == 0 {
            drop(lane);
            return sub.finish(Ok(Completion::received(Bytes::new())));
        }

        let timeout = self
            .inner
            .lower
            .get_duration(OptionName::RecvTimeout)
            .ok()
            .flatten();
        let inner = self.inner.clone();
        sub.spawn(timeout, async move {
            let _lane = lane;
            inner.closer.guard(inner.read(capacity)).await
        });
    }

    fn close(&self) {
        if !self.inner.closer.close() {
            return;
        }
        self.inner.set_state(TlsState::Closing);
        let inner = self.inner.clone();
        match pool::handle() {
            Ok(handle) => {
                handle.spawn(async move { inner.shutdown().await });
            }
            Err(_) => {
                inner.lower.close();
                inner.set_state(TlsState::Closed);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closer.is_closed()
            || self.inner.lower.is_closed()
            || self.state() == TlsState::Closed
    }
}

impl Configurable for TlsConnection {
    fn option(&self, name: OptionName) -> Result<OptionValue> {
        match name {
            OptionName::TlsVerified => Ok(OptionValue::Bool(self.inner.verified)),
            OptionName::TlsPskIdentity => self
                .inner
                .psk_identity
                .clone()
                .map(OptionValue::String)
                .ok_or_else(|| Error::NotSupported(name.to_string())),
            OptionName::TlsConfig => Err(Error::NotSupported(name.to_string())),
            _ => self.inner.lower.option(name),
        }
    }

    fn set_option_value(&self, name: OptionName, value: OptionValue) -> Result<()> {
        match name {
            OptionName::TlsConfig => Err(Error::NotSupported(name.to_string())),
            _ => self.inner.lower.set_option_value(name, value),
        }
    }
}

impl Drop for TlsConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpDialer;

    fn psk_pair(client_key: &[u8], server_key: &[u8]) -> (AsyncOp, AsyncOp) {
        let listener = TlsListener::new(&Url::parse("tls+tcp://127.0.0.1:0").unwrap()).unwrap();
        listener
            .set_tls(TlsConfig::psk_server("unit", server_key).unwrap())
            .unwrap();
        listener.listen().unwrap();
        let port = listener.get_addr(OptionName::LocalAddr).unwrap().port();

        let dialer =
            TlsDialer::new(&Url::parse(&format!("tls+tcp://127.0.0.1:{}", port)).unwrap())
                .unwrap();
        dialer
            .set_tls(TlsConfig::psk_client("unit", client_key).unwrap())
            .unwrap();

        let accepted = AsyncOp::new();
        let dialed = AsyncOp::new();
        listener.accept(&accepted);
        dialer.dial(&dialed);
        accepted.wait();
        dialed.wait();
        (dialed, accepted)
    }

    #[test]
    fn test_psk_session_state() {
        let (dialed, accepted) = psk_pair(b"shared key", b"shared key");
        assert!(dialed.result().is_ok());
        assert!(accepted.result().is_ok());
        let conn = accepted.take_connection(0).unwrap();
        assert!(conn.get_bool(OptionName::TlsVerified).unwrap());
        assert_eq!(conn.get_string(OptionName::TlsPskIdentity).unwrap(), "unit");
        assert!(matches!(conn.get_tls(), Err(Error::NotSupported(_))));
    }

    #[test]
    fn test_mode_mismatch() {
        let dialer = TlsDialer::new(&Url::parse("tls+tcp://127.0.0.1:4433").unwrap()).unwrap();
        assert!(matches!(
            dialer.set_tls(TlsConfig::server().unwrap()),
            Err(Error::Config(_))
        ));
        let listener = TlsListener::new(&Url::parse("tls+tcp://127.0.0.1:0").unwrap()).unwrap();
        assert!(matches!(
            listener.set_tls(TlsConfig::client().unwrap()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_lower_options_delegated() {
        let dialer = TlsDialer::new(&Url::parse("tls+tcp://127.0.0.1:4433").unwrap()).unwrap();
        assert!(dialer.get_bool(OptionName::NoDelay).unwrap());
        dialer.set_bool(OptionName::NoDelay, false).unwrap();
        assert!(!dialer.get_bool(OptionName::NoDelay).unwrap());
        assert_eq!(
            dialer.get_string(OptionName::Url).unwrap(),
            "tls+tcp://127.0.0.1:4433"
        );
        assert!(matches!(
            dialer.get_bool(OptionName::TlsVerified),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_handshake_error_mapping() {
        assert!(matches!(handshake_error(Error::Timeout), Error::Timeout));
        assert!(matches!(handshake_error(Error::Canceled), Error::Canceled));
        assert!(matches!(
            handshake_error(Error::ConnectionClosed),
            Error::HandshakeFailed(_)
        ));
    }

    #[test]
    fn test_slow_handshake_ignores_receive_timeout() {
        let listener = TlsListener::new(&Url::parse("tls+tcp://127.0.0.1:0").unwrap()).unwrap();
        listener
            .set_tls(TlsConfig::psk_server("unit", b"key").unwrap())
            .unwrap();
        listener
            .set_duration(OptionName::RecvTimeout, Some(Duration::from_millis(50)))
            .unwrap();
        listener.listen().unwrap();
        let port = listener.get_addr(OptionName::LocalAddr).unwrap().port();

        let accepted = AsyncOp::new();
        listener.accept(&accepted);

        let raw = TcpDialer::new(&Url::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap())
            .unwrap();
        let dialed = AsyncOp::new();
        raw.dial(&dialed);
        dialed.wait();
        dialed.result().unwrap();
        let lower = dialed.take_connection(0).unwrap();

        // Stay silent well past the listener's receive timeout.
        std::thread::sleep(Duration::from_millis(200));
        let config = TlsConfig::psk_client("unit", b"key").unwrap();
        let server_name = ServerName::try_from("localhost").unwrap();
        let engine = session::client_session(&config, server_name).unwrap();
        let client = pool::handle()
            .unwrap()
            .block_on(TlsConnection::establish(lower, engine, &config))
            .unwrap();
        assert_eq!(client.state(), TlsState::Established);

        accepted.wait();
        accepted.result().unwrap();
        let server = accepted.take_connection(0).unwrap();

        // Application receives still honour the timeout.
        let op = AsyncOp::new();
        op.set_iov(vec![BytesMut::zeroed(4)]);
        server.recv(&op);
        op.wait();
        assert!(matches!(op.result(), Err(Error::Timeout)));
    }

    #[test]
    fn test_close_notify_marks_closed() {
        let (dialed, accepted) = psk_pair(b"shared key", b"shared key");
        let client = dialed.take_connection(0).unwrap();
        let server = accepted.take_connection(0).unwrap();
        client.close();

        let op = AsyncOp::new();
        op.set_iov(vec![BytesMut::zeroed(4)]);
        server.recv(&op);
        op.wait();
        assert!(matches!(op.result(), Err(Error::ConnectionClosed)));
        assert!(server.is_closed());
    }
}
