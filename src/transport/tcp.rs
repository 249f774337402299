//! TCP transport: `tcp`, `tcp4` and `tcp6`

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::SockRef;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, trace};

use super::{Dialer, Listener, StreamConnection, Transport};
use crate::aio::{pool, AsyncOp, Completion, Lane, OpKind, Output};
use crate::common::{
    BindTarget, CloseSignal, Configurable, DialTarget, OptionName, OptionValue, Resolver,
    StreamOptions, SystemResolver, Url,
};
use crate::error::{Error, Result};
use crate::metrics;

const LISTEN_BACKLOG: u32 = 128;

/// TCP transport - raw TCP connections
pub struct TcpTransport {
    scheme: String,
}

impl TcpTransport {
    pub fn new(scheme: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
        }
    }
}

impl Transport for TcpTransport {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn dialer(&self, url: &Url) -> Result<Box<dyn Dialer>> {
        Ok(Box::new(TcpDialer::new(url)?))
    }

    fn listener(&self, url: &Url) -> Result<Box<dyn Listener>> {
        Ok(Box::new(TcpListener::new(url)?))
    }
}

fn configure_stream(stream: &TcpStream, options: &StreamOptions) -> Result<()> {
    // Disable Nagle's algorithm unless asked not to
    stream.set_nodelay(options.nodelay)?;
    SockRef::from(stream).set_keepalive(options.keepalive)?;
    Ok(())
}

/// Outgoing TCP connections to one URL
pub struct TcpDialer {
    url: Url,
    target: DialTarget,
    options: Mutex<StreamOptions>,
    resolver: Arc<dyn Resolver>,
    closer: CloseSignal,
}

impl TcpDialer {
    pub fn new(url: &Url) -> Result<Self> {
        Ok(Self {
            url: url.clone(),
            target: url.dial_target()?,
            options: Mutex::new(StreamOptions::default()),
            resolver: Arc::new(SystemResolver),
            closer: CloseSignal::new(),
        })
    }

    /// Resolve host names with `resolver` instead of the system resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

async fn connect(
    resolver: &dyn Resolver,
    target: &DialTarget,
    options: &StreamOptions,
) -> Result<TcpStream> {
    let remotes = resolver
        .resolve(&target.remote, target.port, target.family)
        .await?;
    let mut locals = Vec::new();
    for host in &target.local {
        locals.extend(resolver.resolve(host, 0, target.family).await?);
    }

    let mut last_err = Error::AddressInvalid(format!(
        "no local address usable for {}",
        target.remote
    ));
    for remote in remotes {
        let local = locals.iter().copied().find(|l| l.is_ipv4() == remote.is_ipv4());
        if !locals.is_empty() && local.is_none() {
            continue;
        }
        match connect_one(remote, local).await {
            Ok(stream) => {
                configure_stream(&stream, options)?;
                return Ok(stream);
            }
            Err(e) => {
                debug!("Connect to {} failed: {}", remote, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

async fn connect_one(remote: SocketAddr, local: Option<SocketAddr>) -> Result<TcpStream> {
    let socket = if remote.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(local) = local {
        socket.bind(local)?;
    }
    Ok(socket.connect(remote).await?)
}

impl Dialer for TcpDialer {
    fn dial(&self, aio: &AsyncOp) {
        let Some(sub) = aio.begin(OpKind::Dial) else {
            return;
        };
        if self.closer.is_closed() {
            return sub.finish(Err(Error::State("dialer closed".into())));
        }

        let target = self.target.clone();
        let options = self.options.lock().clone();
        let resolver = self.resolver.clone();
        let closer = self.closer.clone();
        let scheme = self.url.scheme().to_string();

        sub.spawn(None, async move {
            closer
                .guard(async {
                    let stream = connect(&*resolver, &target, &options).await?;
                    let conn = TcpConnection::new(stream, options)?;
                    debug!("Dialed {} from {}", conn.remote_addr(), conn.local_addr());
                    metrics::DIALS_TOTAL.with_label_values(&[&scheme]).inc();
                    Ok(Completion::output(Output::Connection(Box::new(conn))))
                })
                .await
        });
    }

    fn close(&self) {
        if self.closer.close() {
            trace!("Dialer for {} closed", self.url);
        }
    }
}

impl Configurable for TcpDialer {
    fn option(&self, name: OptionName) -> Result<OptionValue> {
        if let Some(value) = self.options.lock().get(name) {
            return Ok(value);
        }
        match name {
            OptionName::Url => Ok(OptionValue::String(self.url.to_string())),
            _ => Err(Error::NotSupported(name.to_string())),
        }
    }

    fn set_option_value(&self, name: OptionName, value: OptionValue) -> Result<()> {
        if self.options.lock().set(name, &value) {
            Ok(())
        } else {
            Err(Error::NotSupported(name.to_string()))
        }
    }
}

impl Drop for TcpDialer {
    fn drop(&mut self) {
        self.closer.close();
    }
}

/// An established TCP stream
pub struct TcpConnection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    stream: TcpStream,
    local: SocketAddr,
    remote: SocketAddr,
    options: Mutex<StreamOptions>,
    closer: CloseSignal,
    tx: Lane,
    rx: Lane,
}

impl TcpConnection {
    pub(crate) fn new(stream: TcpStream, options: StreamOptions) -> Result<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        Ok(Self {
            inner: Arc::new(ConnInner {
                stream,
                local,
                remote,
                options: Mutex::new(options),
                closer: CloseSignal::new(),
                tx: Lane::default(),
                rx: Lane::default(),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }
}

/// Tracks a send in progress. Dropped partway through, it closes the
/// connection: the peer already holds a prefix of the buffer and the stream
/// can no longer be resynchronised.
struct WriteProgress<'a> {
    conn: &'a ConnInner,
    written: usize,
    total: usize,
}

impl Drop for WriteProgress<'_> {
    fn drop(&mut self) {
        if self.written > 0 && self.written < self.total {
            debug!(
                "Send to {} interrupted after {} of {} bytes, closing",
                self.conn.remote, self.written, self.total
            );
            self.conn.shutdown();
        }
    }
}

impl ConnInner {
    async fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut progress = WriteProgress {
            conn: self,
            written: 0,
            total: data.len(),
        };
        while progress.written < data.len() {
            self.stream.writable().await?;
            match self.stream.try_write(&data[progress.written..]) {
                Ok(n) => progress.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.closer.close() {
            trace!("Closing {} -> {}", self.local, self.remote);
            // The peer may already be gone; nothing to report then.
            let _ = SockRef::from(&self.stream).shutdown(Shutdown::Both);
        }
    }

    async fn read_some(&self, capacity: usize) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(capacity);
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(&mut buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf.freeze());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl StreamConnection for TcpConnection {
    fn send(&self, aio: &AsyncOp) {
        let Some(sub) = aio.begin(OpKind::Send) else {
            return;
        };
        let Some((sub, lane)) = sub.admit(self.is_closed(), &self.inner.tx) else {
            return;
        };
        let data = sub.payload();
        if data.is_empty() {
            drop(lane);
            return sub.finish(Ok(Completion::sent(0)));
        }

        let timeout = self.inner.options.lock().send_timeout;
        let inner = self.inner.clone();
        sub.spawn(timeout, async move {
            let _lane = lane;
            inner.closer.guard(inner.write_all(&data)).await?;
            metrics::BYTES_SENT.inc_by(data.len() as u64);
            Ok(Completion::sent(data.len()))
        });
    }

    fn recv(&self, aio: &AsyncOp) {
        let Some(sub) = aio.begin(OpKind::Recv) else {
            return;
        };
        let Some((sub, lane)) = sub.admit(self.is_closed(), &self.inner.rx) else {
            return;
        };
        let capacity = sub.capacity();
        if capacity == 0 {
            drop(lane);
            return sub.finish(Ok(Completion::received(Bytes::new())));
        }

        let timeout = self.inner.options.lock().recv_timeout;
        let inner = self.inner.clone();
        sub.spawn(timeout, async move {
            let _lane = lane;
            let data = inner.closer.guard(inner.read_some(capacity)).await?;
            metrics::BYTES_RECEIVED.inc_by(data.len() as u64);
            Ok(Completion::received(data))
        });
    }

    fn close(&self) {
        self.inner.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.inner.closer.is_closed()
    }
}

impl Configurable for TcpConnection {
    fn option(&self, name: OptionName) -> Result<OptionValue> {
        if let Some(value) = self.inner.options.lock().get(name) {
            return Ok(value);
        }
        match name {
            OptionName::LocalAddr => Ok(OptionValue::Addr(self.inner.local)),
            OptionName::RemoteAddr => Ok(OptionValue::Addr(self.inner.remote)),
            _ => Err(Error::NotSupported(name.to_string())),
        }
    }

    fn set_option_value(&self, name: OptionName, value: OptionValue) -> Result<()> {
        match (name, &value) {
            (OptionName::NoDelay, OptionValue::Bool(on)) => self.inner.stream.set_nodelay(*on)?,
            (OptionName::KeepAlive, OptionValue::Bool(on)) => {
                SockRef::from(&self.inner.stream).set_keepalive(*on)?
            }
            _ => {}
        }
        if self.inner.options.lock().set(name, &value) {
            Ok(())
        } else {
            Err(Error::NotSupported(name.to_string()))
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Accepts TCP connections on one bound address
pub struct TcpListener {
    url: Url,
    target: BindTarget,
    options: Mutex<StreamOptions>,
    state: Mutex<ListenState>,
    closer: CloseSignal,
}

enum ListenState {
    Idle,
    Listening {
        socket: Arc<tokio::net::TcpListener>,
        local: SocketAddr,
    },
    Closed,
}

impl ListenState {
    fn socket(&self) -> Result<Arc<tokio::net::TcpListener>> {
        match self {
            ListenState::Listening { socket, .. } => Ok(socket.clone()),
            ListenState::Idle => Err(Error::State("not listening".into())),
            ListenState::Closed => Err(Error::ConnectionClosed),
        }
    }

    fn local(&self) -> Option<SocketAddr> {
        match self {
            ListenState::Listening { local, .. } => Some(*local),
            _ => None,
        }
    }
}

impl TcpListener {
    pub fn new(url: &Url) -> Result<Self> {
        Ok(Self {
            url: url.clone(),
            target: url.bind_target()?,
            options: Mutex::new(StreamOptions::default()),
            state: Mutex::new(ListenState::Idle),
            closer: CloseSignal::new(),
        })
    }

    /// Bound address, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().local()
    }
}

fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}

impl Listener for TcpListener {
    fn listen(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ListenState::Idle => {}
            ListenState::Listening { .. } => return Err(Error::State("already listening".into())),
            ListenState::Closed => return Err(Error::State("listener closed".into())),
        }

        let addrs = self
            .target
            .host
            .resolve_blocking(self.target.port, self.target.family)?;
        // Registering with the reactor needs the pool's runtime context.
        let handle = pool::handle()?;
        let _enter = handle.enter();

        let mut last_err = None;
        for addr in addrs {
            match bind(addr).and_then(|socket| Ok((socket.local_addr()?, socket))) {
                Ok((local, socket)) => {
                    debug!("Listening on {}", local);
                    *state = ListenState::Listening {
                        socket: Arc::new(socket),
                        local,
                    };
                    return Ok(());
                }
                Err(e) => {
                    debug!("Bind to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::AddressInvalid(self.url.to_string())))
    }

    fn accept(&self, aio: &AsyncOp) {
        let Some(sub) = aio.begin(OpKind::Accept) else {
            return;
        };
        let socket = self.state.lock().socket();
        let socket = match socket {
            Ok(socket) => socket,
            Err(e) => return sub.finish(Err(e)),
        };

        let options = self.options.lock().clone();
        let closer = self.closer.clone();
        let scheme = self.url.scheme().to_string();

        sub.spawn(None, async move {
            closer
                .guard(async {
                    let (stream, peer) = socket.accept().await?;
                    configure_stream(&stream, &options)?;
                    let conn = TcpConnection::new(stream, options)?;
                    debug!("Accepted {}", peer);
                    metrics::ACCEPTS_TOTAL.with_label_values(&[&scheme]).inc();
                    Ok(Completion::output(Output::Connection(Box::new(conn))))
                })
                .await
        });
    }

    fn close(&self) {
        if self.closer.close() {
            trace!("Listener for {} closed", self.url);
        }
        *self.state.lock() = ListenState::Closed;
    }
}

impl Configurable for TcpListener {
    fn option(&self, name: OptionName) -> Result<OptionValue> {
        if let Some(value) = self.options.lock().get(name) {
            return Ok(value);
        }
        match name {
            OptionName::LocalAddr => self
                .local_addr()
                .map(OptionValue::Addr)
                .ok_or_else(|| Error::State("not listening".into())),
            OptionName::Url => Ok(OptionValue::String(match self.local_addr() {
                Some(local) => self.url.bound(local),
                None => self.url.to_string(),
            })),
            _ => Err(Error::NotSupported(name.to_string())),
        }
    }

    fn set_option_value(&self, name: OptionName, value: OptionValue) -> Result<()> {
        if self.options.lock().set(name, &value) {
            Ok(())
        } else {
            Err(Error::NotSupported(name.to_string()))
        }
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::common::{Family, Host};

    /// Answers for one name only
    struct StaticResolver {
        name: &'static str,
        ip: IpAddr,
    }

    #[async_trait]
    impl Resolver for StaticResolver {
        async fn resolve(&self, host: &Host, port: u16, _family: Family) -> Result<Vec<SocketAddr>> {
            match host {
                Host::Domain(name) if name == self.name => Ok(vec![SocketAddr::new(self.ip, port)]),
                Host::Ip(ip) => Ok(vec![SocketAddr::new(*ip, port)]),
                other => Err(Error::AddressInvalid(other.to_string())),
            }
        }
    }

    fn listening() -> TcpListener {
        let listener = TcpListener::new(&Url::parse("tcp://127.0.0.1:0").unwrap()).unwrap();
        listener.listen().unwrap();
        listener
    }

    #[test]
    fn test_listen_ephemeral_port() {
        let listener = listening();
        let local = listener.get_addr(OptionName::LocalAddr).unwrap();
        assert_ne!(local.port(), 0);
        assert_eq!(listener.get_addr(OptionName::LocalAddr).unwrap(), local);
        assert_eq!(
            listener.get_string(OptionName::Url).unwrap(),
            format!("tcp://127.0.0.1:{}", local.port())
        );
        assert!(matches!(listener.listen(), Err(Error::State(_))));
    }

    #[test]
    fn test_address_in_use() {
        let first = listening();
        let port = first.local_addr().unwrap().port();
        let second =
            TcpListener::new(&Url::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap()).unwrap();
        assert!(matches!(second.listen(), Err(Error::AddressInUse(_))));
    }

    #[test]
    fn test_accept_before_listen() {
        let listener = TcpListener::new(&Url::parse("tcp://127.0.0.1:0").unwrap()).unwrap();
        let aio = AsyncOp::new();
        listener.accept(&aio);
        aio.wait();
        assert!(matches!(aio.result(), Err(Error::State(_))));
    }

    #[test]
    fn test_close_aborts_accept() {
        let listener = listening();
        let aio = AsyncOp::new();
        listener.accept(&aio);
        std::thread::sleep(Duration::from_millis(20));
        listener.close();
        aio.wait();
        assert!(matches!(aio.result(), Err(Error::Canceled)));
        assert!(matches!(listener.listen(), Err(Error::State(_))));
    }

    #[test]
    fn test_refused() {
        let port = {
            let listener = listening();
            listener.local_addr().unwrap().port()
        };
        let dialer = TcpDialer::new(&Url::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap())
            .unwrap();
        let aio = AsyncOp::new();
        dialer.dial(&aio);
        aio.wait();
        assert!(matches!(aio.result(), Err(Error::ConnectionRefused)));
    }

    #[test]
    fn test_dialer_options() {
        let dialer = TcpDialer::new(&Url::parse("tcp://127.0.0.1:80").unwrap()).unwrap();
        assert!(dialer.get_bool(OptionName::NoDelay).unwrap());
        assert!(!dialer.get_bool(OptionName::KeepAlive).unwrap());
        assert!(matches!(
            dialer.get_addr(OptionName::LocalAddr),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(dialer.get_tls(), Err(Error::NotSupported(_))));
    }

    #[test]
    fn test_dial_through_custom_resolver() {
        let listener = listening();
        let port = listener.local_addr().unwrap().port();
        let resolver = Arc::new(StaticResolver {
            name: "loomwire.test",
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        });

        let url = Url::parse(&format!("tcp://loomwire.test:{}", port)).unwrap();
        let dialer = TcpDialer::new(&url).unwrap().with_resolver(resolver.clone());
        let accepted = AsyncOp::new();
        let dialed = AsyncOp::new();
        listener.accept(&accepted);
        dialer.dial(&dialed);
        dialed.wait();
        accepted.wait();
        dialed.result().unwrap();
        accepted.result().unwrap();
        let conn = dialed.take_connection(0).unwrap();
        assert_eq!(
            conn.get_addr(OptionName::RemoteAddr).unwrap(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
        );

        let unknown = Url::parse(&format!("tcp://elsewhere.test:{}", port)).unwrap();
        let dialer = TcpDialer::new(&unknown).unwrap().with_resolver(resolver);
        let aio = AsyncOp::new();
        dialer.dial(&aio);
        aio.wait();
        assert!(matches!(aio.result(), Err(Error::AddressInvalid(_))));
    }
}
