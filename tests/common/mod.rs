#![allow(dead_code)]

use std::sync::Arc;

use bytes::BytesMut;

use loomwire::common::{Configurable, MessagePipe, OptionName};
use loomwire::session::{AuthMode, TlsConfig, TlsMode};
use loomwire::transport::{self, Dialer, Listener, StreamConnection};
use loomwire::{AsyncOp, Error};

pub const CA: &str = include_str!("../certs/ca.crt");
pub const OTHER_CA: &str = include_str!("../certs/other-ca.crt");
pub const SERVER_CERT: &str = include_str!("../certs/server.crt");
pub const SERVER_KEY: &str = include_str!("../certs/server.key");
pub const CLIENT_CERT: &str = include_str!("../certs/client.crt");
pub const CLIENT_KEY: &str = include_str!("../certs/client.key");

/// Bind `url` and return the listener with its real port
pub fn listen(url: &str) -> (Box<dyn Listener>, u16) {
    let listener = transport::listener(url).unwrap();
    listener.listen().unwrap();
    let port = listener.get_addr(OptionName::LocalAddr).unwrap().port();
    (listener, port)
}

/// Run an accept and a dial together and return both results
pub fn connect(listener: &dyn Listener, dialer: &dyn Dialer) -> (AsyncOp, AsyncOp) {
    let accepted = AsyncOp::new();
    let dialed = AsyncOp::new();
    listener.accept(&accepted);
    dialer.dial(&dialed);
    accepted.wait();
    dialed.wait();
    (accepted, dialed)
}

/// Connect and unwrap both ends: (server side, client side)
pub fn pair(
    listener: &dyn Listener,
    dialer: &dyn Dialer,
) -> (Box<dyn StreamConnection>, Box<dyn StreamConnection>) {
    let (accepted, dialed) = connect(listener, dialer);
    accepted.result().unwrap();
    dialed.result().unwrap();
    (
        accepted.take_connection(0).unwrap(),
        dialed.take_connection(0).unwrap(),
    )
}

/// NoDelay on, KeepAlive off, both settable, neither readable as an int
pub fn check_stream_defaults<T: Configurable + ?Sized>(target: &T) {
    assert!(target.get_bool(OptionName::NoDelay).unwrap());
    assert!(!target.get_bool(OptionName::KeepAlive).unwrap());
    target.set_bool(OptionName::KeepAlive, true).unwrap();
    assert!(target.get_bool(OptionName::KeepAlive).unwrap());
    assert!(matches!(
        target.get_int(OptionName::NoDelay),
        Err(Error::TypeMismatch { .. })
    ));
    assert!(matches!(
        target.set_int(OptionName::KeepAlive, 1),
        Err(Error::TypeMismatch { .. })
    ));
}

pub fn send_all(conn: &dyn StreamConnection, data: &[u8]) {
    let op = AsyncOp::new();
    op.set_iov(vec![BytesMut::from(data)]);
    conn.send(&op);
    op.wait();
    op.result().unwrap();
    assert_eq!(op.transferred(), data.len());
}

/// Read exactly `len` bytes
pub fn recv_exact(conn: &dyn StreamConnection, len: usize) -> Vec<u8> {
    let op = AsyncOp::new();
    let mut out = Vec::new();
    while out.len() < len {
        op.set_iov(vec![BytesMut::zeroed(len - out.len())]);
        conn.recv(&op);
        op.wait();
        op.result().unwrap();
        out.extend_from_slice(&op.received());
    }
    out
}

pub fn pipe_send(pipe: &MessagePipe, data: &[u8]) -> loomwire::Result<()> {
    let op = AsyncOp::new();
    op.set_iov(vec![BytesMut::from(data)]);
    pipe.send(&op);
    op.wait();
    op.result()
}

pub fn pipe_recv(pipe: &MessagePipe) -> loomwire::Result<Vec<u8>> {
    let op = AsyncOp::new();
    pipe.recv(&op);
    op.wait();
    op.result()?;
    Ok(op.take_message(0).unwrap().to_vec())
}

pub fn server_config(auth: AuthMode) -> Arc<TlsConfig> {
    TlsConfig::builder(TlsMode::Server)
        .own_cert(SERVER_CERT, SERVER_KEY, None)
        .unwrap()
        .ca_chain(CA, None)
        .unwrap()
        .auth_mode(auth)
        .build()
        .unwrap()
}

pub fn client_config(ca: &str, with_cert: bool) -> Arc<TlsConfig> {
    let mut builder = TlsConfig::builder(TlsMode::Client).ca_chain(ca, None).unwrap();
    if with_cert {
        builder = builder.own_cert(CLIENT_CERT, CLIENT_KEY, None).unwrap();
    }
    builder.build().unwrap()
}
