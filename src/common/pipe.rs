//! MessagePipe - length-prefixed messages over a stream connection
//!
//! ```text
//! +----------------+-----------------+
//! | length (u64 BE)| payload         |
//! +----------------+-----------------+
//! ```
//!
//! A message longer than the connection's `recv-size-max` is read off the
//! wire and dropped. The connection stays open and the pending receive keeps
//! waiting for the next message that fits.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use super::{CloseSignal, Configurable, OptionName, OptionValue};
use crate::aio::{AsyncOp, Completion, Lane, OpKind, Pump};
use crate::error::{Error, Result};
use crate::metrics;
use crate::transport::StreamConnection;

/// Size of the length header
pub const HEADER_LEN: usize = 8;

/// Largest single read from the connection
const READ_CHUNK: usize = 64 * 1024;

/// Message framing over one connection
pub struct MessagePipe {
    inner: Arc<PipeInner>,
}

struct PipeInner {
    conn: Box<dyn StreamConnection>,
    reader: tokio::sync::Mutex<FrameReader>,
    writer: tokio::sync::Mutex<Pump>,
    closer: CloseSignal,
    tx: Lane,
    rx: Lane,
}

/// Receive state. Lives in the pipe so an abandoned receive loses nothing.
struct FrameReader {
    pump: Pump,
    buf: BytesMut,
    /// Payload bytes of an oversized message still to drop
    discard: u64,
}

impl FrameReader {
    async fn next(&mut self, conn: &dyn StreamConnection) -> Result<Bytes> {
        loop {
            if self.discard > 0 {
                let n = self.buf.len().min(clamp(self.discard));
                self.buf.advance(n);
                self.discard -= n as u64;
                if self.discard > 0 {
                    self.fill(conn, clamp(self.discard).min(READ_CHUNK)).await?;
                    continue;
                }
            }

            if self.buf.len() >= HEADER_LEN {
                let len = (&self.buf[..HEADER_LEN]).get_u64();
                let max = conn.get_size(OptionName::RecvMaxSize).unwrap_or(0);
                if max > 0 && len > max as u64 {
                    debug!("Discarding {} byte message (limit {})", len, max);
                    metrics::MESSAGES_DISCARDED.inc();
                    self.buf.advance(HEADER_LEN);
                    self.discard = len;
                    continue;
                }
                let len = usize::try_from(len)
                    .map_err(|_| Error::Protocol(format!("message length {} too large", len)))?;
                if self.buf.len() >= HEADER_LEN + len {
                    self.buf.advance(HEADER_LEN);
                    return Ok(self.buf.split_to(len).freeze());
                }
                let missing = HEADER_LEN + len - self.buf.len();
                self.buf.reserve(missing);
                self.fill(conn, missing.min(READ_CHUNK)).await?;
                continue;
            }

            self.fill(conn, READ_CHUNK).await?;
        }
    }

    async fn fill(&mut self, conn: &dyn StreamConnection, size: usize) -> Result<()> {
        let data = self.pump.recv(conn, size).await?;
        self.buf.extend_from_slice(&data);
        Ok(())
    }
}

fn clamp(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

/// Closes the pipe if a send is abandoned halfway through a frame
struct SendGuard<'a> {
    inner: &'a PipeInner,
    done: bool,
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            debug!("Send abandoned mid-frame, closing pipe");
            self.inner.close();
        }
    }
}

impl PipeInner {
    fn close(&self) {
        if self.closer.close() {
            self.conn.close();
        }
    }

    async fn write(&self, payload: Bytes) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        let mut guard = SendGuard {
            inner: self,
            done: false,
        };
        let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
        frame.put_u64(payload.len() as u64);
        frame.extend_from_slice(&payload);
        writer.send(&*self.conn, &frame).await?;
        guard.done = true;
        Ok(payload.len())
    }
}

impl MessagePipe {
    pub fn new(conn: Box<dyn StreamConnection>) -> Self {
        Self {
            inner: Arc::new(PipeInner {
                conn,
                reader: tokio::sync::Mutex::new(FrameReader {
                    pump: Pump::new(),
                    buf: BytesMut::new(),
                    discard: 0,
                }),
                writer: tokio::sync::Mutex::new(Pump::new()),
                closer: CloseSignal::new(),
                tx: Lane::default(),
                rx: Lane::default(),
            }),
        }
    }

    /// The underlying connection
    pub fn connection(&self) -> &dyn StreamConnection {
        &*self.inner.conn
    }

    /// Send the op's I/O vectors as one message
    pub fn send(&self, aio: &AsyncOp) {
        let Some(sub) = aio.begin(OpKind::Other) else {
            return;
        };
        let Some((sub, lane)) = sub.admit(self.is_closed(), &self.inner.tx) else {
            return;
        };
        let payload = sub.payload();
        let timeout = self.send_timeout();
        let inner = self.inner.clone();
        sub.spawn(timeout, async move {
            let _lane = lane;
            let n = inner.closer.guard(inner.write(payload)).await?;
            trace!("Sent {} byte message", n);
            Ok(Completion::sent(n))
        });
    }

    /// Receive one message into output slot 0
    pub fn recv(&self, aio: &AsyncOp) {
        let Some(sub) = aio.begin(OpKind::Other) else {
            return;
        };
        let Some((sub, lane)) = sub.admit(self.is_closed(), &self.inner.rx) else {
            return;
        };
        let timeout = self.recv_timeout();
        let inner = self.inner.clone();
        sub.spawn(timeout, async move {
            let _lane = lane;
            let msg = inner
                .closer
                .guard(async {
                    let mut reader = inner.reader.lock().await;
                    reader.next(&*inner.conn).await
                })
                .await?;
            trace!("Received {} byte message", msg.len());
            Ok(Completion::message(msg))
        });
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closer.is_closed() || self.inner.conn.is_closed()
    }

    fn send_timeout(&self) -> Option<std::time::Duration> {
        self.inner
            .conn
            .get_duration(OptionName::SendTimeout)
            .ok()
            .flatten()
    }

    fn recv_timeout(&self) -> Option<std::time::Duration> {
        self.inner
            .conn
            .get_duration(OptionName::RecvTimeout)
            .ok()
            .flatten()
    }
}

impl Configurable for MessagePipe {
    fn option(&self, name: OptionName) -> Result<OptionValue> {
        self.inner.conn.option(name)
    }

    fn set_option_value(&self, name: OptionName, value: OptionValue) -> Result<()> {
        self.inner.conn.set_option_value(name, value)
    }
}

impl Drop for MessagePipe {
    fn drop(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::common::Url;
    use crate::transport::{Dialer, Listener, TcpDialer, TcpListener};

    fn pipes() -> (MessagePipe, MessagePipe) {
        let listener = TcpListener::new(&Url::parse("tcp://127.0.0.1:0").unwrap()).unwrap();
        listener.listen().unwrap();
        let port = listener.local_addr().unwrap().port();
        let dialer = TcpDialer::new(&Url::parse(&format!("tcp://127.0.0.1:{}", port)).unwrap())
            .unwrap();

        let accepted = AsyncOp::new();
        let dialed = AsyncOp::new();
        listener.accept(&accepted);
        dialer.dial(&dialed);
        accepted.wait();
        dialed.wait();
        (
            MessagePipe::new(accepted.take_connection(0).unwrap()),
            MessagePipe::new(dialed.take_connection(0).unwrap()),
        )
    }

    fn send(pipe: &MessagePipe, data: &[u8]) {
        let op = AsyncOp::new();
        op.set_iov(vec![BytesMut::from(data)]);
        pipe.send(&op);
        op.wait();
        op.result().unwrap();
        assert_eq!(op.transferred(), data.len());
    }

    #[test]
    fn test_messages_keep_boundaries() {
        let (server, client) = pipes();
        send(&client, b"one");
        send(&client, b"");
        send(&client, &[5u8; 70_000]);

        let op = AsyncOp::new();
        for expected in [&b"one"[..], &b""[..], &[5u8; 70_000][..]] {
            server.recv(&op);
            op.wait();
            op.result().unwrap();
            assert_eq!(op.transferred(), expected.len());
            assert_eq!(&op.take_message(0).unwrap()[..], expected);
        }
    }

    #[test]
    fn test_timed_out_receive_loses_nothing() {
        let (server, client) = pipes();
        let op = AsyncOp::new();
        op.set_timeout(Some(Duration::from_millis(30)));
        server.recv(&op);
        op.wait();
        assert!(matches!(op.result(), Err(Error::Timeout)));

        send(&client, b"later");
        op.set_timeout(Some(Duration::from_secs(5)));
        server.recv(&op);
        op.wait();
        op.result().unwrap();
        assert_eq!(&op.take_message(0).unwrap()[..], b"later");
    }

    #[test]
    fn test_oversized_message_skipped() {
        let (server, client) = pipes();
        server.set_size(OptionName::RecvMaxSize, 16).unwrap();
        send(&client, &[1u8; 64]);
        send(&client, b"fits");

        let op = AsyncOp::new();
        server.recv(&op);
        op.wait();
        op.result().unwrap();
        assert_eq!(&op.take_message(0).unwrap()[..], b"fits");
    }

    #[test]
    fn test_close_cancels_receive() {
        let (server, _client) = pipes();
        let op = AsyncOp::new();
        server.recv(&op);
        std::thread::sleep(Duration::from_millis(20));
        server.close();
        op.wait();
        assert!(matches!(op.result(), Err(Error::Canceled)));
        assert!(server.is_closed());

        server.recv(&op);
        op.wait();
        assert!(matches!(op.result(), Err(Error::ConnectionClosed)));
    }
}
