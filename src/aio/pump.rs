//! Awaitable driver for one direction of a lower stream
//!
//! Layers above a connection (TLS records, message framing) read and write
//! through a [`Pump`]. The op it drives outlives the future awaiting it: if
//! that future is dropped mid-flight, the next call picks up the same op
//! instead of starting a second one, so no bytes are lost or reordered.
//!
//! Pumped ops never inherit the lower connection's receive or send timeout.
//! Deadlines belong to the layer awaiting the pump.

use bytes::{Bytes, BytesMut};

use super::{AsyncOp, INFINITE};
use crate::error::{Error, Result};
use crate::transport::StreamConnection;

pub(crate) struct Pump {
    aio: AsyncOp,
    in_flight: bool,
}

impl Pump {
    pub fn new() -> Self {
        let aio = AsyncOp::new();
        aio.set_timeout(Some(INFINITE));
        Self {
            aio,
            in_flight: false,
        }
    }

    /// Receive at most `size` bytes. Resumes an abandoned receive if there
    /// is one, in which case that call's size applies.
    pub async fn recv(&mut self, conn: &dyn StreamConnection, size: usize) -> Result<Bytes> {
        if self.in_flight {
            self.aio.wait_async().await;
            self.in_flight = false;
            // A timeout nobody was waiting for belongs to the abandoned call.
            if !matches!(self.aio.result(), Err(Error::Timeout)) {
                return self.take_received();
            }
        }
        self.aio.set_iov(vec![BytesMut::zeroed(size)]);
        self.in_flight = true;
        conn.recv(&self.aio);
        self.aio.wait_async().await;
        self.in_flight = false;
        self.take_received()
    }

    fn take_received(&mut self) -> Result<Bytes> {
        self.aio.result()?;
        let n = self.aio.transferred();
        let mut buf = self.aio.take_iov().into_iter().next().unwrap_or_default();
        buf.truncate(n);
        Ok(buf.freeze())
    }

    /// Send all of `data`. An abandoned earlier send is finished first and
    /// its error, if any, is returned instead.
    pub async fn send(&mut self, conn: &dyn StreamConnection, data: &[u8]) -> Result<()> {
        self.settle().await?;
        self.aio.set_iov(vec![BytesMut::from(data)]);
        self.in_flight = true;
        conn.send(&self.aio);
        self.settle().await
    }

    /// Wait out an abandoned send, returning its result
    pub async fn settle(&mut self) -> Result<()> {
        if !self.in_flight {
            return Ok(());
        }
        self.aio.wait_async().await;
        self.in_flight = false;
        self.aio.result()
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        if self.in_flight {
            self.aio.cancel();
        }
    }
}
