//! Asynchronous operation handles
//!
//! An [`AsyncOp`] represents one outstanding piece of I/O work: a dial, an
//! accept, a send or a receive. The caller allocates it once, hands it to a
//! transport, and learns about completion through a callback, a blocking
//! [`wait`](AsyncOp::wait) or an awaitable [`wait_async`](AsyncOp::wait_async).
//!
//! ```text
//!          begin()            complete(Ok)
//!   Idle ──────────▶ Submitted ────────────▶ Completed
//!    ▲                   │                      │
//!    │                   │ cancel()/abort()     │ begin() again
//!    │                   ▼                      │
//!    └────────────── Canceled ◀─────────────────┘
//! ```
//!
//! Transports never run work on the caller's thread. They call
//! [`begin`](AsyncOp::begin) and then either finish the returned
//! [`Submission`] immediately or spawn it onto the worker [`pool`].

pub mod pool;
mod pump;

pub(crate) use pump::Pump;

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use tokio::sync::{oneshot, Notify};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::transport::StreamConnection;

/// Number of output slots on every op
pub const MAX_OUTPUTS: usize = 4;

/// Op timeout that overrides any transport default with no deadline at all
pub const INFINITE: Duration = Duration::MAX;

/// What an op was last submitted for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Dial,
    Accept,
    Send,
    Recv,
    /// Work submitted by a layer above the transports, e.g. a message pipe
    Other,
}

/// Lifecycle state of an op
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Idle,
    Submitted,
    Completed,
    Canceled,
}

/// An object produced by a completed op
pub enum Output {
    Connection(Box<dyn StreamConnection>),
    Message(Bytes),
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Connection(_) => f.write_str("Output::Connection(..)"),
            Output::Message(m) => write!(f, "Output::Message({} bytes)", m.len()),
        }
    }
}

/// Completion callback. Runs on a worker thread with no internal locks held,
/// so it may resubmit, cancel or free the op it is given.
pub type Callback = Arc<dyn Fn(&AsyncOp) + Send + Sync>;

/// Handle to a reusable asynchronous operation
///
/// Cloning yields another handle to the same operation.
#[derive(Clone)]
pub struct AsyncOp {
    inner: Arc<Inner>,
}

struct Inner {
    slot: Mutex<Slot>,
    done: Condvar,
    notify: Notify,
    callback: Option<Callback>,
}

struct Slot {
    state: OpState,
    kind: Option<OpKind>,
    iov: Vec<BytesMut>,
    result: Result<()>,
    transferred: usize,
    outputs: [Option<Output>; MAX_OUTPUTS],
    timeout: Option<Duration>,
    generation: u64,
    cancel: Option<oneshot::Sender<Error>>,
    freed: bool,
}

impl AsyncOp {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an op whose callback fires once per submission
    pub fn with_callback<F>(callback: F) -> Self
    where
        F: Fn(&AsyncOp) + Send + Sync + 'static,
    {
        Self::build(Some(Arc::new(callback)))
    }

    fn build(callback: Option<Callback>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    state: OpState::Idle,
                    kind: None,
                    iov: Vec::new(),
                    result: Ok(()),
                    transferred: 0,
                    outputs: std::array::from_fn(|_| None),
                    timeout: None,
                    generation: 0,
                    cancel: None,
                    freed: false,
                }),
                done: Condvar::new(),
                notify: Notify::new(),
                callback,
            }),
        }
    }

    /// Set the I/O vectors. For a send the buffers' contents are transmitted;
    /// for a receive each buffer's current length is the room to fill.
    pub fn set_iov(&self, iov: Vec<BytesMut>) {
        self.inner.slot.lock().iov = iov;
    }

    /// Copy of the I/O vectors
    pub fn iov(&self) -> Vec<BytesMut> {
        self.inner.slot.lock().iov.clone()
    }

    pub fn take_iov(&self) -> Vec<BytesMut> {
        std::mem::take(&mut self.inner.slot.lock().iov)
    }

    /// Total length of all I/O vectors
    pub fn iov_len(&self) -> usize {
        self.inner.slot.lock().iov.iter().map(|b| b.len()).sum()
    }

    /// The first `transferred()` bytes of the I/O vectors
    pub fn received(&self) -> Vec<u8> {
        let slot = self.inner.slot.lock();
        let mut out = Vec::with_capacity(slot.transferred);
        for buf in &slot.iov {
            let want = (slot.transferred - out.len()).min(buf.len());
            out.extend_from_slice(&buf[..want]);
            if out.len() == slot.transferred {
                break;
            }
        }
        out
    }

    /// Per-op timeout. Overrides any default the transport would apply.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.slot.lock().timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.slot.lock().timeout
    }

    pub fn state(&self) -> OpState {
        self.inner.slot.lock().state
    }

    pub fn kind(&self) -> Option<OpKind> {
        self.inner.slot.lock().kind
    }

    pub fn is_busy(&self) -> bool {
        self.state() == OpState::Submitted
    }

    /// Result of the last submission. `Busy` while one is still in flight.
    pub fn result(&self) -> Result<()> {
        let slot = self.inner.slot.lock();
        if slot.state == OpState::Submitted {
            return Err(Error::Busy);
        }
        slot.result.clone()
    }

    /// Bytes moved by the last send or receive
    pub fn transferred(&self) -> usize {
        self.inner.slot.lock().transferred
    }

    pub fn take_output(&self, index: usize) -> Option<Output> {
        let mut slot = self.inner.slot.lock();
        if slot.state == OpState::Submitted {
            return None;
        }
        slot.outputs.get_mut(index).and_then(Option::take)
    }

    /// Take the connection produced by a dial or accept
    pub fn take_connection(&self, index: usize) -> Option<Box<dyn StreamConnection>> {
        match self.take_output(index) {
            Some(Output::Connection(conn)) => Some(conn),
            Some(other) => {
                self.put_output(index, other);
                None
            }
            None => None,
        }
    }

    /// Take a message produced by a message-level receive
    pub fn take_message(&self, index: usize) -> Option<Bytes> {
        match self.take_output(index) {
            Some(Output::Message(msg)) => Some(msg),
            Some(other) => {
                self.put_output(index, other);
                None
            }
            None => None,
        }
    }

    fn put_output(&self, index: usize, output: Output) {
        if let Some(entry) = self.inner.slot.lock().outputs.get_mut(index) {
            *entry = Some(output);
        }
    }

    /// Request early termination. The op still completes exactly once,
    /// with `Canceled`. No-op when nothing is in flight.
    pub fn cancel(&self) {
        self.abort(Error::Canceled);
    }

    /// Like [`cancel`](AsyncOp::cancel) with a caller-chosen result
    pub fn abort(&self, reason: Error) {
        let sender = {
            let mut slot = self.inner.slot.lock();
            if slot.state != OpState::Submitted {
                return;
            }
            slot.cancel.take()
        };
        if let Some(sender) = sender {
            let _ = sender.send(reason);
        }
    }

    /// Block the calling thread until the current submission completes.
    ///
    /// Must not be called from inside an async task; use
    /// [`wait_async`](AsyncOp::wait_async) there.
    pub fn wait(&self) {
        let mut slot = self.inner.slot.lock();
        while slot.state == OpState::Submitted {
            self.inner.done.wait(&mut slot);
        }
    }

    /// Resolve when the current submission completes. Dropping the future
    /// has no effect on the op.
    pub async fn wait_async(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.state() != OpState::Submitted {
                return;
            }
            notified.await;
        }
    }

    /// Release the handle: cancels anything in flight, and every later
    /// submission completes with `Freed` without running the callback.
    pub fn free(&self) {
        self.inner.slot.lock().freed = true;
        self.cancel();
    }

    /// Start a submission. Returns `None` if the op is freed or already in
    /// flight; in both cases nothing further happens for this call.
    pub(crate) fn begin(&self, kind: OpKind) -> Option<Submission> {
        let mut slot = self.inner.slot.lock();
        if slot.freed {
            slot.result = Err(Error::Freed);
            warn!("Submission of freed {:?} op ignored", kind);
            return None;
        }
        if slot.state == OpState::Submitted {
            warn!("{:?} op submitted while already in flight", kind);
            return None;
        }
        let (tx, rx) = oneshot::channel();
        slot.generation += 1;
        slot.state = OpState::Submitted;
        slot.kind = Some(kind);
        slot.result = Ok(());
        slot.transferred = 0;
        slot.outputs = std::array::from_fn(|_| None);
        slot.cancel = Some(tx);
        trace!("{:?} op submitted (generation {})", kind, slot.generation);

        Some(Submission {
            op: self.clone(),
            generation: slot.generation,
            canceled: rx,
            timeout: slot.timeout,
        })
    }

    fn complete(&self, generation: u64, result: Result<Completion>) {
        {
            let mut slot = self.inner.slot.lock();
            if slot.generation != generation || slot.state != OpState::Submitted {
                return;
            }
            slot.cancel = None;
            match result {
                Ok(done) => {
                    slot.transferred = match done.data {
                        Some(data) => scatter(&mut slot.iov, &data),
                        None => done.transferred,
                    };
                    for (index, output) in done.outputs {
                        if let Some(entry) = slot.outputs.get_mut(index) {
                            *entry = Some(output);
                        }
                    }
                    slot.result = Ok(());
                    slot.state = OpState::Completed;
                }
                Err(err) => {
                    slot.state = if matches!(err, Error::Canceled) {
                        OpState::Canceled
                    } else {
                        OpState::Completed
                    };
                    slot.result = Err(err);
                }
            }
        }
        self.inner.done.notify_all();
        self.inner.notify.notify_waiters();
        if let Some(callback) = &self.inner.callback {
            callback(self);
        }
    }
}

impl Default for AsyncOp {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("AsyncOp")
            .field("state", &slot.state)
            .field("kind", &slot.kind)
            .field("transferred", &slot.transferred)
            .finish()
    }
}

/// Copy `data` into the buffers front to back, returning the bytes copied.
fn scatter(iov: &mut [BytesMut], data: &[u8]) -> usize {
    let mut copied = 0;
    for buf in iov.iter_mut() {
        if copied == data.len() {
            break;
        }
        let n = buf.len().min(data.len() - copied);
        buf[..n].copy_from_slice(&data[copied..copied + n]);
        copied += n;
    }
    copied
}

/// Successful outcome of a submission
#[derive(Default)]
pub(crate) struct Completion {
    transferred: usize,
    data: Option<Bytes>,
    outputs: Vec<(usize, Output)>,
}

impl Completion {
    pub fn sent(n: usize) -> Self {
        Self {
            transferred: n,
            ..Default::default()
        }
    }

    /// Received bytes, copied into the op's I/O vectors
    pub fn received(data: Bytes) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn output(output: Output) -> Self {
        Self {
            outputs: vec![(0, output)],
            ..Default::default()
        }
    }

    /// A message in slot 0 with its length as the transfer count
    pub fn message(msg: Bytes) -> Self {
        Self {
            transferred: msg.len(),
            outputs: vec![(0, Output::Message(msg))],
            ..Default::default()
        }
    }
}

/// One accepted submission of an op. Completes the op exactly once.
pub(crate) struct Submission {
    op: AsyncOp,
    generation: u64,
    canceled: oneshot::Receiver<Error>,
    timeout: Option<Duration>,
}

impl Submission {
    pub fn op(&self) -> &AsyncOp {
        &self.op
    }

    /// Contents of the I/O vectors, concatenated
    pub fn payload(&self) -> Bytes {
        let slot = self.op.inner.slot.lock();
        let mut out = BytesMut::with_capacity(slot.iov.iter().map(|b| b.len()).sum());
        for buf in &slot.iov {
            out.extend_from_slice(buf);
        }
        out.freeze()
    }

    /// Room available in the I/O vectors
    pub fn capacity(&self) -> usize {
        self.op.iov_len()
    }

    /// Claim `lane` for this submission, completing it at once with
    /// `ConnectionClosed` or `Busy` when that is not possible.
    pub fn admit(self, closed: bool, lane: &Lane) -> Option<(Submission, LaneGuard)> {
        if closed {
            self.finish(Err(Error::ConnectionClosed));
            return None;
        }
        match lane.try_acquire() {
            Some(guard) => Some((self, guard)),
            None => {
                self.finish(Err(Error::Busy));
                None
            }
        }
    }

    /// Complete with a result known at submit time. Delivery still happens
    /// on a worker thread, so the submitting caller never runs the callback.
    pub fn finish(self, result: Result<Completion>) {
        let Submission { op, generation, .. } = self;
        match pool::handle() {
            Ok(handle) => {
                handle.spawn(async move { op.complete(generation, result) });
            }
            Err(err) => {
                warn!("Worker pool unavailable, completing inline: {}", err);
                op.complete(generation, result);
            }
        }
    }

    /// Run `work` on the worker pool, racing it against cancellation and the
    /// effective timeout (the op's own, else `default_timeout`).
    pub fn spawn<F>(self, default_timeout: Option<Duration>, work: F)
    where
        F: Future<Output = Result<Completion>> + Send + 'static,
    {
        let handle = match pool::handle() {
            Ok(handle) => handle,
            Err(err) => {
                warn!("Worker pool unavailable: {}", err);
                return self.op.complete(self.generation, Err(err));
            }
        };
        let Submission {
            op,
            generation,
            mut canceled,
            timeout,
        } = self;
        let timeout = timeout.or(default_timeout);

        handle.spawn(async move {
            let result = {
                let work = with_deadline(timeout, work);
                tokio::select! {
                    biased;
                    reason = &mut canceled => Err(reason.unwrap_or(Error::Canceled)),
                    result = work => result,
                }
            };
            op.complete(generation, result);
        });
    }
}

/// Submit `op` through `submit` and await it. Dropping the returned future
/// cancels the op, so a lower operation never outlives the layer awaiting it.
pub(crate) async fn drive<F>(op: &AsyncOp, submit: F) -> Result<()>
where
    F: FnOnce(&AsyncOp),
{
    struct CancelOnDrop<'a>(&'a AsyncOp);

    impl Drop for CancelOnDrop<'_> {
        fn drop(&mut self) {
            self.0.cancel();
        }
    }

    let _guard = CancelOnDrop(op);
    submit(op);
    op.wait_async().await;
    op.result()
}

/// One-at-a-time admission for a connection direction
#[derive(Debug, Default)]
pub(crate) struct Lane {
    busy: Arc<AtomicBool>,
}

/// Held while an op owns its direction
pub(crate) struct LaneGuard {
    busy: Arc<AtomicBool>,
}

impl Lane {
    pub fn try_acquire(&self) -> Option<LaneGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LaneGuard {
                busy: self.busy.clone(),
            })
    }
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

async fn with_deadline<F, T>(timeout: Option<Duration>, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) if limit != INFINITE => tokio::time::timeout(limit, work)
            .await
            .unwrap_or(Err(Error::Timeout)),
        _ => work.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn spawn_after(op: &AsyncOp, delay: Duration, result: Result<Completion>) {
        let submission = op.begin(OpKind::Other).expect("op accepts submission");
        submission.spawn(None, async move {
            tokio::time::sleep(delay).await;
            result
        });
    }

    #[test]
    fn test_callback_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let op = AsyncOp::with_callback(move |op| {
            assert_eq!(op.state(), OpState::Completed);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        spawn_after(&op, Duration::from_millis(5), Ok(Completion::sent(7)));
        op.wait();
        op.cancel();
        assert!(op.result().is_ok());
        assert_eq!(op.transferred(), 7);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_in_flight() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let op = AsyncOp::with_callback(move |op| {
            // Cancelling from inside the callback is a no-op.
            op.cancel();
            seen.fetch_add(1, Ordering::SeqCst);
        });

        spawn_after(&op, Duration::from_secs(30), Ok(Completion::default()));
        assert!(op.is_busy());
        assert!(matches!(op.result(), Err(Error::Busy)));
        op.cancel();
        op.wait();
        assert_eq!(op.state(), OpState::Canceled);
        assert!(matches!(op.result(), Err(Error::Canceled)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abort_with_reason() {
        let op = AsyncOp::new();
        spawn_after(&op, Duration::from_secs(30), Ok(Completion::default()));
        op.abort(Error::ConnectionClosed);
        op.wait();
        assert!(matches!(op.result(), Err(Error::ConnectionClosed)));
        assert_eq!(op.state(), OpState::Completed);
    }

    #[test]
    fn test_timeout() {
        let op = AsyncOp::new();
        op.set_timeout(Some(Duration::from_millis(20)));
        spawn_after(&op, Duration::from_secs(30), Ok(Completion::default()));
        op.wait();
        assert!(matches!(op.result(), Err(Error::Timeout)));
    }

    #[test]
    fn test_infinite_overrides_default() {
        let op = AsyncOp::new();
        op.set_timeout(Some(INFINITE));
        let submission = op.begin(OpKind::Other).unwrap();
        submission.spawn(Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            Ok(Completion::sent(3))
        });
        op.wait();
        op.result().unwrap();
        assert_eq!(op.transferred(), 3);
    }

    #[test]
    fn test_reuse_resets_outputs() {
        let op = AsyncOp::new();
        spawn_after(
            &op,
            Duration::ZERO,
            Ok(Completion::message(Bytes::from_static(b"abc"))),
        );
        op.wait();
        assert_eq!(op.transferred(), 3);

        spawn_after(&op, Duration::ZERO, Ok(Completion::sent(1)));
        op.wait();
        assert_eq!(op.transferred(), 1);
        assert!(op.take_message(0).is_none());
    }

    #[test]
    fn test_scatter_into_iov() {
        let op = AsyncOp::new();
        op.set_iov(vec![BytesMut::zeroed(2), BytesMut::zeroed(4)]);
        let submission = op.begin(OpKind::Recv).unwrap();
        assert_eq!(submission.capacity(), 6);
        submission.finish(Ok(Completion::received(Bytes::from_static(b"hello"))));
        op.wait();

        assert_eq!(op.transferred(), 5);
        assert_eq!(op.received(), b"hello");
        let iov = op.take_iov();
        assert_eq!(&iov[0][..], b"he");
        assert_eq!(&iov[1][..3], b"llo");
    }

    #[test]
    fn test_double_begin_rejected() {
        let op = AsyncOp::new();
        let first = op.begin(OpKind::Send).unwrap();
        assert!(op.begin(OpKind::Send).is_none());
        first.finish(Ok(Completion::sent(0)));
        op.wait();
        assert!(op.begin(OpKind::Send).is_some());
    }

    #[test]
    fn test_immediate_completion_runs_on_worker() {
        let caller = std::thread::current().id();
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = Mutex::new(tx);
        let op = AsyncOp::with_callback(move |_| {
            let _ = tx.lock().send(std::thread::current().id());
        });

        let submission = op.begin(OpKind::Send).unwrap();
        submission.finish(Err(Error::ConnectionClosed));
        let callback_thread = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(callback_thread, caller);
        assert!(matches!(op.result(), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_callback_may_take_callers_lock() {
        let shared = Arc::new(Mutex::new(0u32));
        let in_callback = shared.clone();
        let op = AsyncOp::with_callback(move |_| {
            *in_callback.lock() += 1;
        });

        {
            let _held = shared.lock();
            let lane = Lane::default();
            let _busy = lane.try_acquire().unwrap();
            let submission = op.begin(OpKind::Recv).unwrap();
            assert!(submission.admit(false, &lane).is_none());
        }
        op.wait();
        assert!(matches!(op.result(), Err(Error::Busy)));
        // The callback may still be running after waiters are released.
        for _ in 0..100 {
            if *shared.lock() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*shared.lock(), 1);
    }

    #[test]
    fn test_freed_op() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let op = AsyncOp::with_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        spawn_after(&op, Duration::from_secs(30), Ok(Completion::default()));
        op.free();
        op.wait();
        assert_eq!(op.state(), OpState::Canceled);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(op.begin(OpKind::Recv).is_none());
        assert!(matches!(op.result(), Err(Error::Freed)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lane_admits_one() {
        let lane = Lane::default();
        let guard = lane.try_acquire().unwrap();
        assert!(lane.try_acquire().is_none());
        drop(guard);
        assert!(lane.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_drive_cancels_when_dropped() {
        let op = AsyncOp::new();
        let driven = drive(&op, |op| {
            spawn_after(op, Duration::from_secs(30), Ok(Completion::default()))
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), driven)
            .await
            .is_err());
        op.wait_async().await;
        assert_eq!(op.state(), OpState::Canceled);
    }

    #[tokio::test]
    async fn test_wait_async() {
        let op = AsyncOp::new();
        spawn_after(&op, Duration::from_millis(5), Ok(Completion::sent(2)));
        op.wait_async().await;
        assert_eq!(op.transferred(), 2);
        // Completed ops resolve immediately.
        op.wait_async().await;
    }
}
