//! One-shot close signal shared between an object and its in-flight work

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Error, Result};

/// Set once, observed by every in-flight operation of the owning object.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark closed. Returns `true` only for the call that did it.
    pub fn close(&self) -> bool {
        self.tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`close`](CloseSignal::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot be dropped here.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Run `fut`, resolving to `Canceled` if the signal fires first.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.closed() => Err(Error::Canceled),
            result = fut => result,
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}
