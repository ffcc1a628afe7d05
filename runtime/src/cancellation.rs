//! Cooperative cancellation (spec §4.2).
//!
//! A one-shot flag plus a callback list guarded by a single mutex. `cancel`
//! is idempotent: the callbacks run exactly once, the first time `cancel`
//! is called. `link_future` gives in-flight handler work a way to be
//! aborted when the token fires, without the token owning a runtime
//! handle.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken as TokioCancellationToken;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    cancelled: bool,
    callbacks: Vec<Callback>,
}

/// Handle shared between the caller that created it and every handler
/// invocation it was threaded into. Clone is cheap (shared state).
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Mutex<Inner>>,
    tokio_token: TokioCancellationToken,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                cancelled: false,
                callbacks: Vec::new(),
            })),
            tokio_token: TokioCancellationToken::new(),
        }
    }

    /// Idempotent. Flips the flag then runs every registered callback once,
    /// under the lock, in registration order.
    pub fn cancel(&self) {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            std::mem::take(&mut inner.callbacks)
        };
        self.tokio_token.cancel();
        for cb in callbacks {
            cb();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().unwrap().cancelled
    }

    /// Invokes `callback` immediately if already cancelled; otherwise queues
    /// it to run on the next `cancel()`.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.cancelled {
            drop(inner);
            callback();
        } else {
            inner.callbacks.push(Box::new(callback));
        }
    }

    /// Runs `fut` to completion, or returns `Err(Cancelled)` as soon as this
    /// token fires. `fut` is dropped (and with it, any work still in
    /// flight) on cancellation — the caller's task is not aborted, only the
    /// future given here stops being polled.
    pub async fn link_future<F, T>(&self, fut: F) -> Result<T, Cancelled>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.tokio_token.cancelled() => Err(Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Waits until this token is cancelled.
    pub async fn cancelled(&self) {
        self.tokio_token.cancelled().await
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl std::error::Error for Cancelled {}
