//! Cooperative cancellation with registered callbacks.
//!
//! [`CancelSignal`] wraps a [`CancellationToken`] and adds:
//!
//! - idempotent signalling: only the first [`cancel`](CancelSignal::cancel)
//!   has any effect;
//! - callbacks fired synchronously on that first signal, each isolated so
//!   a panicking handler cannot stop the rest;
//! - a timed [`wait`](CancelSignal::wait) whose cancelled outcome is
//!   distinct from elapsing.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Callback = Box<dyn FnOnce() + Send>;

/// Outcome of [`CancelSignal::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The full duration passed.
    Elapsed,
    /// The signal fired first.
    Cancelled,
}

#[derive(Default)]
struct Inner {
    token: CancellationToken,
    fired: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
}

/// Shared cancellation signal. Clones observe the same state.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<Inner>,
}

impl CancelSignal {
    /// A fresh, un-fired signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing token, e.g. a child of a process-wide shutdown token.
    #[must_use]
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                token,
                fired: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Fire the signal. Repeated calls are no-ops.
    ///
    /// Callbacks run on the calling thread before this returns.
    pub fn cancel(&self) {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.token.cancel();

        let callbacks = std::mem::take(
            &mut *self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        debug!(callbacks = callbacks.len(), "cancel signal fired");
        for callback in callbacks {
            run_isolated(callback);
        }
    }

    /// Register `callback` to run when the signal fires.
    ///
    /// If the signal has already fired, the callback runs immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut callbacks = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.inner.fired.load(Ordering::SeqCst) {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        run_isolated(Box::new(callback));
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst) || self.inner.token.is_cancelled()
    }

    /// The underlying token, for wiring into timers and runners.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Sleep for `duration` unless the signal fires first.
    pub async fn wait(&self, duration: Duration) -> WaitOutcome {
        if self.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        tokio::select! {
            biased;
            () = self.inner.token.cancelled() => WaitOutcome::Cancelled,
            () = tokio::time::sleep(duration) => WaitOutcome::Elapsed,
        }
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn run_isolated(callback: Callback) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!("cancel callback panicked");
    }
}
