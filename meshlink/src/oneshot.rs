//! Cooperative cancellation and one-shot completion primitives. Every
//! pending TX-status, AT-response, and session-completion slot in this
//! crate is one of these: a caller blocks on `wait`, and exactly one other
//! thread eventually calls `resolve`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const POLL_GRANULARITY: Duration = Duration::from_millis(20);

/// A shared, cloneable flag a caller can use to ask a suspended operation
/// to give up early.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// The reason a [`Completion::wait`] returned without a value.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum WaitError {
    TimedOut,
    Cancelled,
}

struct Inner<T> {
    value: Mutex<Option<T>>,
    signal: Condvar,
}

/// A one-shot value slot: at most one `resolve` call ever succeeds: further
/// calls are silently ignored, matching the source's "first writer wins"
/// futures.
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Completion {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Completion<T> {
        Completion {
            inner: Arc::new(Inner {
                value: Mutex::new(None),
                signal: Condvar::new(),
            }),
        }
    }

    /// Resolves the slot. A no-op if it was already resolved.
    pub fn resolve(&self, value: T) {
        let mut guard = self.inner.value.lock().unwrap();
        if guard.is_none() {
            *guard = Some(value);
            self.inner.signal.notify_all();
        }
    }

    /// Returns the value immediately if already resolved, without blocking.
    pub fn try_get(&self) -> Option<T> {
        self.inner.value.lock().unwrap().clone()
    }

    /// Blocks until resolved, cancelled, or `timeout` elapses, polling the
    /// cancel token at [`POLL_GRANULARITY`] since a condvar can't natively
    /// wait on an external atomic.
    pub fn wait(&self, timeout: Duration, cancel: &CancelToken) -> Result<T, WaitError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.value.lock().unwrap();
        loop {
            if let Some(value) = guard.as_ref() {
                return Ok(value.clone());
            }
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::TimedOut);
            }
            let slice = std::cmp::min(POLL_GRANULARITY, deadline - now);
            let (next_guard, _) = self.inner.signal.wait_timeout(guard, slice).unwrap();
            guard = next_guard;
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Completion::new()
    }
}
