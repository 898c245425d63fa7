//! Testing utilities for buses and form proxies.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! reactive-kit = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Recording Handler Calls
//!
//! ```ignore
//! use reactive_kit::testing::CallRecorder;
//!
//! let saves = CallRecorder::new();
//! bus.subscribe("save", saves.handler());
//!
//! bus.emit_sync(&"save", draft.clone());
//!
//! assert!(saves.was_called_with(&draft));
//! ```
//!
//! # Waiting for Deliveries
//!
//! ```ignore
//! use reactive_kit::testing::CallLatch;
//!
//! let latch = CallLatch::new(2);
//! other_window.subscribe("sync", latch.handler());
//!
//! window.emit_sync(&"sync", 1);
//! window.emit_sync(&"sync", 2);
//!
//! latch.await_zero().await;
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::handler::Handler;
use crate::sync::lock;

// =============================================================================
// Call Recorder
// =============================================================================

/// Records every payload delivered to the handlers it hands out.
///
/// Clones share the same record.
pub struct CallRecorder<D> {
    calls: Arc<Mutex<Vec<D>>>,
}

impl<D> Clone for CallRecorder<D> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<D: Clone + Send + 'static> CallRecorder<D> {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A handler that records the payload and replies with nothing.
    ///
    /// Every call creates a handler with a new identity.
    pub fn handler<R: Send + 'static>(&self) -> Handler<D, R> {
        let calls = Arc::clone(&self.calls);
        Handler::sync(move |data: &D| {
            lock(&calls).push(data.clone());
            None
        })
    }

    /// A handler that records the payload and replies with `reply`.
    pub fn replying<R: Clone + Send + Sync + 'static>(&self, reply: R) -> Handler<D, R> {
        let calls = Arc::clone(&self.calls);
        Handler::sync(move |data: &D| {
            lock(&calls).push(data.clone());
            Some(reply.clone())
        })
    }

    /// Every recorded payload, in call order.
    pub fn calls(&self) -> Vec<D> {
        lock(&self.calls).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn was_called(&self) -> bool {
        self.count() > 0
    }

    pub fn was_called_with(&self, expected: &D) -> bool
    where
        D: PartialEq,
    {
        lock(&self.calls).iter().any(|call| call == expected)
    }

    pub fn last(&self) -> Option<D> {
        lock(&self.calls).last().cloned()
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
    }
}

impl<D: Clone + Send + 'static> Default for CallRecorder<D> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Conflict Recorder
// =============================================================================

/// Records the fields passed to a form proxy's conflict handler.
#[derive(Clone, Default)]
pub struct ConflictRecorder {
    fields: Arc<Mutex<Vec<String>>>,
}

impl ConflictRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A conflict handler that records into this recorder.
    pub fn callback(&self) -> impl Fn(&str) + Send + Sync + 'static {
        let fields = Arc::clone(&self.fields);
        move |field: &str| lock(&fields).push(field.to_string())
    }

    /// Every reported field, in report order.
    pub fn fields(&self) -> Vec<String> {
        lock(&self.fields).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.fields).len()
    }
}

// =============================================================================
// Call Latch
// =============================================================================

/// Waits for a specific number of handler calls.
///
/// Tests should wait for meaning, not time. Clones share the same count.
///
/// Wrap waits that might hang in `tokio::time::timeout`.
#[derive(Clone)]
pub struct CallLatch {
    inner: Arc<LatchInner>,
}

struct LatchInner {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CallLatch {
    /// Create a latch expecting `expected` calls.
    pub fn new(expected: usize) -> Self {
        Self {
            inner: Arc::new(LatchInner {
                remaining: AtomicUsize::new(expected),
                notify: Notify::new(),
            }),
        }
    }

    /// Count one call.
    ///
    /// # Panics
    ///
    /// Panics if called more times than expected.
    pub fn dec(&self) {
        let prev = self.inner.remaining.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("CallLatch decremented below zero - more calls than expected");
        }
        if prev == 1 {
            self.inner.notify.notify_waiters();
        }
    }

    /// A handler that counts down this latch.
    pub fn handler<D: 'static, R: Send + 'static>(&self) -> Handler<D, R> {
        let latch = self.clone();
        Handler::sync(move |_: &D| {
            latch.dec();
            None
        })
    }

    /// Wait for the count to reach zero.
    pub async fn await_zero(&self) {
        loop {
            // Register before checking so a concurrent dec is not missed.
            let notified = self.inner.notify.notified();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

impl std::fmt::Debug for CallLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallLatch")
            .field("remaining", &self.remaining())
            .finish()
    }
}
