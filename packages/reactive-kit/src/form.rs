//! Write-intercepting form proxy.
//!
//! A [`FormProxy`] wraps a [`Record`]. Reads pass straight through; every
//! [`set`](FormProxy::set) goes through a FIFO queue and the field setters
//! configured on the proxy before anything is written.
//!
//! # Queue
//!
//! - The write at the head of the queue is the only one being resolved.
//! - A write issued while another is in flight waits its turn.
//! - A write issued on an empty queue starts resolving before `set` returns;
//!   if every setter it reaches answers synchronously, the record is updated
//!   by the time `set` returns.
//! - A cascade that suspends on a deferred setter is finished on the ambient
//!   tokio runtime.
//!
//! # Rejection
//!
//! A rejected write (conflict, setter failure, or a suspended cascade with
//! no runtime) leaves the record untouched and discards every queued write.
//! A panicking setter or comparator counts as a setter failure; the queue
//! stays usable afterwards.
//! All outstanding [`settled`](FormProxy::settled) calls resolve to `false`.
//!
//! # Example
//!
//! ```
//! use reactive_kit::{sync_setter, FormProxy, Patch};
//! use serde_json::json;
//!
//! let record = json!({"first": "Ada", "last": "Lovelace", "full": "Ada Lovelace"});
//! let form = FormProxy::builder(record.as_object().unwrap().clone())
//!     .with_setter("first", sync_setter(|record, value| {
//!         let last = record.get("last")?.as_str()?;
//!         let first = value.as_str()?;
//!         Some(Patch::single("first", first).with("full", format!("{first} {last}")))
//!     }))
//!     .build();
//!
//! form.set("first", "Augusta");
//! assert_eq!(form.get("full"), Some(json!("Augusta Lovelace")));
//! ```

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::task::Poll;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, warn};

use crate::cascade::{resolve, PendingWrite};
use crate::deferred::{panic_message, poll_now, spawn_detached};
use crate::error::CascadeError;
use crate::options::{FormOptions, Mode, Setter};
use crate::patch::{merged, Patch, Record};
use crate::sync::lock;

// =============================================================================
// Internal State
// =============================================================================

struct QueueState {
    writes: VecDeque<PendingWrite>,
    waiters: Vec<oneshot::Sender<bool>>,
    /// How the most recent batch of writes ended.
    last_outcome: bool,
    last_rejection: Option<CascadeError>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            writes: VecDeque::new(),
            waiters: Vec::new(),
            last_outcome: true,
            last_rejection: None,
        }
    }
}

struct FormInner {
    options: Arc<FormOptions>,
    record: watch::Sender<Record>,
    pending: watch::Sender<usize>,
    queue: Mutex<QueueState>,
}

/// Rejection for a cascade that panicked outside any single setter.
fn panicked(field: &str, panic: &(dyn std::any::Any + Send)) -> CascadeError {
    error!(field = %field, "cascade panicked");
    CascadeError::setter_failed(field, anyhow::anyhow!("cascade panicked: {}", panic_message(panic)))
}

impl FormInner {
    /// Resolve `write` and every write queued behind it.
    ///
    /// Synchronous cascades are finished inline. The first cascade that
    /// suspends is moved onto the runtime, which carries on with the queue.
    fn pump(self: &Arc<Self>, mut write: PendingWrite) {
        loop {
            let live = self.record.borrow().clone();
            let mut cascade = resolve(Arc::clone(&self.options), live, write.clone()).boxed();

            let polled = catch_unwind(AssertUnwindSafe(|| poll_now(cascade.as_mut())));
            let outcome = match polled {
                Ok(Poll::Ready(outcome)) => outcome,
                Err(panic) => Err(panicked(&write.field, &*panic)),
                Ok(Poll::Pending) => {
                    let inner = Arc::clone(self);
                    let field = write.field.clone();
                    let driver = async move {
                        let outcome = match AssertUnwindSafe(cascade).catch_unwind().await {
                            Ok(outcome) => outcome,
                            Err(panic) => Err(panicked(&field, &*panic)),
                        };
                        if let Some(next) = inner.finish(outcome) {
                            inner.pump(next);
                        }
                    }
                    .boxed();
                    if spawn_detached(driver) {
                        debug!(field = %write.field, "cascade suspended, finishing on runtime");
                        return;
                    }
                    error!(field = %write.field, "cascade suspended outside a tokio runtime");
                    Err(CascadeError::Suspended {
                        field: write.field.clone(),
                    })
                }
            };

            match self.finish(outcome) {
                Some(next) => write = next,
                None => return,
            }
        }
    }

    /// Settle the head write. Returns the next write to resolve, if any.
    fn finish(&self, outcome: Result<Patch, CascadeError>) -> Option<PendingWrite> {
        match outcome {
            Ok(changes) => {
                self.apply(&changes);
                let mut state = lock(&self.queue);
                state.writes.pop_front();
                self.pending.send_replace(state.writes.len());
                if let Some(next) = state.writes.front() {
                    return Some(next.clone());
                }
                state.last_outcome = true;
                let waiters = std::mem::take(&mut state.waiters);
                drop(state);
                for waiter in waiters {
                    let _ = waiter.send(true);
                }
                None
            }
            Err(err) => {
                let waiters = {
                    let mut state = lock(&self.queue);
                    warn!(
                        error = %err,
                        discarded = state.writes.len(),
                        "write rejected, pending writes discarded"
                    );
                    state.writes.clear();
                    state.last_outcome = false;
                    state.last_rejection = Some(err.clone());
                    self.pending.send_replace(0);
                    std::mem::take(&mut state.waiters)
                };
                if let (CascadeError::Conflict { field }, Some(on_conflict)) =
                    (&err, &self.options.on_conflict)
                {
                    on_conflict(field);
                }
                for waiter in waiters {
                    let _ = waiter.send(false);
                }
                None
            }
        }
    }

    fn apply(&self, changes: &Patch) {
        match self.options.mode {
            Mode::Assign => {
                self.record.send_if_modified(|record| changes.apply_to(record));
            }
            Mode::Reassign => {
                let next = merged(&self.record.borrow(), changes);
                self.record.send_replace(next);
            }
        }
        debug!(
            fields = ?changes.keys().collect::<Vec<_>>(),
            mode = %self.options.mode,
            "change-set applied"
        );
    }
}

// =============================================================================
// Form Proxy
// =============================================================================

/// A record whose writes run through field setters.
///
/// Cloning a `FormProxy` creates another handle to the **same** record and
/// queue.
#[derive(Clone)]
pub struct FormProxy {
    inner: Arc<FormInner>,
}

impl FormProxy {
    /// Start configuring a proxy over `record`.
    pub fn builder(record: Record) -> FormProxyBuilder {
        FormProxyBuilder::new(record)
    }

    /// A proxy over `record` with no setters.
    pub fn new(record: Record) -> Self {
        Self::builder(record).build()
    }

    /// Current value of `field`.
    pub fn get(&self, field: &str) -> Option<Value> {
        self.inner.record.borrow().get(field).cloned()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.inner.record.borrow().contains_key(field)
    }

    /// A copy of the whole record.
    pub fn snapshot(&self) -> Record {
        self.inner.record.borrow().clone()
    }

    /// Deserialize the current record into `T`.
    pub fn snapshot_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(Value::Object(self.snapshot()))?)
    }

    /// Write `value` to `field` through its setter.
    ///
    /// Never fails at the call site. Outcomes are observed through the
    /// record itself, [`settled`](Self::settled) and
    /// [`last_rejection`](Self::last_rejection).
    pub fn set(&self, field: impl Into<String>, value: impl Into<Value>) {
        let write = PendingWrite {
            field: field.into(),
            value: value.into(),
        };

        let queued = {
            let mut state = lock(&self.inner.queue);
            state.writes.push_back(write.clone());
            let queued = state.writes.len();
            self.inner.pending.send_replace(queued);
            queued
        };

        if queued > 1 {
            debug!(field = %write.field, position = queued, "write queued behind in-flight cascade");
            return;
        }
        debug!(field = %write.field, "write intercepted");
        self.inner.pump(write);
    }

    /// Replace the whole record, bypassing setters and the queue.
    pub fn replace(&self, record: Record) {
        self.inner.record.send_replace(record);
    }

    /// Receiver notified whenever the record changes.
    pub fn watch(&self) -> watch::Receiver<Record> {
        self.inner.record.subscribe()
    }

    /// Number of writes in flight or queued.
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Returns true while any write is in flight or queued.
    pub fn is_setting(&self) -> bool {
        self.pending() > 0
    }

    /// Receiver of the pending-write count.
    pub fn pending_signal(&self) -> watch::Receiver<usize> {
        self.inner.pending.subscribe()
    }

    /// Wait until the queue drains.
    ///
    /// Resolves to `true` once every queued write applied, `false` as soon
    /// as any of them is rejected. When nothing is pending it resolves
    /// immediately with the outcome of the most recent batch, so a write
    /// that was rejected synchronously still reports `false`.
    pub async fn settled(&self) -> bool {
        let receiver = {
            let mut state = lock(&self.inner.queue);
            if state.writes.is_empty() {
                return state.last_outcome;
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push(sender);
            receiver
        };
        receiver.await.unwrap_or(false)
    }

    /// Why the most recent rejected write was rejected.
    pub fn last_rejection(&self) -> Option<CascadeError> {
        lock(&self.inner.queue).last_rejection.clone()
    }

    pub fn options(&self) -> &FormOptions {
        &self.inner.options
    }
}

impl std::fmt::Debug for FormProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormProxy")
            .field("record", &*self.inner.record.borrow())
            .field("pending", &self.pending())
            .field("options", &self.inner.options)
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for a [`FormProxy`].
pub struct FormProxyBuilder {
    record: Record,
    options: FormOptions,
}

impl FormProxyBuilder {
    pub fn new(record: Record) -> Self {
        Self {
            record,
            options: FormOptions::default(),
        }
    }

    /// Start from any value that serializes to a JSON object.
    pub fn from_serialize<T: Serialize>(value: &T) -> anyhow::Result<Self> {
        Ok(Self::new(Patch::from_serialize(value)?.into_inner()))
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.options.mode = mode;
        self
    }

    /// Register the setter for `field`, replacing any earlier one.
    pub fn with_setter(mut self, field: impl Into<String>, setter: impl Setter) -> Self {
        self.options.setters.insert(field.into(), Arc::new(setter));
        self
    }

    /// Register the equality used for `field` when checking for conflicts.
    pub fn with_comparator(
        mut self,
        field: impl Into<String>,
        comparator: impl Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.options.comparators.insert(field.into(), Arc::new(comparator));
        self
    }

    /// Called once per rejected cascade with the field whose setter
    /// introduced the conflicting value.
    pub fn with_conflict_handler(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.options.on_conflict = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> FormProxy {
        let (record, _) = watch::channel(self.record);
        let (pending, _) = watch::channel(0);
        FormProxy {
            inner: Arc::new(FormInner {
                options: Arc::new(self.options),
                record,
                pending,
                queue: Mutex::new(QueueState::default()),
            }),
        }
    }
}
