//! Reactive cells that drive dynamic event selectors.
//!
//! - [`Observable`]: a shared, version-tracked value with synchronous change
//!   notification.
//! - [`Subscription`]: RAII guard that unsubscribes on drop.
//!
//! # Invariants
//!
//! 1. The version increments exactly once per `set` that changes the value.
//! 2. Setting a value equal to the current value is a no-op (no version bump,
//!    no notifications).
//! 3. Subscribers are notified in registration order, synchronously, before
//!    `set` returns, with `(new, old)`.
//! 4. No lock is held while subscribers run, so a subscriber may read or
//!    write the same observable.

use std::sync::{Arc, Mutex, Weak};

use crate::sync::lock;

type Callback<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

struct ObservableState<T> {
    value: T,
    version: u64,
    next_id: u64,
    subscribers: Vec<(u64, Callback<T>)>,
}

struct ObservableInner<T> {
    state: Mutex<ObservableState<T>>,
    /// Keeps a derived observable attached to its source.
    upstream: Mutex<Option<Subscription>>,
}

/// A shared value whose changes are pushed to subscribers.
///
/// Cloning an `Observable` creates a new handle to the **same** value.
///
/// # Example
///
/// ```
/// use reactive_kit::Observable;
///
/// let tab = Observable::new("inbox");
/// let _sub = tab.subscribe(|new, old| println!("{old} -> {new}"));
/// assert!(tab.set("archive"));
/// assert!(!tab.set("archive"));
/// assert_eq!(tab.version(), 1);
/// ```
pub struct Observable<T> {
    inner: Arc<ObservableInner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Observable<T> {
    /// Create a new observable holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(ObservableInner {
                state: Mutex::new(ObservableState {
                    value,
                    version: 0,
                    next_id: 0,
                    subscribers: Vec::new(),
                }),
                upstream: Mutex::new(None),
            }),
        }
    }

    /// Clone out the current value.
    pub fn get(&self) -> T {
        lock(&self.inner.state).value.clone()
    }

    /// Borrow the current value.
    ///
    /// The closure must not call `set` on the same observable.
    pub fn with<U>(&self, f: impl FnOnce(&T) -> U) -> U {
        f(&lock(&self.inner.state).value)
    }

    /// Number of changes applied so far.
    pub fn version(&self) -> u64 {
        lock(&self.inner.state).version
    }

    /// Replace the value and notify subscribers.
    ///
    /// Returns false, without notifying, if `value` equals the current value.
    pub fn set(&self, value: T) -> bool {
        let (new, old, callbacks) = {
            let mut state = lock(&self.inner.state);
            if state.value == value {
                return false;
            }
            let old = std::mem::replace(&mut state.value, value);
            state.version += 1;
            let callbacks: Vec<Callback<T>> =
                state.subscribers.iter().map(|(_, cb)| cb.clone()).collect();
            (state.value.clone(), old, callbacks)
        };

        for callback in callbacks {
            callback(&new, &old);
        }
        true
    }

    /// Modify a copy of the value and store it with [`set`](Self::set).
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        let mut next = self.get();
        f(&mut next);
        self.set(next)
    }

    /// Register a callback invoked with `(new, old)` on every change.
    pub fn subscribe(&self, callback: impl Fn(&T, &T) + Send + Sync + 'static) -> Subscription {
        self.subscribe_with_current(callback).1
    }

    /// Register a callback and read the current value in one step.
    ///
    /// No change can slip in between the read and the registration.
    pub fn subscribe_with_current(
        &self,
        callback: impl Fn(&T, &T) + Send + Sync + 'static,
    ) -> (T, Subscription) {
        let mut state = lock(&self.inner.state);
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push((id, Arc::new(callback)));
        let current = state.value.clone();
        drop(state);

        let weak: Weak<ObservableInner<T>> = Arc::downgrade(&self.inner);
        let subscription = Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.state).subscribers.retain(|(sid, _)| *sid != id);
            }
        });
        (current, subscription)
    }

    /// A handle that does not keep the value alive.
    ///
    /// Subscribers that need to re-read their own source hold one of these,
    /// since a strong handle inside the subscriber list would never drop.
    pub(crate) fn downgrade(&self) -> WeakObservable<T> {
        WeakObservable {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.state).subscribers.len()
    }

    /// Derive a new observable that tracks `f(value)`.
    ///
    /// The derivation stays attached to this observable for as long as any
    /// handle to the derived value is alive. It only notifies its own
    /// subscribers when the mapped value actually changes.
    pub fn map<U>(&self, f: impl Fn(&T) -> U + Send + Sync + 'static) -> Observable<U>
    where
        U: Clone + PartialEq + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let derived = Observable::new(self.with(|value| f(value)));

        let weak = Arc::downgrade(&derived.inner);
        let map = Arc::clone(&f);
        let (current, subscription) = self.subscribe_with_current(move |new, _| {
            if let Some(inner) = weak.upgrade() {
                Observable { inner }.set(map(new));
            }
        });
        derived.set(f(&current));

        *lock(&derived.inner.upstream) = Some(subscription);
        derived
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("Observable")
            .field("value", &state.value)
            .field("version", &state.version)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl<T: PartialEq> PartialEq for Observable<T> {
    /// Handles are equal when they share the same cell.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Non-owning handle to an [`Observable`].
pub(crate) struct WeakObservable<T> {
    inner: Weak<ObservableInner<T>>,
}

impl<T> WeakObservable<T> {
    pub(crate) fn upgrade(&self) -> Option<Observable<T>> {
        Some(Observable {
            inner: self.inner.upgrade()?,
        })
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Guard for a registered callback. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unsubscribe now.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
