//! Event handlers, handler maps, and event selectors.
//!
//! A [`Handler`] is a cloneable, identity-carrying wrapper around a callback.
//! Closures have no identity of their own, so every handler is stamped with
//! a process-unique [`HandlerId`] at construction; clones share the id, and
//! the bus matches handlers by id when unsubscribing.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::deferred::MaybeDeferred;
use crate::reactive::Observable;

/// What a handler hands back: a reply, nothing, or a deferred reply.
pub type HandlerOutput<R> = MaybeDeferred<Option<R>>;

type HandlerFn<D, R> = dyn Fn(&D) -> HandlerOutput<R> + Send + Sync;

/// Process-unique handler identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// A callback subscribed to bus events.
///
/// # Example
///
/// ```
/// use reactive_kit::Handler;
///
/// let greet: Handler<String, String> = Handler::sync(|name: &String| Some(format!("hi {name}")));
/// let same = greet.clone();
/// assert_eq!(greet, same);
/// assert_ne!(greet, Handler::sync(|_: &String| None));
/// ```
pub struct Handler<D, R = ()> {
    id: HandlerId,
    func: Arc<HandlerFn<D, R>>,
}

impl<D, R> Clone for Handler<D, R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            func: Arc::clone(&self.func),
        }
    }
}

impl<D, R> PartialEq for Handler<D, R> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<D, R> Eq for Handler<D, R> {}

impl<D, R> std::fmt::Debug for Handler<D, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").field("id", &self.id).finish()
    }
}

impl<D: 'static, R: Send + 'static> Handler<D, R> {
    /// Wrap a callback that may answer now, fail, or answer later.
    pub fn new(func: impl Fn(&D) -> HandlerOutput<R> + Send + Sync + 'static) -> Self {
        Self::with_id(HandlerId::next(), func)
    }

    pub(crate) fn with_id(
        id: HandlerId,
        func: impl Fn(&D) -> HandlerOutput<R> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            func: Arc::new(func),
        }
    }

    /// Wrap a synchronous callback.
    pub fn sync(func: impl Fn(&D) -> Option<R> + Send + Sync + 'static) -> Self {
        Self::new(move |data| MaybeDeferred::Ready(func(data)))
    }

    /// Wrap a callback that returns a future.
    pub fn deferred<F>(func: impl Fn(&D) -> F + Send + Sync + 'static) -> Self
    where
        F: Future<Output = anyhow::Result<Option<R>>> + Send + 'static,
    {
        Self::new(move |data| MaybeDeferred::deferred(func(data)))
    }

    /// This handler's identity.
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub(crate) fn call(&self, data: &D) -> HandlerOutput<R> {
        (self.func)(data)
    }
}

// =============================================================================
// Handler Map
// =============================================================================

/// An ordered set of `(event, handler)` pairs subscribed together.
///
/// Two maps are equal when they bind the same handlers to the same events in
/// the same order, which lets an [`Observable`] of maps skip no-op swaps.
pub struct HandlerMap<K, D, R = ()> {
    entries: Vec<(K, Handler<D, R>)>,
}

impl<K, D, R> HandlerMap<K, D, R> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add a binding (builder style).
    pub fn on(mut self, event: K, handler: Handler<D, R>) -> Self {
        self.entries.push((event, handler));
        self
    }

    /// Iterate the bindings in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(K, Handler<D, R>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, D, R> Default for HandlerMap<K, D, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone, D, R> Clone for HandlerMap<K, D, R> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<K: PartialEq, D, R> PartialEq for HandlerMap<K, D, R> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<K: std::fmt::Debug, D, R> std::fmt::Debug for HandlerMap<K, D, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

impl<K, D, R> FromIterator<(K, Handler<D, R>)> for HandlerMap<K, D, R> {
    fn from_iter<I: IntoIterator<Item = (K, Handler<D, R>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// Selector
// =============================================================================

/// Which event a handler is bound to.
///
/// A dynamic selector follows an [`Observable`]: whenever it changes, the
/// handler moves from the old event to the new one. `None` means "bound to
/// nothing".
pub enum Selector<K> {
    /// Bound once, never retargeted.
    Fixed(Option<K>),
    /// Retargeted whenever the observable changes.
    Dynamic(Observable<Option<K>>),
}

impl<K> Selector<K> {
    /// A selector bound to nothing.
    pub fn none() -> Self {
        Self::Fixed(None)
    }
}

impl<K> From<K> for Selector<K> {
    fn from(event: K) -> Self {
        Self::Fixed(Some(event))
    }
}

impl<K> From<Option<K>> for Selector<K> {
    fn from(event: Option<K>) -> Self {
        Self::Fixed(event)
    }
}

impl<K> From<Observable<Option<K>>> for Selector<K> {
    fn from(source: Observable<Option<K>>) -> Self {
        Self::Dynamic(source)
    }
}

impl<K> From<&Observable<Option<K>>> for Selector<K> {
    fn from(source: &Observable<Option<K>>) -> Self {
        Self::Dynamic(source.clone())
    }
}
