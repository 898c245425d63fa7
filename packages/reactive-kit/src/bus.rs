//! Scoped publish/subscribe event bus.
//!
//! # Clients
//!
//! A root bus owns a handler table. [`EventBus::client`] and
//! [`EventBus::scoped`] hand out client handles that share that table but
//! keep their own list of the subscriptions they made. Tearing a client down
//! releases exactly those subscriptions and every dynamic-selector watcher
//! the client installed. A scoped client is torn down by its
//! [`LifecycleHost`] when the owning context ends.
//!
//! # Delivery
//!
//! - Handlers run in registration order.
//! - Handler failures and panics are contained per handler: the remaining
//!   handlers still run and the emitter never sees the failure.
//! - Only non-empty replies are returned, in handler order.
//!
//! # Retargeting
//!
//! A handler subscribed through a dynamic [`Selector`] follows the selector's
//! current value. Each change re-reads that value and moves the handler
//! inside a single critical section over the handler table and the client's
//! tracking list, so no emit can see it bound to both events or to neither.
//! Changes racing on several threads may notify in any order; the binding
//! still ends up on whatever the selector holds last.
//!
//! # Example
//!
//! ```
//! use reactive_kit::{EventBus, Handler, Observable};
//!
//! let bus: EventBus<&str, String, usize> = EventBus::new("editor");
//! let target = Observable::new(Some("save"));
//! bus.subscribe(&target, Handler::sync(|text: &String| Some(text.len())));
//!
//! assert_eq!(bus.emit_sync(&"save", "draft".to_string()), vec![5]);
//!
//! target.set(Some("publish"));
//! assert!(bus.emit_sync(&"save", "draft".to_string()).is_empty());
//! assert_eq!(bus.emit_sync(&"publish", "final".to_string()), vec![5]);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::anyhow;
use futures::future::join_all;
use futures::FutureExt;
use smallvec::SmallVec;
use tracing::debug;
use uuid::Uuid;

use crate::bridge::BroadcastBridge;
use crate::deferred::{panic_message, spawn_detached, MaybeDeferred};
use crate::error::BusError;
use crate::handler::{Handler, HandlerId, HandlerMap, HandlerOutput, Selector};
use crate::lifecycle::LifecycleHost;
use crate::observer::{notify, BusObserver, BusRecord, BusRecordKind};
use crate::reactive::{Observable, Subscription, WeakObservable};
use crate::sync::lock;

static NEXT_GROUP: AtomicU64 = AtomicU64::new(0);

// =============================================================================
// Internal State
// =============================================================================

/// A handler registered in the shared table, tagged with the owning client.
struct Entry<D, R> {
    handler: Handler<D, R>,
    group: Arc<str>,
}

impl<D, R> Clone for Entry<D, R> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            group: Arc::clone(&self.group),
        }
    }
}

type Table<K, D, R> = HashMap<K, SmallVec<[Entry<D, R>; 4]>>;

/// State shared by a root bus and all of its clients.
struct Shared<K, D, R> {
    name: String,
    origin: Uuid,
    handlers: Mutex<Table<K, D, R>>,
    observer: Option<Arc<dyn BusObserver>>,
    bridge: Option<BroadcastBridge<K, D>>,
}

/// A dynamic subscription: what it currently binds and the guard that keeps
/// it attached to its source.
struct Watcher<K, D, R> {
    id: u64,
    bound: Vec<(K, Handler<D, R>)>,
    _subscription: Subscription,
}

/// Per-client lifecycle tracking.
struct Tracking<K, D, R> {
    bindings: Vec<(K, Handler<D, R>)>,
    watchers: Vec<Watcher<K, D, R>>,
    next_watcher: u64,
    torn_down: bool,
}

struct Client<K, D, R> {
    group: Arc<str>,
    instance: Option<String>,
    tracking: Mutex<Tracking<K, D, R>>,
}

struct WeakBus<K, D, R> {
    shared: Weak<Shared<K, D, R>>,
    client: Weak<Client<K, D, R>>,
}

impl<K, D, R> WeakBus<K, D, R> {
    fn upgrade(&self) -> Option<EventBus<K, D, R>> {
        Some(EventBus {
            shared: self.shared.upgrade()?,
            client: self.client.upgrade()?,
        })
    }
}

/// Outcome of collecting handler results: successes are kept, failures are
/// only counted.
struct Delivery<R> {
    replies: Vec<R>,
    failed: usize,
}

fn collect_replies<R>(results: impl IntoIterator<Item = anyhow::Result<Option<R>>>) -> Delivery<R> {
    let mut delivery = Delivery {
        replies: Vec::new(),
        failed: 0,
    };
    for result in results {
        match result {
            Ok(Some(reply)) => delivery.replies.push(reply),
            Ok(None) => {}
            Err(err) => {
                debug!(error = %err, "handler failed, error discarded");
                delivery.failed += 1;
            }
        }
    }
    delivery
}

// =============================================================================
// Event Bus
// =============================================================================

/// A client handle on a shared event bus.
///
/// - `K`: event key, e.g. a `&'static str` or an enum of event names
/// - `D`: event payload
/// - `R`: handler reply type
///
/// Cloning an `EventBus` creates another handle to the **same** client.
/// Use [`client`](Self::client) or [`scoped`](Self::scoped) for a new client.
pub struct EventBus<K, D, R = ()> {
    shared: Arc<Shared<K, D, R>>,
    client: Arc<Client<K, D, R>>,
}

impl<K, D, R> Clone for EventBus<K, D, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            client: Arc::clone(&self.client),
        }
    }
}

impl<K, D, R> EventBus<K, D, R>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    /// Create a new root bus with no observer and no bridge.
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    /// Start configuring a new root bus.
    pub fn builder(name: impl Into<String>) -> EventBusBuilder<K, D, R> {
        EventBusBuilder::new(name)
    }

    /// Create a client that shares this bus's handler table.
    ///
    /// The client is not bound to any lifecycle; call
    /// [`teardown`](Self::teardown) to release its subscriptions.
    pub fn client(&self, instance: Option<&str>) -> Self {
        Self::open(Arc::clone(&self.shared), instance.map(str::to_string))
    }

    /// Create a client whose subscriptions are released when `host` ends.
    pub fn scoped(&self, host: &dyn LifecycleHost, instance: Option<&str>) -> Self {
        let client = self.client(instance);
        let handle = client.clone();
        host.on_teardown(Box::new(move || handle.teardown()));
        client
    }

    fn open(shared: Arc<Shared<K, D, R>>, instance: Option<String>) -> Self {
        let group: Arc<str> = format!(
            "{}-{}",
            instance.as_deref().unwrap_or("unnamed"),
            NEXT_GROUP.fetch_add(1, Ordering::Relaxed)
        )
        .into();

        notify(shared.observer.as_ref(), || {
            BusRecord::new(BusRecordKind::Construct, &shared.name, &group)
                .with_instance(instance.as_deref())
        });

        Self {
            shared,
            client: Arc::new(Client {
                group,
                instance,
                tracking: Mutex::new(Tracking {
                    bindings: Vec::new(),
                    watchers: Vec::new(),
                    next_watcher: 0,
                    torn_down: false,
                }),
            }),
        }
    }

    fn downgrade(&self) -> WeakBus<K, D, R> {
        WeakBus {
            shared: Arc::downgrade(&self.shared),
            client: Arc::downgrade(&self.client),
        }
    }

    // -------------------------------------------------------------------------
    // Table bookkeeping (callers hold both locks: table first, then tracking)
    // -------------------------------------------------------------------------

    fn link(
        &self,
        table: &mut Table<K, D, R>,
        tracking: &mut Tracking<K, D, R>,
        event: K,
        handler: Handler<D, R>,
    ) {
        table.entry(event.clone()).or_default().push(Entry {
            handler: handler.clone(),
            group: Arc::clone(&self.client.group),
        });
        tracking.bindings.push((event, handler));
    }

    fn unlink(
        &self,
        table: &mut Table<K, D, R>,
        tracking: &mut Tracking<K, D, R>,
        event: &K,
        id: HandlerId,
    ) -> bool {
        let Some(list) = table.get_mut(event) else {
            return false;
        };
        let Some(pos) = list
            .iter()
            .position(|e| e.handler.id() == id && e.group == self.client.group)
        else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            table.remove(event);
        }
        if let Some(tracked) = tracking
            .bindings
            .iter()
            .position(|(k, h)| k == event && h.id() == id)
        {
            tracking.bindings.remove(tracked);
        }
        true
    }

    fn bind(&self, add: Vec<(K, Handler<D, R>)>) {
        let mut table = lock(&self.shared.handlers);
        let mut tracking = lock(&self.client.tracking);
        if tracking.torn_down {
            debug!(group = %self.client.group, "subscribe on torn-down client ignored");
            return;
        }
        for (event, handler) in add {
            self.link(&mut table, &mut tracking, event, handler);
        }
    }

    /// Move watcher `id` onto the bindings derived from `source` as it is now.
    ///
    /// Reading the source under the table and tracking locks means the last
    /// rebind to run always sees the last value set.
    fn rebind<T>(
        &self,
        id: u64,
        source: &Observable<T>,
        bindings: &dyn Fn(&T) -> Vec<(K, Handler<D, R>)>,
    ) where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let mut table = lock(&self.shared.handlers);
        let mut tracking = lock(&self.client.tracking);
        if tracking.torn_down {
            return;
        }
        let Some(pos) = tracking.watchers.iter().position(|w| w.id == id) else {
            return;
        };
        let next = source.with(|current| bindings(current));
        if tracking.watchers[pos].bound == next {
            return;
        }
        let previous = std::mem::replace(&mut tracking.watchers[pos].bound, next.clone());
        for (event, handler) in &previous {
            self.unlink(&mut table, &mut tracking, event, handler.id());
        }
        for (event, handler) in next {
            self.link(&mut table, &mut tracking, event, handler);
        }
    }

    fn release(&self, event: &K, id: HandlerId) {
        let mut table = lock(&self.shared.handlers);
        let mut tracking = lock(&self.client.tracking);
        self.unlink(&mut table, &mut tracking, event, id);
    }

    // -------------------------------------------------------------------------
    // Subscribing
    // -------------------------------------------------------------------------

    /// Subscribe `handler` to the event named by `selector`.
    ///
    /// With a dynamic selector the handler follows the observable: each
    /// change moves it to the event the selector currently names before
    /// `Observable::set` returns. `None` leaves it unbound.
    ///
    /// Subscribing through a torn-down client does nothing.
    pub fn subscribe(&self, selector: impl Into<Selector<K>>, handler: Handler<D, R>) -> &Self {
        let source = match selector.into() {
            Selector::Fixed(None) => return self,
            Selector::Fixed(Some(event)) => {
                self.bind(vec![(event, handler)]);
                return self;
            }
            Selector::Dynamic(source) => source,
        };

        self.watch(&source, move |current: &Option<K>| {
            current
                .iter()
                .map(|event| (event.clone(), handler.clone()))
                .collect()
        });
        self
    }

    /// Subscribe every handler in `map`.
    pub fn subscribe_many(&self, map: HandlerMap<K, D, R>) -> &Self {
        self.bind(map.iter().cloned().collect());
        self
    }

    /// Subscribe the handlers of a map that may be replaced wholesale.
    ///
    /// Replacing the observable's value unbinds every handler of the map
    /// previously bound and binds every handler of the current one, as one
    /// step.
    pub fn subscribe_many_dynamic(&self, source: &Observable<HandlerMap<K, D, R>>) -> &Self {
        self.watch(source, |current: &HandlerMap<K, D, R>| {
            current.iter().cloned().collect()
        });
        self
    }

    /// Install a watcher on `source` and bind what `bindings` derives from
    /// its current value.
    ///
    /// Both locks are held while the watcher registers, so a concurrent
    /// change waits for the initial binding and then moves it.
    fn watch<T>(
        &self,
        source: &Observable<T>,
        bindings: impl Fn(&T) -> Vec<(K, Handler<D, R>)> + Send + Sync + 'static,
    ) where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let bindings = Arc::new(bindings);
        let mut table = lock(&self.shared.handlers);
        let mut tracking = lock(&self.client.tracking);
        if tracking.torn_down {
            debug!(group = %self.client.group, "subscribe on torn-down client ignored");
            return;
        }
        let id = tracking.next_watcher;
        tracking.next_watcher += 1;

        let bus = self.downgrade();
        let weak_source: WeakObservable<T> = source.downgrade();
        let derive = Arc::clone(&bindings);
        let (current, subscription) = source.subscribe_with_current(move |_, _| {
            let (Some(bus), Some(source)) = (bus.upgrade(), weak_source.upgrade()) else {
                return;
            };
            bus.rebind(id, &source, &*derive);
        });

        let bound = bindings(&current);
        for (event, handler) in &bound {
            self.link(&mut table, &mut tracking, event.clone(), handler.clone());
        }
        tracking.watchers.push(Watcher {
            id,
            bound,
            _subscription: subscription,
        });
    }

    /// Subscribe a handler that releases itself the first time it fires.
    ///
    /// The subscription is released once the wrapped handler returns or
    /// panics. Only the first invocation reaches the handler, so a handler
    /// that re-emits the same event does not see itself again.
    pub fn once(&self, event: K, handler: Handler<D, R>) -> &Self {
        let id = HandlerId::next();
        let fired = AtomicBool::new(false);
        let weak = self.downgrade();
        let key = event.clone();
        let wrapper = Handler::with_id(id, move |data: &D| {
            if fired.swap(true, Ordering::AcqRel) {
                return MaybeDeferred::Ready(None);
            }
            let output = catch_unwind(AssertUnwindSafe(|| handler.call(data)));
            if let Some(bus) = weak.upgrade() {
                bus.release(&key, id);
            }
            match output {
                Ok(output) => output,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        });
        self.bind(vec![(event, wrapper)]);
        self
    }

    /// Remove one subscription of `handler` to `event`.
    ///
    /// Does nothing if the handler is not subscribed to `event`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UntrackedHandler`] if the handler is registered
    /// for `event` but this client has no record of subscribing it, either
    /// because another client owns it or because the tracking list lost it.
    pub fn unsubscribe(&self, event: &K, handler: &Handler<D, R>) -> Result<&Self, BusError> {
        let mut table = lock(&self.shared.handlers);
        let mut tracking = lock(&self.client.tracking);

        let Some(list) = table.get(event) else {
            return Ok(self);
        };
        let owned = list
            .iter()
            .any(|e| e.handler == *handler && e.group == self.client.group);
        let tracked = tracking
            .bindings
            .iter()
            .any(|(k, h)| k == event && h == handler);
        if !owned {
            if list.iter().any(|e| e.handler == *handler) {
                return Err(BusError::UntrackedHandler {
                    event: format!("{event:?}"),
                });
            }
            return Ok(self);
        }
        if !tracked {
            return Err(BusError::UntrackedHandler {
                event: format!("{event:?}"),
            });
        }

        self.unlink(&mut table, &mut tracking, event, handler.id());
        Ok(self)
    }

    /// Release every subscription and watcher this client created.
    ///
    /// Runs at most once; later calls do nothing.
    pub fn teardown(&self) {
        let watchers = {
            let mut table = lock(&self.shared.handlers);
            let mut tracking = lock(&self.client.tracking);
            if tracking.torn_down {
                return;
            }
            tracking.torn_down = true;

            for (event, handler) in std::mem::take(&mut tracking.bindings) {
                if let Some(list) = table.get_mut(&event) {
                    if let Some(pos) = list
                        .iter()
                        .position(|e| e.handler == handler && e.group == self.client.group)
                    {
                        list.remove(pos);
                    }
                    if list.is_empty() {
                        table.remove(&event);
                    }
                }
            }
            std::mem::take(&mut tracking.watchers)
        };
        drop(watchers);

        debug!(bus = %self.shared.name, group = %self.client.group, "client torn down");
        notify(self.shared.observer.as_ref(), || {
            BusRecord::new(BusRecordKind::Destroy, &self.shared.name, &self.client.group)
                .with_instance(self.client.instance.as_deref())
        });
    }

    // -------------------------------------------------------------------------
    // Emitting
    // -------------------------------------------------------------------------

    fn record_emit(&self, event: &K) {
        notify(self.shared.observer.as_ref(), || {
            BusRecord::new(BusRecordKind::Emit, &self.shared.name, &self.client.group)
                .with_instance(self.client.instance.as_deref())
                .with_event(event)
        });
    }

    /// Call every handler currently registered for `event`, in order.
    fn invoke_all(&self, event: &K, data: &D) -> Vec<HandlerOutput<R>> {
        let entries = lock(&self.shared.handlers)
            .get(event)
            .cloned()
            .unwrap_or_default();

        entries
            .iter()
            .map(|entry| {
                notify(self.shared.observer.as_ref(), || {
                    BusRecord::new(BusRecordKind::Receive, &self.shared.name, &entry.group)
                        .with_event(event)
                });
                match catch_unwind(AssertUnwindSafe(|| entry.handler.call(data))) {
                    Ok(output) => output,
                    Err(panic) => MaybeDeferred::Failed(anyhow!(
                        "handler {} panicked: {}",
                        entry.handler.id(),
                        panic_message(&*panic)
                    )),
                }
            })
            .collect()
    }

    /// Deliver `data` to every handler of `event` and wait for all replies.
    ///
    /// Handlers are called immediately, in registration order, before this
    /// method returns; the returned future waits for deferred replies
    /// concurrently. Resolves to the non-empty replies in handler order.
    /// Failed or panicking handlers are skipped silently.
    pub fn emit(&self, event: &K, data: D) -> impl Future<Output = Vec<R>> + Send + 'static {
        self.record_emit(event);
        let outputs = self.invoke_all(event, &data);

        async move {
            let settled = join_all(
                outputs
                    .into_iter()
                    .map(|output| AssertUnwindSafe(output.resolve()).catch_unwind()),
            )
            .await;

            let delivery = collect_replies(settled.into_iter().map(|result| match result {
                Ok(outcome) => outcome,
                Err(panic) => Err(anyhow!("deferred handler panicked: {}", panic_message(&*panic))),
            }));
            if delivery.failed > 0 {
                debug!(failed = delivery.failed, "emit finished with failed handlers");
            }
            delivery.replies
        }
    }

    /// Deliver `data` to every handler of `event` synchronously.
    ///
    /// Returns the non-empty immediate replies in handler order. Deferred
    /// replies are spawned on the ambient runtime and never reported. When
    /// the bus has a bridge, the event is posted to it first.
    pub fn emit_sync(&self, event: &K, data: D) -> Vec<R> {
        self.record_emit(event);
        if let Some(bridge) = &self.shared.bridge {
            bridge.post(self.shared.origin, event.clone(), data.clone());
        }

        let mut results = Vec::new();
        for output in self.invoke_all(event, &data) {
            match output {
                MaybeDeferred::Ready(reply) => results.push(Ok(reply)),
                MaybeDeferred::Failed(err) => results.push(Err(err)),
                MaybeDeferred::Deferred(future) => {
                    let spawned = spawn_detached(
                        async move {
                            if let Err(err) = future.await {
                                debug!(error = %err, "deferred handler failed, error discarded");
                            }
                        }
                        .boxed(),
                    );
                    if !spawned {
                        debug!(event = ?event, "no runtime for deferred handler reply, dropped");
                    }
                }
            }
        }
        collect_replies(results).replies
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Name of the bus this client belongs to.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// This client's instance name.
    pub fn instance(&self) -> Option<&str> {
        self.client.instance.as_deref()
    }

    /// This client's group id, `"{instance}-{n}"`.
    pub fn group(&self) -> &str {
        &self.client.group
    }

    /// Identifies the bus on a [`BroadcastBridge`]. Shared by all clients.
    pub fn origin(&self) -> Uuid {
        self.shared.origin
    }

    /// Number of handlers registered for `event`, across all clients.
    pub fn listener_count(&self, event: &K) -> usize {
        lock(&self.shared.handlers)
            .get(event)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Number of subscriptions this client currently tracks.
    pub fn tracked_count(&self) -> usize {
        lock(&self.client.tracking).bindings.len()
    }

    /// Number of dynamic-selector watchers this client holds.
    pub fn watcher_count(&self) -> usize {
        lock(&self.client.tracking).watchers.len()
    }

    pub fn is_torn_down(&self) -> bool {
        lock(&self.client.tracking).torn_down
    }
}

impl<K, D, R> std::fmt::Debug for EventBus<K, D, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.shared.name)
            .field("group", &self.client.group)
            .field("origin", &self.shared.origin)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for a root [`EventBus`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use reactive_kit::{BroadcastBridge, EventBus, TracingObserver};
///
/// let bridge = BroadcastBridge::new();
/// let bus: EventBus<&str, u32> = EventBus::builder("cart")
///     .with_instance("checkout")
///     .with_observer(Arc::new(TracingObserver))
///     .with_bridge(bridge)
///     .build();
/// assert_eq!(bus.instance(), Some("checkout"));
/// ```
pub struct EventBusBuilder<K, D, R = ()> {
    name: String,
    instance: Option<String>,
    observer: Option<Arc<dyn BusObserver>>,
    bridge: Option<BroadcastBridge<K, D>>,
    _reply: PhantomData<fn() -> R>,
}

impl<K, D, R> EventBusBuilder<K, D, R>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
    D: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance: None,
            observer: None,
            bridge: None,
            _reply: PhantomData,
        }
    }

    /// Instance name of the root client.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Observer notified of all bus activity.
    pub fn with_observer(mut self, observer: Arc<dyn BusObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Bridge that every `emit_sync` is posted to.
    pub fn with_bridge(mut self, bridge: BroadcastBridge<K, D>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn build(self) -> EventBus<K, D, R> {
        let shared = Arc::new(Shared {
            name: self.name,
            origin: Uuid::new_v4(),
            handlers: Mutex::new(HashMap::new()),
            observer: self.observer,
            bridge: self.bridge,
        });
        EventBus::open(shared, self.instance)
    }
}
