//! # Reactive Kit
//!
//! Two small reactive building blocks for component-based UIs:
//!
//! - [`EventBus`]: a typed, scoped publish/subscribe bus whose subscriptions
//!   are released automatically when the owning context ends.
//! - [`FormProxy`]: a record whose field writes are queued and run through
//!   cascading field setters, with conflicting cascades rejected as a whole.
//!
//! The two share [`MaybeDeferred`] (user code may answer now or later) but
//! never call each other.
//!
//! ## Event Bus
//!
//! ```text
//! root bus (shared handler table, origin id)
//!     │
//!     ├─► client "panel-3"   tracks its own subscriptions + watchers
//!     │       └─ torn down by its LifecycleHost
//!     │
//!     └─► client "toolbar-4"
//!
//! emit(event, data)
//!     └─► every handler of `event`, in registration order
//!             └─► non-empty replies, in handler order
//! ```
//!
//! ```
//! use reactive_kit::{EventBus, Handler, Scope};
//!
//! let bus: EventBus<&str, u32, u32> = EventBus::new("cart");
//! let scope = Scope::new();
//! let panel = bus.scoped(&scope, Some("panel"));
//! panel.subscribe("add", Handler::sync(|qty: &u32| Some(qty * 2)));
//!
//! assert_eq!(bus.emit_sync(&"add", 4), vec![8]);
//!
//! scope.end();
//! assert!(bus.emit_sync(&"add", 4).is_empty());
//! ```
//!
//! ## Form Proxy
//!
//! ```text
//! set(field, value) ─► queue ─► head write
//!                                   │
//!                                   ▼
//!                       field setter ─► seed change-set
//!                                   │
//!                                   ▼ for every unresolved field
//!                       its setter ─► expand ─► compare
//!                                   │
//!                     ┌─────────────┴─────────────┐
//!                     ▼                           ▼
//!               apply change-set          reject, discard queue
//! ```
//!
//! ## Guarantees
//!
//! - **FIFO writes**: a queued write never starts before the one ahead of it
//!   applied or was rejected
//! - **All or nothing**: a rejected write leaves the record untouched
//! - **Bounded cascades**: each field's setter runs at most once per write
//! - **Isolated handlers**: a failing or panicking handler never affects the
//!   emitter or the other handlers

mod bridge;
mod bus;
mod cascade;
mod deferred;
mod error;
mod form;
mod handler;
mod lifecycle;
mod observer;
mod options;
mod patch;
mod reactive;
mod sync;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests
#[cfg(test)]
mod stress_tests;

// Event bus
pub use bridge::{BroadcastBridge, Envelope};
pub use bus::{EventBus, EventBusBuilder};
pub use handler::{Handler, HandlerId, HandlerMap, HandlerOutput, Selector};
pub use lifecycle::{LifecycleHost, Scope, Teardown};
pub use observer::{BusObserver, BusRecord, BusRecordKind, TracingObserver};

// Form proxy
pub use form::{FormProxy, FormProxyBuilder};
pub use options::{deferred_setter, sync_setter, Comparator, FormOptions, Mode, Setter, SetterOutput};
pub use patch::{Patch, Record};

// Shared
pub use deferred::MaybeDeferred;
pub use error::{BusError, CascadeError, ConfigError};
pub use reactive::{Observable, Subscription};
