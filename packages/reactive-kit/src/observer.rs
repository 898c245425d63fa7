//! Bus observers - watch bus activity without taking part in it.
//!
//! An observer receives a [`BusRecord`] for every client construction and
//! teardown, every emit, and every delivery of an event to a handler. This is
//! the hook a devtools panel or an audit log plugs into.
//!
//! # Guarantees
//!
//! - Observers are fire-and-forget: they cannot block, fail, or alter
//!   delivery.
//! - A panicking observer is caught and logged; the bus carries on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{trace, warn};

/// What happened on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusRecordKind {
    /// A client handle was created.
    Construct,
    /// A client handle was torn down.
    Destroy,
    /// An event was emitted.
    Emit,
    /// An event was delivered to one handler.
    Receive,
}

/// One observed bus occurrence.
#[derive(Debug, Clone, Serialize)]
pub struct BusRecord {
    pub kind: BusRecordKind,
    /// Name of the bus the client belongs to.
    pub bus: String,
    /// Group id of the client that emitted, or that owns the receiving handler.
    pub group: String,
    /// Instance name of the emitting or constructed client, if any.
    pub instance: Option<String>,
    /// Debug rendering of the event key, for emit and receive records.
    pub event: Option<String>,
    pub at: DateTime<Utc>,
}

impl BusRecord {
    pub(crate) fn new(kind: BusRecordKind, bus: &str, group: &str) -> Self {
        Self {
            kind,
            bus: bus.to_string(),
            group: group.to_string(),
            instance: None,
            event: None,
            at: Utc::now(),
        }
    }

    pub(crate) fn with_instance(mut self, instance: Option<&str>) -> Self {
        self.instance = instance.map(str::to_string);
        self
    }

    pub(crate) fn with_event(mut self, event: &impl std::fmt::Debug) -> Self {
        self.event = Some(format!("{event:?}"));
        self
    }
}

/// Sink for bus activity.
pub trait BusObserver: Send + Sync + 'static {
    /// Called synchronously for every record. Keep it cheap.
    fn record(&self, record: &BusRecord);
}

/// Observer that forwards every record to `tracing` at trace level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl BusObserver for TracingObserver {
    fn record(&self, record: &BusRecord) {
        trace!(
            kind = ?record.kind,
            bus = %record.bus,
            group = %record.group,
            instance = ?record.instance,
            event = ?record.event,
            "bus activity"
        );
    }
}

/// Hand a record to the observer, if any. Panics stay inside.
///
/// The record is only built when an observer is installed.
pub(crate) fn notify(observer: Option<&Arc<dyn BusObserver>>, build: impl FnOnce() -> BusRecord) {
    let Some(observer) = observer else {
        return;
    };
    let record = build();
    if catch_unwind(AssertUnwindSafe(|| observer.record(&record))).is_err() {
        warn!(kind = ?record.kind, bus = %record.bus, "bus observer panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Collecting(Mutex<Vec<BusRecord>>);

    impl BusObserver for Collecting {
        fn record(&self, record: &BusRecord) {
            self.0.lock().unwrap().push(record.clone());
        }
    }

    struct Exploding;

    impl BusObserver for Exploding {
        fn record(&self, _record: &BusRecord) {
            panic!("observer exploded");
        }
    }

    #[test]
    fn test_notify_delivers_record() {
        let collecting = Arc::new(Collecting(Mutex::new(Vec::new())));
        let observer: Arc<dyn BusObserver> = collecting.clone();

        notify(Some(&observer), || {
            BusRecord::new(BusRecordKind::Emit, "orders", "cart-0").with_event(&"checkout")
        });

        let records = collecting.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, BusRecordKind::Emit);
        assert_eq!(records[0].event.as_deref(), Some("\"checkout\""));
    }

    #[test]
    fn test_notify_without_observer_skips_build() {
        notify(None, || panic!("record must not be built"));
    }

    #[test]
    fn test_panicking_observer_is_contained() {
        let observer: Arc<dyn BusObserver> = Arc::new(Exploding);
        notify(Some(&observer), || {
            BusRecord::new(BusRecordKind::Construct, "orders", "cart-0")
        });
    }

    #[test]
    fn test_record_serializes_kind_in_snake_case() {
        let record = BusRecord::new(BusRecordKind::Receive, "orders", "cart-0")
            .with_instance(Some("cart"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "receive");
        assert_eq!(json["instance"], "cart");
    }
}
