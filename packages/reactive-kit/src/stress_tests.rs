//! Stress tests designed to break the queue, the cascade, and the bus.
//!
//! Write sequences and setter graphs are generated from fixed `fastrand`
//! seeds so failures reproduce.

#[cfg(test)]
mod stress_tests {
    use crate::bus::EventBus;
    use crate::error::CascadeError;
    use crate::form::FormProxy;
    use crate::handler::{Handler, HandlerMap};
    use crate::lifecycle::Scope;
    use crate::options::{deferred_setter, sync_setter};
    use crate::patch::{Patch, Record};
    use crate::reactive::Observable;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    const SEEDS: [u64; 4] = [7, 42, 1337, 9001];

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("record must be an object"),
        }
    }

    // ==========================================================================
    // TEST: Writes apply in issuance order
    // ==========================================================================
    //
    // A deferred setter appends every write to a trace and suspends a random
    // number of times. Writes to a field without a setter are interleaved.
    // If a queued write ever overtook an earlier one the trace would be out
    // of order.

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writes_apply_in_issuance_order() {
        for seed in SEEDS {
            let mut rng = fastrand::Rng::with_seed(seed);

            let form = FormProxy::builder(record(json!({"trace": [], "plain": null})))
                .with_setter(
                    "step",
                    deferred_setter(|record, value| {
                        let mut trace = record
                            .get("trace")
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default();
                        let n = value["n"].clone();
                        let yields = value["yields"].as_u64().unwrap_or(0);
                        trace.push(n.clone());
                        async move {
                            for _ in 0..yields {
                                tokio::task::yield_now().await;
                            }
                            Ok(Some(Patch::single("step", n).with("trace", trace)))
                        }
                    }),
                )
                .build();

            let mut expected = Vec::new();
            let mut last_plain = Value::Null;
            for n in 0..200u64 {
                if rng.u8(..4) == 0 {
                    last_plain = json!(n);
                    form.set("plain", n);
                } else {
                    expected.push(json!(n));
                    form.set("step", json!({"n": n, "yields": rng.u64(..4)}));
                }
            }

            assert!(form.settled().await, "seed {seed}");
            assert_eq!(form.get("trace"), Some(Value::Array(expected)), "seed {seed}");
            assert_eq!(form.get("plain"), Some(last_plain), "seed {seed}");
            assert_eq!(form.pending(), 0);
        }
    }

    // ==========================================================================
    // TEST: Cascades terminate within one call per field
    // ==========================================================================
    //
    // Random setter graphs, cycles included. Every setter forwards the same
    // value to a random set of fields, so no cascade conflicts; the number of
    // setter calls per write must never exceed the number of fields.

    #[test]
    fn test_cascades_terminate_on_random_graphs() {
        const FIELDS: usize = 12;

        for seed in SEEDS {
            let mut rng = fastrand::Rng::with_seed(seed);
            let calls = Arc::new(AtomicUsize::new(0));

            let mut builder = FormProxy::builder(Record::new());
            for field in 0..FIELDS {
                let targets: Vec<String> = (0..FIELDS)
                    .filter(|other| *other != field && rng.u8(..3) == 0)
                    .map(|other| format!("f{other}"))
                    .collect();
                let own = format!("f{field}");
                let calls = calls.clone();
                builder = builder.with_setter(
                    own.clone(),
                    sync_setter(move |_, value| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let mut patch = Patch::single(own.clone(), value.clone());
                        for target in &targets {
                            patch.insert(target.clone(), value.clone());
                        }
                        Some(patch)
                    }),
                );
            }
            let form = builder.build();

            for round in 0..50 {
                calls.store(0, Ordering::SeqCst);
                let field = format!("f{}", rng.usize(..FIELDS));
                form.set(field.as_str(), round);

                let made = calls.load(Ordering::SeqCst);
                assert!(made >= 1 && made <= FIELDS, "seed {seed}: {made} setter calls");
                assert_eq!(form.get(&field), Some(json!(round)));
                assert!(form.last_rejection().is_none(), "seed {seed}");
            }
        }
    }

    // ==========================================================================
    // TEST: A rejected write leaves no trace
    // ==========================================================================
    //
    // Like the graph above, but some setters transform the value on the way.
    // Whatever the outcome, a rejection must leave the record exactly as it
    // was and report the conflict once.

    #[tokio::test]
    async fn test_conflicts_roll_back_completely() {
        const FIELDS: usize = 8;

        for seed in SEEDS {
            let mut rng = fastrand::Rng::with_seed(seed);
            let conflicts = Arc::new(AtomicUsize::new(0));

            let mut builder = FormProxy::builder(Record::new());
            for field in 0..FIELDS {
                let targets: Vec<String> = (0..FIELDS)
                    .filter(|other| *other != field && rng.u8(..3) == 0)
                    .map(|other| format!("f{other}"))
                    .collect();
                let bump = rng.u8(..4) == 0;
                let own = format!("f{field}");
                builder = builder.with_setter(
                    own.clone(),
                    sync_setter(move |_, value| {
                        let n = value.as_i64()?;
                        let forwarded = if bump { n + 1 } else { n };
                        let mut patch = Patch::single(own.clone(), n);
                        for target in &targets {
                            patch.insert(target.clone(), forwarded);
                        }
                        Some(patch)
                    }),
                );
            }
            let counter = conflicts.clone();
            let form = builder
                .with_conflict_handler(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .build();

            for round in 0..60i64 {
                let before = form.snapshot();
                let reported = conflicts.load(Ordering::SeqCst);
                let field = format!("f{}", rng.usize(..FIELDS));
                form.set(field.as_str(), round * 10);

                if form.settled().await {
                    assert_eq!(form.get(&field), Some(json!(round * 10)), "seed {seed}");
                    assert_eq!(conflicts.load(Ordering::SeqCst), reported);
                } else {
                    assert_eq!(form.snapshot(), before, "seed {seed}: record changed");
                    assert_eq!(conflicts.load(Ordering::SeqCst), reported + 1);
                    assert!(matches!(
                        form.last_rejection(),
                        Some(CascadeError::Conflict { .. })
                    ));
                }
            }
        }
    }

    // ==========================================================================
    // TEST: Concurrent clients never leak handlers
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_scoped_clients_release_everything() {
        let root: EventBus<u8, u32, u32> = EventBus::new("stress");
        let delivered = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for worker in 0..32u32 {
            let root = root.clone();
            let delivered = delivered.clone();
            tasks.push(tokio::spawn(async move {
                let mut rng = fastrand::Rng::with_seed(u64::from(worker));
                for _ in 0..50 {
                    let scope = Scope::new();
                    let client = root.scoped(&scope, Some("worker"));
                    let key = Observable::new(Some(rng.u8(..4)));
                    let counter = delivered.clone();
                    client.subscribe(
                        &key,
                        Handler::sync(move |n: &u32| {
                            counter.fetch_add(1, Ordering::Relaxed);
                            Some(*n)
                        }),
                    );
                    client.once(rng.u8(..4), Handler::sync(|n: &u32| Some(*n)));

                    key.set(Some(rng.u8(..4)));
                    root.emit(&rng.u8(..4), worker).await;
                    key.set(None);
                    tokio::task::yield_now().await;
                    scope.end();
                    assert_eq!(key.subscriber_count(), 0);
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        for event in 0..4 {
            assert_eq!(root.listener_count(&event), 0, "event {event} leaked handlers");
        }
    }

    // ==========================================================================
    // TEST: Retargeting under concurrent emits keeps one binding
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_retarget_races_with_emit() {
        let bus: EventBus<&'static str, (), ()> = EventBus::new("retarget");
        let key = Observable::new(Some("left"));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        bus.subscribe(
            &key,
            Handler::sync(move |_: &()| {
                counter.fetch_add(1, Ordering::Relaxed);
                Some(())
            }),
        );

        let flipper = {
            let key = key.clone();
            tokio::spawn(async move {
                for i in 0..2_000 {
                    key.set(Some(if i % 2 == 0 { "right" } else { "left" }));
                    if i % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };
        let emitter = {
            let bus = bus.clone();
            tokio::spawn(async move {
                let mut per_round_max = 0;
                for i in 0..2_000 {
                    let replies = bus.emit_sync(&if i % 2 == 0 { "left" } else { "right" }, ());
                    per_round_max = per_round_max.max(replies.len());
                    if i % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                per_round_max
            })
        };

        flipper.await.unwrap();
        assert!(emitter.await.unwrap() <= 1, "handler was bound twice to one event");

        let bound = bus.listener_count(&"left") + bus.listener_count(&"right");
        assert_eq!(bound, 1);
        assert_eq!(bus.tracked_count(), 1);
        assert!(calls.load(Ordering::Relaxed) <= 2_000);
    }

    // ==========================================================================
    // TEST: Concurrent selector writers leave exactly one binding
    // ==========================================================================
    //
    // Several threads set the same selector at once, so watcher notifications
    // arrive in no particular order. Whatever order they arrive in, the
    // handler must end up bound once, to the selector's final value.

    const EVENTS: [&str; 8] = ["e0", "e1", "e2", "e3", "e4", "e5", "e6", "e7"];

    #[test]
    fn test_concurrent_selector_writers_leave_one_binding() {
        for seed in SEEDS {
            let bus: EventBus<&'static str, (), ()> = EventBus::new("selector-race");
            let key = Observable::new(Some(EVENTS[0]));
            bus.subscribe(&key, Handler::sync(|_: &()| Some(())));

            thread::scope(|scope| {
                for writer in 0..4u64 {
                    let key = key.clone();
                    scope.spawn(move || {
                        let mut rng = fastrand::Rng::with_seed(seed ^ writer);
                        for _ in 0..20_000 {
                            let next = rng.usize(..=EVENTS.len());
                            key.set(EVENTS.get(next).copied());
                        }
                    });
                }
                let bus = bus.clone();
                scope.spawn(move || {
                    for i in 0..20_000 {
                        let replies = bus.emit_sync(&EVENTS[i % EVENTS.len()], ());
                        assert!(replies.len() <= 1, "seed {seed}: handler bound twice");
                    }
                });
            });

            let bound: usize = EVENTS.iter().map(|e| bus.listener_count(e)).sum();
            match key.get() {
                Some(event) => {
                    assert_eq!(bound, 1, "seed {seed}: bindings leaked");
                    assert_eq!(bus.listener_count(&event), 1, "seed {seed}: bound to stale event");
                    assert_eq!(bus.tracked_count(), 1);
                }
                None => {
                    assert_eq!(bound, 0, "seed {seed}: bindings leaked");
                    assert_eq!(bus.tracked_count(), 0);
                }
            }
        }
    }

    // ==========================================================================
    // TEST: Concurrent handler map swaps leave the current map bound
    // ==========================================================================

    #[test]
    fn test_concurrent_map_swaps_leave_current_map_bound() {
        let handlers: Vec<Handler<(), ()>> =
            (0..4).map(|_| Handler::sync(|_: &()| Some(()))).collect();
        let maps: Vec<HandlerMap<&'static str, (), ()>> = (0..6)
            .map(|i| {
                (0..=i % 3)
                    .map(|j| (EVENTS[(i + j) % EVENTS.len()], handlers[(i + j) % handlers.len()].clone()))
                    .collect()
            })
            .collect();

        for seed in SEEDS {
            let bus: EventBus<&'static str, (), ()> = EventBus::new("map-race");
            let source = Observable::new(maps[0].clone());
            bus.subscribe_many_dynamic(&source);

            thread::scope(|scope| {
                for writer in 0..4u64 {
                    let source = source.clone();
                    let maps = &maps;
                    scope.spawn(move || {
                        let mut rng = fastrand::Rng::with_seed(seed ^ writer);
                        for _ in 0..10_000 {
                            source.set(maps[rng.usize(..maps.len())].clone());
                        }
                    });
                }
            });

            let current = source.get();
            for event in EVENTS {
                let expected = current.iter().filter(|(e, _)| *e == event).count();
                assert_eq!(
                    bus.listener_count(&event),
                    expected,
                    "seed {seed}: event {event} does not match the current map"
                );
            }
            assert_eq!(bus.tracked_count(), current.len());
        }
    }
}
