//! Cascade resolution: turning one external write into a full change-set.
//!
//! # Algorithm
//!
//! 1. The written field's setter (if any) runs against the live record and
//!    produces the seed change-set. No setter, or a setter answering `None`,
//!    seeds `{field: value}`.
//! 2. Every field of a change-set that has a setter and was not yet resolved
//!    in this cascade has its setter run, in key order. The setter sees the
//!    accumulated state with its own field at the pre-write value.
//! 3. The setter's answer is expanded the same way, then compared with what
//!    the change-set already holds. Any disagreeing field rejects the whole
//!    write as a conflict attributed to that setter's field.
//!
//! Each field resolves at most once per cascade, so a cascade over N fields
//! with setters makes at most N setter calls.
//!
//! A setter that panics, immediately or while its deferred answer runs, is
//! treated as a failed setter for its field.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::trace;

use crate::deferred::panic_message;
use crate::error::CascadeError;
use crate::options::{FormOptions, Setter};
use crate::patch::{merged, Patch, Record};

/// One external field write, waiting in or at the head of the queue.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingWrite {
    pub field: String,
    pub value: Value,
}

/// Resolve `write` against `live` into the change-set to apply.
pub(crate) async fn resolve(
    options: Arc<FormOptions>,
    live: Record,
    write: PendingWrite,
) -> Result<Patch, CascadeError> {
    let PendingWrite { field, value } = write;

    let Some(setter) = options.setter(&field) else {
        return Ok(Patch::single(field, value));
    };

    trace!(field = %field, "running setter for written field");
    let produced = run_setter(setter.as_ref(), &field, &live, &value).await?;
    let seed = produced.unwrap_or_else(|| Patch::single(field.clone(), value));

    let mut resolved = HashSet::from([field]);
    expand(&options, &live, &live, seed, &mut resolved).await
}

/// Call one setter and wait for its answer, containing failures and panics.
async fn run_setter(
    setter: &dyn Setter,
    field: &str,
    record: &Record,
    value: &Value,
) -> Result<Option<Patch>, CascadeError> {
    let output = catch_unwind(AssertUnwindSafe(|| setter.call(record, value))).map_err(|panic| {
        CascadeError::setter_failed(field, anyhow!("setter panicked: {}", panic_message(&*panic)))
    })?;

    match AssertUnwindSafe(output.resolve()).catch_unwind().await {
        Ok(result) => result.map_err(|err| CascadeError::setter_failed(field, err)),
        Err(panic) => Err(CascadeError::setter_failed(
            field,
            anyhow!("setter panicked: {}", panic_message(&*panic)),
        )),
    }
}

/// Run the setters of every unresolved field in `changes`, folding their
/// answers into `changes`.
///
/// `base` is the state `changes` applies on top of; `live` supplies the
/// pre-write value each setter sees for its own field.
fn expand<'a>(
    options: &'a FormOptions,
    live: &'a Record,
    base: &'a Record,
    mut changes: Patch,
    resolved: &'a mut HashSet<String>,
) -> BoxFuture<'a, Result<Patch, CascadeError>> {
    async move {
        let mut current = merged(base, &changes);
        let fields: Vec<String> = changes.keys().cloned().collect();

        for field in fields {
            if resolved.contains(&field) {
                continue;
            }
            let Some(setter) = options.setter(&field) else {
                continue;
            };
            let proposed = changes.get(&field).cloned().unwrap_or(Value::Null);

            let mut view = current.clone();
            match live.get(&field) {
                Some(previous) => {
                    view.insert(field.clone(), previous.clone());
                }
                None => {
                    view.remove(&field);
                }
            }

            trace!(field = %field, "running cascaded setter");
            let produced = run_setter(setter.as_ref(), &field, &view, &proposed).await?;
            resolved.insert(field.clone());

            let seed = produced.unwrap_or_else(|| Patch::single(field.clone(), proposed));
            let derived = expand(options, live, &current, seed, resolved).await?;

            for (key, value) in derived.iter() {
                if let Some(earlier) = changes.get(key) {
                    if !options.same(key, earlier, value) {
                        return Err(CascadeError::Conflict { field });
                    }
                }
            }

            derived.apply_to(&mut current);
            changes.merge(&derived);
        }

        Ok(changes)
    }
    .boxed()
}
