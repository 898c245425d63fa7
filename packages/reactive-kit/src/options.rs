//! Form proxy configuration: apply mode, field setters, and comparators.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::deferred::MaybeDeferred;
use crate::error::ConfigError;
use crate::patch::{Patch, Record};

/// How an accepted change-set is written into the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Merge changed fields into the existing record. Watchers are only
    /// notified when some value actually changed.
    #[default]
    Assign,
    /// Replace the whole record with `old ⊕ changes`. Watchers are always
    /// notified.
    Reassign,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Assign => f.write_str("assign"),
            Mode::Reassign => f.write_str("reassign"),
        }
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assign" => Ok(Mode::Assign),
            "reassign" => Ok(Mode::Reassign),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

// =============================================================================
// Setters
// =============================================================================

/// What a setter hands back: the fields to change, nothing (meaning "write
/// the proposed value as is"), or a deferred answer.
pub type SetterOutput = MaybeDeferred<Option<Patch>>;

/// A field rule run when the field is written.
///
/// Receives the record as it looks to this field (every change accumulated
/// so far, with this field still at its pre-write value) and the proposed
/// value. Implemented for any matching closure; see [`sync_setter`] and
/// [`deferred_setter`] for closures that don't build a [`SetterOutput`]
/// themselves.
pub trait Setter: Send + Sync + 'static {
    fn call(&self, record: &Record, value: &Value) -> SetterOutput;
}

impl<F> Setter for F
where
    F: Fn(&Record, &Value) -> SetterOutput + Send + Sync + 'static,
{
    fn call(&self, record: &Record, value: &Value) -> SetterOutput {
        self(record, value)
    }
}

/// A setter that answers immediately.
pub fn sync_setter<F>(func: F) -> impl Setter
where
    F: Fn(&Record, &Value) -> Option<Patch> + Send + Sync + 'static,
{
    move |record: &Record, value: &Value| MaybeDeferred::Ready(func(record, value))
}

/// A setter that answers with a future.
///
/// The closure runs synchronously and must copy whatever it needs out of
/// the record before returning the future.
pub fn deferred_setter<F, Fut>(func: F) -> impl Setter
where
    F: Fn(&Record, &Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Patch>>> + Send + 'static,
{
    move |record: &Record, value: &Value| MaybeDeferred::deferred(func(record, value))
}

/// Field equality used for conflict detection. Returns true when equal.
pub type Comparator = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

pub(crate) type ConflictHandler = Arc<dyn Fn(&str) + Send + Sync>;

// =============================================================================
// Options
// =============================================================================

/// Resolved form proxy configuration.
#[derive(Clone, Default)]
pub struct FormOptions {
    pub(crate) mode: Mode,
    pub(crate) setters: HashMap<String, Arc<dyn Setter>>,
    pub(crate) comparators: HashMap<String, Comparator>,
    pub(crate) on_conflict: Option<ConflictHandler>,
}

impl FormOptions {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn has_setter(&self, field: &str) -> bool {
        self.setters.contains_key(field)
    }

    pub(crate) fn setter(&self, field: &str) -> Option<&Arc<dyn Setter>> {
        self.setters.get(field)
    }

    /// Whether two values for `field` agree, by its comparator or by `==`.
    pub(crate) fn same(&self, field: &str, earlier: &Value, later: &Value) -> bool {
        match self.comparators.get(field) {
            Some(compare) => compare(earlier, later),
            None => earlier == later,
        }
    }
}

impl fmt::Debug for FormOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut setters: Vec<_> = self.setters.keys().collect();
        setters.sort();
        let mut comparators: Vec<_> = self.comparators.keys().collect();
        comparators.sort();
        f.debug_struct("FormOptions")
            .field("mode", &self.mode)
            .field("setters", &setters)
            .field("comparators", &comparators)
            .field("on_conflict", &self.on_conflict.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mode_parses_and_displays() {
        assert_eq!("assign".parse::<Mode>().unwrap(), Mode::Assign);
        assert_eq!("reassign".parse::<Mode>().unwrap(), Mode::Reassign);
        assert_eq!(
            "merge".parse::<Mode>().unwrap_err(),
            ConfigError::UnknownMode("merge".into())
        );
        assert_eq!(Mode::Reassign.to_string(), "reassign");
        assert_eq!(Mode::default(), Mode::Assign);
    }

    #[test]
    fn test_mode_deserializes_lowercase() {
        let mode: Mode = serde_json::from_value(json!("reassign")).unwrap();
        assert_eq!(mode, Mode::Reassign);
        assert!(serde_json::from_value::<Mode>(json!("Assign")).is_err());
    }

    #[test]
    fn test_closure_is_a_setter() {
        let setter = |_: &Record, value: &Value| MaybeDeferred::Ready(Some(Patch::single("echo", value.clone())));
        let output = Setter::call(&setter, &Record::new(), &json!(4));
        assert!(matches!(output, MaybeDeferred::Ready(Some(p)) if p.get("echo") == Some(&json!(4))));
    }

    #[tokio::test]
    async fn test_deferred_setter_resolves() {
        let setter = deferred_setter(|_, value| {
            let value = value.clone();
            async move { Ok(Some(Patch::single("late", value))) }
        });
        let output = setter.call(&Record::new(), &json!("x"));
        assert!(output.is_deferred());
        let patch = output.resolve().await.unwrap().unwrap();
        assert_eq!(patch.get("late"), Some(&json!("x")));
    }

    #[test]
    fn test_same_prefers_comparator() {
        let mut options = FormOptions::default();
        assert!(options.same("n", &json!(1), &json!(1)));
        assert!(!options.same("n", &json!(1), &json!(2)));

        options
            .comparators
            .insert("n".into(), Arc::new(|a: &Value, b: &Value| a.is_number() && b.is_number()));
        assert!(options.same("n", &json!(1), &json!(2)));
        assert!(!options.same("n", &json!(1), &json!("2")));
        assert!(!options.same("other", &json!(1), &json!(2)));
    }
}
