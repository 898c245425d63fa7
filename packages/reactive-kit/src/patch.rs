//! Records and partial records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The full set of named fields a form proxy manages.
///
/// Field order is insertion order.
pub type Record = Map<String, Value>;

/// A partial record: the fields a write or a setter wants to change.
///
/// Keys keep the order they were first inserted in, which is the order a
/// cascade expands them in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(Map<String, Value>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A patch changing exactly one field.
    pub fn single(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().with(field, value)
    }

    /// Add a field (builder style).
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(field, value);
        self
    }

    /// Set a field. An existing key keeps its position.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fold `other` into this patch. Values from `other` win.
    pub fn merge(&mut self, other: &Patch) {
        for (field, value) in other.iter() {
            self.0.insert(field.clone(), value.clone());
        }
    }

    /// Write every field of this patch into `record`.
    ///
    /// Returns true if at least one field's value changed.
    pub fn apply_to(&self, record: &mut Record) -> bool {
        let mut changed = false;
        for (field, value) in self.iter() {
            if record.get(field) != Some(value) {
                record.insert(field.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }

    /// Build a patch from any value that serializes to a JSON object.
    pub fn from_serialize<T: Serialize>(value: &T) -> anyhow::Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(map)),
            other => anyhow::bail!("expected a JSON object, got {other}"),
        }
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

/// `base` with `changes` written over it.
pub(crate) fn merged(base: &Record, changes: &Patch) -> Record {
    let mut record = base.clone();
    changes.apply_to(&mut record);
    record
}

impl From<Map<String, Value>> for Patch {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl<S: Into<String>> FromIterator<(S, Value)> for Patch {
    fn from_iter<I: IntoIterator<Item = (S, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl IntoIterator for Patch {
    type Item = (String, Value);
    type IntoIter = serde_json::map::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
