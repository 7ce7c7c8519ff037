//! Host attribute snapshot (grains and pillar) used for targeting

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Grain holding the canonical host identifier
pub const ID_GRAIN: &str = "id";

/// Which attribute map a lookup reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeSource {
    /// Facts collected from the host
    Grains,
    /// Operator-supplied data
    Pillar,
}

/// Read-only snapshot of host-identifying attributes
///
/// Captured fresh at the start of every audit run. Values may be scalars,
/// lists or nested mappings; nested values are reachable with dotted paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeSnapshot {
    #[serde(default)]
    grains: BTreeMap<String, Value>,
    #[serde(default)]
    pillar: BTreeMap<String, Value>,
}

impl AttributeSnapshot {
    /// Create an empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from pre-collected maps
    pub fn from_maps(grains: BTreeMap<String, Value>, pillar: BTreeMap<String, Value>) -> Self {
        Self { grains, pillar }
    }

    /// Add a grain
    pub fn with_grain(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.grains.insert(key.into(), value.into());
        self
    }

    /// Add a pillar value
    pub fn with_pillar(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.pillar.insert(key.into(), value.into());
        self
    }

    /// Insert a grain in place
    pub fn set_grain(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.grains.insert(key.into(), value.into());
    }

    /// The canonical host identifier (`id` grain)
    pub fn id(&self) -> Option<&str> {
        self.grains.get(ID_GRAIN).and_then(Value::as_str)
    }

    /// Look up a grain by dotted path
    pub fn grain(&self, path: &str) -> Option<&Value> {
        lookup(&self.grains, path)
    }

    /// Look up a pillar value by dotted path
    pub fn pillar(&self, path: &str) -> Option<&Value> {
        lookup(&self.pillar, path)
    }

    /// Look up a value in the given source
    pub fn get(&self, source: AttributeSource, path: &str) -> Option<&Value> {
        match source {
            AttributeSource::Grains => self.grain(path),
            AttributeSource::Pillar => self.pillar(path),
        }
    }

    /// Look up a grain and render it as a single string (lists joined with ',')
    pub fn grain_string(&self, path: &str) -> Option<String> {
        let value = self.grain(path)?;
        match value {
            Value::Array(_) => Some(scalar_strings(value).join(",")),
            other => scalar_string(other),
        }
    }

    /// All grains
    pub fn grains(&self) -> &BTreeMap<String, Value> {
        &self.grains
    }

    /// All pillar values
    pub fn pillar_values(&self) -> &BTreeMap<String, Value> {
        &self.pillar
    }
}

/// Captures the host attributes an audit run or delivery works from
///
/// Called once per run; the snapshot is dropped when the run ends.
pub trait SnapshotSource: Send + Sync {
    fn capture(&self) -> AttributeSnapshot;
}

impl<F> SnapshotSource for F
where
    F: Fn() -> AttributeSnapshot + Send + Sync,
{
    fn capture(&self) -> AttributeSnapshot {
        self()
    }
}

fn lookup<'a>(map: &'a BTreeMap<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(value) = map.get(path) {
        return Some(value);
    }

    let mut parts = path.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(obj) => obj.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// String form of a scalar value; `None` for mappings, lists and null
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// String forms of a value for matching: a scalar yields itself, a list its scalar members
pub fn scalar_strings(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(scalar_string).collect(),
        other => scalar_string(other).into_iter().collect(),
    }
}
