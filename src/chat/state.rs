//! Reducer for the legacy `state_delta` protocol.
//!
//! The backend sends `{name, operation}` deltas which are folded, one at a
//! time, into an untyped key/value state. Every application returns a fresh
//! map; the input state is never touched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type State = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub name: String,
    pub operation: DeltaOperation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaOperation {
    #[serde(default)]
    pub values: Map<String, Value>,
    #[serde(default)]
    pub keys: Vec<String>,
}

impl StateDelta {
    pub fn set(values: Map<String, Value>) -> Self {
        Self {
            name: "set".to_string(),
            operation: DeltaOperation { values, keys: Vec::new() },
        }
    }

    pub fn append(values: Map<String, Value>) -> Self {
        Self {
            name: "append".to_string(),
            operation: DeltaOperation { values, keys: Vec::new() },
        }
    }

    pub fn delete(keys: Vec<String>) -> Self {
        Self {
            name: "delete".to_string(),
            operation: DeltaOperation { values: Map::new(), keys },
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ReducerError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("cannot append to `{key}`: existing value is not a list")]
    NotAList { key: String },
}

/// Per-key value transform applied to list elements on `set` and to the
/// single appended value on `append`.
pub struct ColumnMapping {
    filter: Box<dyn Fn(&str) -> bool + Send + Sync>,
    transform: Box<dyn Fn(Value) -> Value + Send + Sync>,
}

impl ColumnMapping {
    pub fn new(
        filter: impl Fn(&str) -> bool + Send + Sync + 'static,
        transform: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            filter: Box::new(filter),
            transform: Box::new(transform),
        }
    }

    /// Mapping that only applies to one exact key.
    pub fn for_key(
        key: impl Into<String>,
        transform: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        let key = key.into();
        Self::new(move |k| k == key, transform)
    }

    fn matches(&self, key: &str) -> bool {
        (self.filter)(key)
    }

    fn apply(&self, value: Value) -> Value {
        (self.transform)(value)
    }
}

impl std::fmt::Debug for ColumnMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnMapping").finish_non_exhaustive()
    }
}

fn find_mapping<'a>(mappings: &'a [ColumnMapping], key: &str) -> Option<&'a ColumnMapping> {
    mappings.iter().find(|m| m.matches(key))
}

pub fn apply_operation(
    state: &State,
    delta: &StateDelta,
    mappings: &[ColumnMapping],
) -> Result<State, ReducerError> {
    match delta.name.as_str() {
        "set" => {
            let mut next = state.clone();
            for (key, value) in &delta.operation.values {
                let value = match (find_mapping(mappings, key), value) {
                    (Some(mapping), Value::Array(items)) => {
                        Value::Array(items.iter().cloned().map(|v| mapping.apply(v)).collect())
                    }
                    _ => value.clone(),
                };
                next.insert(key.clone(), value);
            }
            Ok(next)
        }
        "append" => {
            let mut next = state.clone();
            for (key, value) in &delta.operation.values {
                let value = match find_mapping(mappings, key) {
                    Some(mapping) => mapping.apply(value.clone()),
                    None => value.clone(),
                };
                let grown = match state.get(key) {
                    Some(Value::Array(existing)) => {
                        let mut items = existing.clone();
                        items.push(value);
                        items
                    }
                    Some(_) => return Err(ReducerError::NotAList { key: key.clone() }),
                    None => vec![value],
                };
                next.insert(key.clone(), Value::Array(grown));
            }
            Ok(next)
        }
        "delete" => Ok(state
            .iter()
            .filter(|(key, _)| !delta.operation.keys.contains(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()),
        other => Err(ReducerError::UnknownOperation(other.to_string())),
    }
}
