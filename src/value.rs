//! Dynamic configuration values
//!
//! HCL evaluation yields heterogeneous values. They are represented with a
//! tagged variant so that merges, comparisons and JSON encodings dispatch on
//! the tag instead of poking at opaque maps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outputs of a unit, keyed by output name.
pub type OutputMap = BTreeMap<String, Value>;

/// A dynamic value as produced by config evaluation or engine output parsing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Renders the value the way it is passed to the engine via `TF_VAR_`
    /// environment variables: bare strings stay bare, everything else is JSON.
    pub fn to_env_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(&other.to_json()).unwrap_or_default(),
        }
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect())
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub fn from_hcl(value: hcl::Value) -> Self {
        match value {
            hcl::Value::Null => Value::Null,
            hcl::Value::Bool(b) => Value::Bool(b),
            hcl::Value::Number(n) => {
                let json = if let Some(i) = n.as_i64() {
                    serde_json::Number::from(i)
                } else if let Some(u) = n.as_u64() {
                    serde_json::Number::from(u)
                } else {
                    serde_json::Number::from_f64(n.as_f64().unwrap_or(0.0))
                        .unwrap_or_else(|| serde_json::Number::from(0))
                };
                Value::Number(json)
            }
            hcl::Value::String(s) => Value::String(s),
            hcl::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_hcl).collect())
            }
            hcl::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from_hcl(v))).collect())
            }
        }
    }

    pub fn to_hcl(&self) -> hcl::Value {
        match self {
            Value::Null => hcl::Value::Null,
            Value::Bool(b) => hcl::Value::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    hcl::Value::from(i)
                } else if let Some(u) = n.as_u64() {
                    hcl::Value::from(u)
                } else {
                    hcl::Value::from(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => hcl::Value::String(s.clone()),
            Value::List(items) => hcl::Value::Array(items.iter().map(Value::to_hcl).collect()),
            Value::Map(map) => hcl::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_hcl())).collect(),
            ),
        }
    }
}

/// How mock outputs are combined with a producer's applied state when the
/// state is present but missing referenced attributes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockMergeStrategy {
    /// Mocks are ignored entirely once state exists.
    #[default]
    NoMerge,
    /// Missing top-level keys are filled from mocks; state wins on conflicts.
    ShallowMerge,
    /// Map values are merged recursively, state wins, lists are not merged.
    DeepMergeMapOnly,
}

/// Combines applied `state` outputs with configured `mocks` per `strategy`.
///
/// State always wins; mocks only ever fill gaps.
pub fn merge_with_mocks(
    state: &OutputMap,
    mocks: &OutputMap,
    strategy: MockMergeStrategy,
) -> OutputMap {
    match strategy {
        MockMergeStrategy::NoMerge => state.clone(),
        MockMergeStrategy::ShallowMerge => {
            let mut merged = mocks.clone();
            for (k, v) in state {
                merged.insert(k.clone(), v.clone());
            }
            merged
        }
        MockMergeStrategy::DeepMergeMapOnly => {
            let mut merged = OutputMap::new();
            let keys: std::collections::BTreeSet<_> = state.keys().chain(mocks.keys()).collect();
            for key in keys {
                let value = match (state.get(key), mocks.get(key)) {
                    (Some(s), Some(m)) => deep_merge_maps(s, m),
                    (Some(s), None) => s.clone(),
                    (None, Some(m)) => m.clone(),
                    (None, None) => unreachable!("key comes from one of the two maps"),
                };
                merged.insert(key.clone(), value);
            }
            merged
        }
    }
}

/// Recursive merge on map values only. Scalars and lists from `state` shadow
/// the mock entirely.
fn deep_merge_maps(state: &Value, mock: &Value) -> Value {
    match (state, mock) {
        (Value::Map(s), Value::Map(m)) => {
            let mut merged = m.clone();
            for (k, sv) in s {
                let entry = match m.get(k) {
                    Some(mv) => deep_merge_maps(sv, mv),
                    None => sv.clone(),
                };
                merged.insert(k.clone(), entry);
            }
            Value::Map(merged)
        }
        _ => state.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn map(entries: &[(&str, Value)]) -> OutputMap {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn s(v: &str) -> Value {
        Value::String(v.to_string())
    }

    #[test]
    fn no_merge_ignores_mocks() {
        let state = map(&[("a", s("1"))]);
        let mocks = map(&[("a", s("mock")), ("b", s("mock"))]);
        assert_eq!(merge_with_mocks(&state, &mocks, MockMergeStrategy::NoMerge), state);
    }

    #[test]
    fn shallow_merge_fills_missing_top_level() {
        let state = map(&[("a", s("1"))]);
        let mocks = map(&[("a", s("mock")), ("b", s("mock"))]);
        let merged = merge_with_mocks(&state, &mocks, MockMergeStrategy::ShallowMerge);
        assert_eq!(merged, map(&[("a", s("1")), ("b", s("mock"))]));
    }

    #[test]
    fn deep_merge_only_descends_into_maps() {
        let state = map(&[
            ("nested", Value::Map(map(&[("x", s("state"))]))),
            ("list", Value::List(vec![s("state")])),
        ]);
        let mocks = map(&[
            ("nested", Value::Map(map(&[("x", s("mock")), ("y", s("mock"))]))),
            ("list", Value::List(vec![s("mock"), s("mock")])),
            ("extra", s("mock")),
        ]);
        let merged = merge_with_mocks(&state, &mocks, MockMergeStrategy::DeepMergeMapOnly);
        assert_eq!(
            merged,
            map(&[
                ("nested", Value::Map(map(&[("x", s("state")), ("y", s("mock"))]))),
                ("list", Value::List(vec![s("state")])),
                ("extra", s("mock")),
            ])
        );
    }

    #[test]
    fn env_string_keeps_bare_strings() {
        assert_eq!(s("plain").to_env_string(), "plain");
        assert_eq!(Value::Bool(true).to_env_string(), "true");
        assert_eq!(Value::List(vec![s("a")]).to_env_string(), r#"["a"]"#);
    }

    #[test]
    fn hcl_round_trip() {
        let value = Value::Map(map(&[
            ("b", Value::Bool(true)),
            ("n", Value::Number(serde_json::Number::from(42))),
            ("l", Value::List(vec![s("x")])),
        ]));
        assert_eq!(Value::from_hcl(value.to_hcl()), value);
    }
}
