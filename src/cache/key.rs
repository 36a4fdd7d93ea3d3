//! Key Generator Module
//!
//! Derives the canonical lookup key for a base key plus an optional parameter set.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::error::{CacheError, Result};

/// Separator between the base key and the rendered parameters
pub const PARAM_SEPARATOR: &str = "__";

// == Params ==
/// Query parameters attached to a base key.
///
/// Held as a sorted sequence of (name, canonical JSON) pairs, so two parameter
/// sets with the same pairs render identically whatever order they were built in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    pairs: BTreeMap<String, String>,
}

impl Params {
    // == Constructor ==
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter from anything convertible into a JSON value.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.pairs.insert(name.into(), canonical_json(&value.into()));
        self
    }

    /// Adds a parameter from any serializable value.
    pub fn try_with<V: Serialize + ?Sized>(
        mut self,
        name: impl Into<String>,
        value: &V,
    ) -> Result<Self> {
        self.insert(name, value)?;
        Ok(self)
    }

    /// Inserts or replaces a parameter.
    pub fn insert<V: Serialize + ?Sized>(&mut self, name: impl Into<String>, value: &V) -> Result<()> {
        let value =
            serde_json::to_value(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        self.pairs.insert(name.into(), canonical_json(&value));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Sorted (name, canonical value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Params::new(), |params, (k, v)| params.with(k, v))
    }
}

// == Full Key ==
/// Computes the full key for `base` and `params`.
///
/// Without parameters (or with an empty set) the full key is the base key.
/// Otherwise the sorted pairs are rendered as `name:json` joined by `|` and
/// appended behind `__`.
pub fn full_key(base: &str, params: Option<&Params>) -> String {
    match params {
        Some(params) if !params.is_empty() => {
            let rendered = params
                .iter()
                .map(|(name, value)| format!("{}:{}", name, value))
                .collect::<Vec<_>>()
                .join("|");
            format!("{}{}{}", base, PARAM_SEPARATOR, rendered)
        }
        _ => base.to_string(),
    }
}

/// Renders a JSON value with object keys sorted at every depth.
///
/// `serde_json::Map` is ordered by key unless `preserve_order` is enabled, so
/// this rebuilds objects explicitly rather than trusting the feature set.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let body = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", body)
        }
        Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{}]", body)
        }
        other => other.to_string(),
    }
}
