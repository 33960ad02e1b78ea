//! Job parameters
//!
//! Typed key/value parameters that, together with the job name, identify a
//! job instance. Two launches with the same name and parameters refer to the
//! same logical instance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single job parameter value
///
/// The closed set of serializable parameter kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ParameterValue {
    String(String),
    Integer(i64),
    Timestamp(chrono::DateTime<chrono::Utc>),
}

/// Parameter set for one job instance
///
/// Backed by an ordered map so the identity key is deterministic regardless
/// of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    entries: BTreeMap<String, ParameterValue>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a parameter, replacing any previous value for the key
    pub fn insert(&mut self, key: impl Into<String>, value: ParameterValue) {
        self.entries.insert(key.into(), value);
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: ParameterValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ParameterValue> {
        self.entries.get(key)
    }

    /// Integer accessor, `None` when absent or not an integer
    pub fn get_integer(&self, key: &str) -> Option<i64> {
        match self.entries.get(key) {
            Some(ParameterValue::Integer(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.entries.iter()
    }

    /// Canonical identity key for instance lookup
    ///
    /// Deterministic for a given parameter set: entries are emitted in key
    /// order as `key=kind:value` pairs joined by `&`.
    pub fn identity_key(&self) -> String {
        let mut parts = Vec::with_capacity(self.entries.len());
        for (key, value) in &self.entries {
            let rendered = match value {
                ParameterValue::String(s) => format!("{}=s:{}", key, s),
                ParameterValue::Integer(n) => format!("{}=i:{}", key, n),
                ParameterValue::Timestamp(ts) => format!("{}=t:{}", key, ts.to_rfc3339()),
            };
            parts.push(rendered);
        }
        parts.join("&")
    }
}
