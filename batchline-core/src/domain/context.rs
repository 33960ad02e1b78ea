//! Execution context
//!
//! Run-scoped key/value data attached to one job execution. Steps use it to
//! publish the active step name and committed read positions; external steps
//! (e.g. an error-logging step) read it back.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Context key under which the currently active step name is published
pub const ACTIVE_STEP_KEY: &str = "batch.active_step";

/// Context key recording the committed read position of a step
pub fn read_position_key(step_name: &str) -> String {
    format!("{}.read.position", step_name)
}

/// A single context value
///
/// The closed set of serializable value kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ContextValue {
    String(String),
    Integer(i64),
    Timestamp(chrono::DateTime<chrono::Utc>),
}

impl ContextValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ContextValue::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

/// In-memory view of one execution's context entries
///
/// Scoped to one job execution; initialized at execution creation (copied
/// from the prior execution on restart, empty otherwise).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    entries: HashMap<String, ContextValue>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: ContextValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.entries.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ContextValue)> {
        self.entries.iter()
    }
}
