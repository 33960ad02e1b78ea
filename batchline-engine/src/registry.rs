//! Job registry
//!
//! Registered job definitions are handed to the operator at construction;
//! composition is explicit, there is no wiring container.

use std::collections::HashMap;

use batchline_core::domain::parameters::{JobParameters, ParameterValue};

use crate::flow::Flow;

/// Computes the parameter set for the next instance of an incrementing job
pub trait ParametersIncrementer: Send + Sync {
    fn next(&self, last: Option<&JobParameters>) -> JobParameters;
}

/// Incrementer that bumps an integer run id, preserving other parameters
pub struct RunIdIncrementer {
    key: String,
}

impl RunIdIncrementer {
    pub const DEFAULT_KEY: &'static str = "run.id";

    pub fn new() -> Self {
        Self::with_key(Self::DEFAULT_KEY)
    }

    /// The run id key is configurable for jobs that reserve `run.id`
    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for RunIdIncrementer {
    fn default() -> Self {
        Self::new()
    }
}

impl ParametersIncrementer for RunIdIncrementer {
    fn next(&self, last: Option<&JobParameters>) -> JobParameters {
        let mut params = last.cloned().unwrap_or_default();
        let next_id = params.get_integer(&self.key).unwrap_or(0) + 1;
        params.insert(self.key.clone(), ParameterValue::Integer(next_id));
        params
    }
}

/// A named job: its flow plus launch configuration
pub struct JobDefinition {
    name: String,
    flow: Flow,
    incrementer: Option<Box<dyn ParametersIncrementer>>,
    restartable: bool,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, flow: Flow) -> Self {
        Self {
            name: name.into(),
            flow,
            incrementer: None,
            restartable: true,
        }
    }

    pub fn with_incrementer(mut self, incrementer: impl ParametersIncrementer + 'static) -> Self {
        self.incrementer = Some(Box::new(incrementer));
        self
    }

    pub fn restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn incrementer(&self) -> Option<&dyn ParametersIncrementer> {
        self.incrementer.as_deref()
    }

    pub fn is_restartable(&self) -> bool {
        self.restartable
    }
}

/// Name -> definition map handed to the operator
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, JobDefinition>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, job: JobDefinition) -> Self {
        self.jobs.insert(job.name().to_string(), job);
        self
    }

    pub fn get(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_incrementer_starts_at_one() {
        let incrementer = RunIdIncrementer::new();
        let params = incrementer.next(None);
        assert_eq!(params.get_integer("run.id"), Some(1));
    }

    #[test]
    fn test_run_id_incrementer_bumps_and_preserves() {
        let incrementer = RunIdIncrementer::new();
        let last = JobParameters::new()
            .with("run.id", ParameterValue::Integer(4))
            .with("input", ParameterValue::String("trades.csv".to_string()));

        let next = incrementer.next(Some(&last));

        assert_eq!(next.get_integer("run.id"), Some(5));
        assert_eq!(
            next.get("input"),
            Some(&ParameterValue::String("trades.csv".to_string()))
        );
    }

    #[test]
    fn test_custom_run_id_key() {
        let incrementer = RunIdIncrementer::with_key("launch.seq");
        let params = incrementer.next(None);
        assert_eq!(params.get_integer("launch.seq"), Some(1));
        assert_eq!(params.get_integer("run.id"), None);
    }
}
