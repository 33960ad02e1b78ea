//! Job flow controller
//!
//! Sequences steps according to exit-status-driven transitions. Routing is
//! resolved against tagged exit statuses and an explicit transition table,
//! with a wildcard pattern as the lowest-precedence catch-all.

use std::collections::HashMap;
use std::sync::Arc;

use batchline_core::domain::status::BatchStatus;
use batchline_core::domain::step::ExitStatus;
use tracing::{info, warn};

use crate::error::{BatchError, Result};
use crate::repository::step_repository;
use crate::step::{Step, StepContext};

/// Exit-status pattern for one transition rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPattern {
    /// Matches exactly one exit status
    On(ExitStatus),
    /// Matches any exit status; consulted only when no exact rule matches
    Any,
}

/// Where a transition leads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Step(String),
    End,
    Fail,
}

struct Transition {
    from: String,
    pattern: ExitPattern,
    target: Target,
}

/// Ordered step declaration plus the transition table
pub struct Flow {
    steps: HashMap<String, Arc<dyn Step>>,
    start: String,
    transitions: Vec<Transition>,
}

// Upper bound on transitions taken in one run; a well-formed flow never
// comes close, so hitting it means a transition cycle
const MAX_HOPS: usize = 1_000;

impl Flow {
    pub fn builder() -> FlowBuilder {
        FlowBuilder {
            steps: Vec::new(),
            transitions: Vec::new(),
        }
    }

    /// Resolve the next target for a step outcome
    ///
    /// Exact rules win over wildcard rules; among equals, declaration order.
    fn resolve(&self, from: &str, exit_status: ExitStatus) -> Option<&Target> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.pattern == ExitPattern::On(exit_status))
            .or_else(|| {
                self.transitions
                    .iter()
                    .find(|t| t.from == from && t.pattern == ExitPattern::Any)
            })
            .map(|t| &t.target)
    }

    /// Execute the flow within one job execution
    ///
    /// Returns the job-level terminal status: `Completed` when an end target
    /// is reached with no step reporting FAILED, `Stopped` when a stop
    /// request was observed, `Failed` otherwise.
    pub async fn run(&self, ctx: &StepContext<'_>) -> Result<BatchStatus> {
        let mut current = self.start.clone();
        let mut saw_failed = false;

        for _ in 0..MAX_HOPS {
            let step = self.steps.get(&current).ok_or_else(|| {
                BatchError::Flow(format!("flow references unknown step '{}'", current))
            })?;

            let exit_status = match self.prior_completion(ctx, &current).await? {
                Some(exit_status) => {
                    info!(
                        "Step '{}' already completed in a prior execution; carrying over {}",
                        current,
                        exit_status.as_code()
                    );
                    exit_status
                }
                None => step.execute(ctx).await?,
            };

            if exit_status == ExitStatus::Failed {
                saw_failed = true;
            }

            match self.resolve(&current, exit_status) {
                Some(Target::Step(next)) => {
                    current = next.clone();
                }
                Some(Target::End) => {
                    return Ok(if saw_failed {
                        BatchStatus::Failed
                    } else {
                        BatchStatus::Completed
                    });
                }
                Some(Target::Fail) => return Ok(BatchStatus::Failed),
                None => {
                    return match exit_status {
                        ExitStatus::Failed => Ok(BatchStatus::Failed),
                        ExitStatus::Stopped => Ok(BatchStatus::Stopped),
                        _ => Err(BatchError::Flow(format!(
                            "no transition from step '{}' on exit status {}",
                            current,
                            exit_status.as_code()
                        ))),
                    };
                }
            }
        }

        warn!("Flow exceeded {} transitions; aborting", MAX_HOPS);
        Err(BatchError::Flow("transition limit exceeded".to_string()))
    }

    /// Exit status of this step from a prior execution of the instance, when
    /// it completed there; such steps are not re-run on restart
    async fn prior_completion(
        &self,
        ctx: &StepContext<'_>,
        step_name: &str,
    ) -> Result<Option<ExitStatus>> {
        let prior = step_repository::find_completed_in_prior_execution(
            ctx.pool,
            ctx.instance.id,
            ctx.execution.id,
            step_name,
        )
        .await?;

        Ok(prior.and_then(|step| step.exit_status))
    }
}

/// Builder for [`Flow`]
pub struct FlowBuilder {
    steps: Vec<Arc<dyn Step>>,
    transitions: Vec<Transition>,
}

impl FlowBuilder {
    /// Adds a step; the first added step is the flow's start
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Adds a transition rule for one exit status
    pub fn on(mut self, from: impl Into<String>, exit_status: ExitStatus, target: Target) -> Self {
        self.transitions.push(Transition {
            from: from.into(),
            pattern: ExitPattern::On(exit_status),
            target,
        });
        self
    }

    /// Adds a wildcard transition rule
    pub fn on_any(mut self, from: impl Into<String>, target: Target) -> Self {
        self.transitions.push(Transition {
            from: from.into(),
            pattern: ExitPattern::Any,
            target,
        });
        self
    }

    pub fn build(self) -> Result<Flow> {
        let start = self
            .steps
            .first()
            .map(|s| s.name().to_string())
            .ok_or_else(|| BatchError::Config("flow has no steps".to_string()))?;

        let mut steps = HashMap::new();
        for step in self.steps {
            let name = step.name().to_string();
            if steps.insert(name.clone(), step).is_some() {
                return Err(BatchError::Config(format!(
                    "duplicate step name '{}'",
                    name
                )));
            }
        }

        for transition in &self.transitions {
            if !steps.contains_key(&transition.from) {
                return Err(BatchError::Config(format!(
                    "transition from unknown step '{}'",
                    transition.from
                )));
            }
            if let Target::Step(to) = &transition.target {
                if !steps.contains_key(to) {
                    return Err(BatchError::Config(format!(
                        "transition to unknown step '{}'",
                        to
                    )));
                }
            }
        }

        Ok(Flow {
            steps,
            start,
            transitions: self.transitions,
        })
    }
}
