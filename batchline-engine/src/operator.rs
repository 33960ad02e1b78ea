//! Job operator
//!
//! Public entry point for launching, restarting, and stopping jobs. The
//! operator is handed concrete instances of the pool and the registered job
//! definitions at startup and drives the flow synchronously.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use batchline_core::domain::job::{JobExecution, JobInstance};
use batchline_core::domain::parameters::JobParameters;
use batchline_core::domain::status::BatchStatus;
use sqlx::SqlitePool;

use crate::error::{BatchError, Result};
use crate::registry::{JobDefinition, JobRegistry};
use crate::repository::{execution_repository, instance_repository};
use crate::step::StepContext;

pub struct JobOperator {
    pool: SqlitePool,
    registry: JobRegistry,
    /// Stop flags of currently running executions, keyed by execution id
    running: Mutex<HashMap<i64, Arc<AtomicBool>>>,
}

impl JobOperator {
    pub fn new(pool: SqlitePool, registry: JobRegistry) -> Self {
        Self {
            pool,
            registry,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Launch a job with explicit parameters and run it to completion
    ///
    /// Returns the new execution's id. Launch invariant violations
    /// (AlreadyRunning, InstanceAlreadyComplete, RestartNotAllowed) are
    /// forwarded from the repository unchanged. If the instance's prior
    /// execution failed or stopped, this launch is a restart and resumes
    /// after the last committed chunk.
    pub async fn start(&self, job_name: &str, parameters: JobParameters) -> Result<i64> {
        let job = self
            .registry
            .get(job_name)
            .ok_or_else(|| BatchError::NoSuchJob(job_name.to_string()))?;

        let instance = instance_repository::find_or_create(&self.pool, job_name, &parameters).await?;
        let execution =
            execution_repository::create(&self.pool, instance.id, job.is_restartable()).await?;

        self.drive(job, &instance, execution).await
    }

    /// Launch the next instance of an incrementing job
    ///
    /// Computes the next parameter set from the last instance's parameters.
    /// Fails with `NoSuchJob` for unregistered names and
    /// `ParametersNotFound` when the job has no incrementer.
    pub async fn start_next_instance(&self, job_name: &str) -> Result<i64> {
        let job = self
            .registry
            .get(job_name)
            .ok_or_else(|| BatchError::NoSuchJob(job_name.to_string()))?;
        let incrementer = job
            .incrementer()
            .ok_or_else(|| BatchError::ParametersNotFound(job_name.to_string()))?;

        let last = instance_repository::find_last_by_name(&self.pool, job_name).await?;
        let parameters = incrementer.next(last.as_ref().map(|i| &i.parameters));

        tracing::info!(
            "Launching next instance of '{}' with parameters [{}]",
            job_name,
            parameters.identity_key()
        );

        self.start(job_name, parameters).await
    }

    /// Restart a failed or stopped execution's instance
    pub async fn restart(&self, execution_id: i64) -> Result<i64> {
        let execution = execution_repository::find_by_id(&self.pool, execution_id)
            .await?
            .ok_or_else(|| {
                BatchError::RestartNotAllowed(format!("no execution with id {}", execution_id))
            })?;

        if !matches!(execution.status, BatchStatus::Failed | BatchStatus::Stopped) {
            return Err(BatchError::RestartNotAllowed(format!(
                "execution {} has status {}, expected FAILED or STOPPED",
                execution_id,
                execution.status.as_str()
            )));
        }

        let instance = instance_repository::find_by_id(&self.pool, execution.instance_id)
            .await?
            .ok_or_else(|| {
                BatchError::RestartNotAllowed(format!(
                    "no instance with id {}",
                    execution.instance_id
                ))
            })?;

        let job = self
            .registry
            .get(&instance.job_name)
            .ok_or_else(|| BatchError::NoSuchJob(instance.job_name.clone()))?;

        let new_execution =
            execution_repository::create(&self.pool, instance.id, job.is_restartable()).await?;

        self.drive(job, &instance, new_execution).await
    }

    /// Request a cooperative stop of a running execution
    ///
    /// The request is observed at the next chunk boundary, never mid-chunk.
    /// Returns false when the execution is not currently running.
    pub fn stop(&self, execution_id: i64) -> bool {
        let Ok(running) = self.running.lock() else {
            return false;
        };
        match running.get(&execution_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                tracing::info!("Stop requested for execution {}", execution_id);
                true
            }
            None => false,
        }
    }

    async fn drive(
        &self,
        job: &JobDefinition,
        instance: &JobInstance,
        execution: JobExecution,
    ) -> Result<i64> {
        execution_repository::mark_started(&self.pool, execution.id).await?;

        // Registered only once the execution is actually running, so a failed
        // start never leaves a stale stop flag behind
        let stop = Arc::new(AtomicBool::new(false));
        if let Ok(mut running) = self.running.lock() {
            running.insert(execution.id, stop.clone());
        }

        tracing::info!(
            "Job '{}' execution {} started (instance {})",
            job.name(),
            execution.id,
            instance.id
        );

        let ctx = StepContext {
            pool: &self.pool,
            instance,
            execution: &execution,
            stop,
        };
        let result = job.flow().run(&ctx).await;

        if let Ok(mut running) = self.running.lock() {
            running.remove(&execution.id);
        }

        let final_status = match result {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(
                    "Job '{}' execution {} aborted: {}",
                    job.name(),
                    execution.id,
                    e
                );
                execution_repository::mark_completed(&self.pool, execution.id, BatchStatus::Failed)
                    .await?;
                return Err(e);
            }
        };

        execution_repository::mark_completed(&self.pool, execution.id, final_status).await?;
        tracing::info!(
            "Job '{}' execution {} finished with status {}",
            job.name(),
            execution.id,
            final_status.as_str()
        );

        Ok(execution.id)
    }
}
