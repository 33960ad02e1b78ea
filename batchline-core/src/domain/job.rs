//! Job instance and execution records
//!
//! Structures shared between the execution repository (persists) and the
//! engine (updates).

use serde::{Deserialize, Serialize};

use crate::domain::parameters::JobParameters;
use crate::domain::status::BatchStatus;

/// Logical identity of a job run, keyed by name + parameters
///
/// Immutable once created. One instance may have many executions (restarts),
/// but only one may be non-terminal at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: i64,
    pub job_name: String,
    pub parameters: JobParameters,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// One physical attempt to run a job instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: i64,
    pub instance_id: i64,
    pub status: BatchStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}
