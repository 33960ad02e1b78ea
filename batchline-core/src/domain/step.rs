//! Step execution records and exit statuses

use serde::{Deserialize, Serialize};

use crate::domain::status::BatchStatus;

/// Outcome of a completed step, consumed by flow control
///
/// Represented as tagged variants rather than free-form strings; the string
/// codes exist only for persistence and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Completed,
    CompletedWithSkips,
    Failed,
    Stopped,
}

impl ExitStatus {
    /// String code used for persistence and reporting
    pub fn as_code(&self) -> &'static str {
        match self {
            ExitStatus::Completed => "COMPLETED",
            ExitStatus::CompletedWithSkips => "COMPLETED WITH SKIPS",
            ExitStatus::Failed => "FAILED",
            ExitStatus::Stopped => "STOPPED",
        }
    }

    /// Parse a persisted exit status code
    pub fn parse(code: &str) -> Option<ExitStatus> {
        match code {
            "COMPLETED" => Some(ExitStatus::Completed),
            "COMPLETED WITH SKIPS" => Some(ExitStatus::CompletedWithSkips),
            "FAILED" => Some(ExitStatus::Failed),
            "STOPPED" => Some(ExitStatus::Stopped),
            _ => None,
        }
    }
}

/// One run of one step within a job execution
///
/// Counters are monotonic within a step execution and start at zero for
/// every new step execution, including on restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: i64,
    pub job_execution_id: i64,
    pub step_name: String,
    pub status: BatchStatus,
    pub exit_status: Option<ExitStatus>,
    pub read_count: u32,
    pub write_count: u32,
    pub skip_count: u32,
    pub commit_count: u32,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}
