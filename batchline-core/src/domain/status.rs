//! Batch status
//!
//! Lifecycle status shared by job executions and step executions.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job or step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Starting,
    Started,
    Completed,
    Failed,
    Stopped,
}

impl BatchStatus {
    /// Whether this status is terminal (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Stopped
        )
    }

    /// String code used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Stopped => "STOPPED",
        }
    }

    /// Parse a persisted status code
    pub fn parse(s: &str) -> Option<BatchStatus> {
        match s {
            "STARTING" => Some(BatchStatus::Starting),
            "STARTED" => Some(BatchStatus::Started),
            "COMPLETED" => Some(BatchStatus::Completed),
            "FAILED" => Some(BatchStatus::Failed),
            "STOPPED" => Some(BatchStatus::Stopped),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!BatchStatus::Starting.is_terminal());
        assert!(!BatchStatus::Started.is_terminal());
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::Stopped.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            BatchStatus::Starting,
            BatchStatus::Started,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Stopped,
        ] {
            assert_eq!(BatchStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BatchStatus::parse("UNKNOWN"), None);
    }
}
