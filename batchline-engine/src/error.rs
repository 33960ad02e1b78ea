//! Error types for the Batchline engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, BatchError>;

/// Errors surfaced by the engine's public surface
///
/// Launch invariant violations (`NoSuchJob`, `AlreadyRunning`,
/// `InstanceAlreadyComplete`, `ParametersNotFound`, `RestartNotAllowed`) are
/// reported synchronously to the caller of the launch operation and never
/// retried automatically.
#[derive(Debug, Error)]
pub enum BatchError {
    /// No job registered under the given name
    #[error("no job registered under name '{0}'")]
    NoSuchJob(String),

    /// The instance already has a non-terminal execution
    #[error("job instance {instance_id} already has a running execution")]
    AlreadyRunning { instance_id: i64 },

    /// The instance's most recent execution completed successfully
    #[error("job instance {instance_id} is already complete; relaunch requires new parameters")]
    InstanceAlreadyComplete { instance_id: i64 },

    /// The job has no incrementer and no parameters could be derived
    #[error("no parameters found for job '{0}' and no incrementer is configured")]
    ParametersNotFound(String),

    /// The execution cannot be restarted
    #[error("restart not allowed: {0}")]
    RestartNotAllowed(String),

    /// Invalid step or flow configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The flow has no usable transition for a step outcome
    #[error("flow error: {0}")]
    Flow(String),

    /// Repository write or read failed; fatal to the current chunk
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Context or parameter (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BatchError {
    /// Whether this error is a launch invariant violation
    pub fn is_launch_error(&self) -> bool {
        matches!(
            self,
            BatchError::NoSuchJob(_)
                | BatchError::AlreadyRunning { .. }
                | BatchError::InstanceAlreadyComplete { .. }
                | BatchError::ParametersNotFound(_)
                | BatchError::RestartNotAllowed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_launch_error() {
        assert!(BatchError::NoSuchJob("x".to_string()).is_launch_error());
        assert!(BatchError::AlreadyRunning { instance_id: 1 }.is_launch_error());
        assert!(BatchError::InstanceAlreadyComplete { instance_id: 1 }.is_launch_error());
        assert!(!BatchError::Flow("no transition".to_string()).is_launch_error());
        assert!(!BatchError::Config("bad chunk size".to_string()).is_launch_error());
    }
}
