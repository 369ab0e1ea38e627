#![forbid(unsafe_code)]

use envrun_core::ids::IdError;
use envrun_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("a build for {tenant}/{resource} is still in progress")]
    AlreadyInProgress { tenant: String, resource: String },
    #[error("execution failed ({id}): {message}")]
    Execution { id: String, message: String },
    #[error("queue is full ({active} active, limit {limit})")]
    QueueFull { limit: u32, active: u32 },
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("canceled")]
    Canceled,
    #[error(transparent)]
    Store(StoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::QueueFull { limit, active } => Self::QueueFull { limit, active },
            StoreError::UnknownId => Self::NotFound("unknown id".to_string()),
            StoreError::InvalidInput(message) => Self::ValidationFailed(message.to_string()),
            other => Self::Store(other),
        }
    }
}

impl From<IdError> for OrchestratorError {
    fn from(err: IdError) -> Self {
        Self::ValidationFailed(err.to_string())
    }
}

/// Failure of one environment build, tagged with the build it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("build {build_id} failed: {message}")]
pub struct BuildError {
    pub build_id: String,
    pub message: String,
}

impl BuildError {
    pub fn new(build_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            message: message.into(),
        }
    }
}

impl From<BuildError> for OrchestratorError {
    fn from(err: BuildError) -> Self {
        Self::Execution {
            id: err.build_id,
            message: err.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_the_caller_taxonomy() {
        let err = OrchestratorError::from(StoreError::QueueFull {
            limit: 1,
            active: 1,
        });
        assert!(matches!(err, OrchestratorError::QueueFull { limit: 1, active: 1 }));
        assert!(matches!(
            OrchestratorError::from(StoreError::UnknownId),
            OrchestratorError::NotFound(_)
        ));

        let err = OrchestratorError::from(BuildError::new("b1", "pip exploded"));
        assert_eq!(err.to_string(), "execution failed (b1): pip exploded");
    }
}
