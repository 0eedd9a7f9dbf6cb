//! Error types for the dispatch engine

use thiserror::Error;

/// Result type alias for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors raised by setup, routing, dispatch and result lookup
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Invalid or missing startup configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Queue defined twice in the topology
    #[error("Duplicate queue: {name}")]
    DuplicateQueue { name: String },

    /// No route for a task name and no default queue to fall back on
    #[error("No route for task: {task_name}")]
    Routing { task_name: String },

    /// Queue name that is not part of the topology
    #[error("Unknown queue: {queue}")]
    UnknownQueue { queue: String },

    /// Task rejected at enqueue time
    #[error("Invalid task {task_name}: {reason}")]
    InvalidTask { task_name: String, reason: String },

    /// Task body returned an error or panicked
    #[error("Task {task_id} failed: {message}")]
    TaskFailure { task_id: String, message: String },

    /// Task ran past its hard time limit
    #[error("Task {task_id} timed out: {message}")]
    TaskTimeout { task_id: String, message: String },

    /// No worker became available within the acquire timeout
    #[error("Worker pool exhausted for queue {queue} after {waited_ms}ms")]
    WorkerPoolExhausted { queue: String, waited_ms: u64 },

    /// Task id unknown to both the dispatcher and the result store
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Periodic trigger errors
    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    /// Timed out waiting on a caller-side operation
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors for wrapping other error types
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DispatchError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid task error
    pub fn invalid_task<S: Into<String>>(task_name: S, reason: S) -> Self {
        Self::InvalidTask {
            task_name: task_name.into(),
            reason: reason.into(),
        }
    }

    /// Create a scheduler error
    pub fn scheduler<S: Into<String>>(message: S) -> Self {
        Self::Scheduler {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Whether the caller may simply try again later.
    ///
    /// Setup-time errors are fatal and never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::WorkerPoolExhausted { .. } => true,
            DispatchError::Timeout { .. } => true,
            DispatchError::Io(_) => true,
            DispatchError::Config { .. } => false,
            DispatchError::DuplicateQueue { .. } => false,
            DispatchError::Routing { .. } => false,
            DispatchError::UnknownQueue { .. } => false,
            DispatchError::InvalidTask { .. } => false,
            DispatchError::TaskFailure { .. } => false,
            DispatchError::TaskTimeout { .. } => false,
            DispatchError::TaskNotFound { .. } => false,
            DispatchError::Serialization(_) => false,
            DispatchError::Scheduler { .. } => false,
            DispatchError::Internal(_) => false,
        }
    }

    /// Whether the error means the engine must not start
    pub fn is_fatal_setup(&self) -> bool {
        matches!(
            self,
            DispatchError::Config { .. }
                | DispatchError::DuplicateQueue { .. }
                | DispatchError::Routing { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_retryable_but_setup_errors_are_not() {
        let exhausted = DispatchError::WorkerPoolExhausted {
            queue: "default".into(),
            waited_ms: 10,
        };
        assert!(exhausted.is_retryable());
        assert!(!exhausted.is_fatal_setup());

        let dup = DispatchError::DuplicateQueue {
            name: "default".into(),
        };
        assert!(!dup.is_retryable());
        assert!(dup.is_fatal_setup());
        assert!(DispatchError::config("missing broker").is_fatal_setup());
    }

    #[test]
    fn messages_name_the_offending_item() {
        let err = DispatchError::TaskTimeout {
            task_id: "abc".into(),
            message: "hard time limit of 1.5s exceeded".into(),
        };
        assert_eq!(
            err.to_string(),
            "Task abc timed out: hard time limit of 1.5s exceeded"
        );
    }
}
