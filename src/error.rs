//! Error types for the exchange layer.

use thiserror::Error;

/// Longest task id embedded in an error message. Longer ids are cut so a
/// malformed or hostile id cannot blow up logs.
pub const MAX_TASK_ID_DISPLAY_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// A fetch source could not be created for a remote task.
    #[error("failed to create exchange source: {message}. Task ID: {task_id}.")]
    SourceCreation { task_id: String, message: String },

    /// Recoverable fetch failure (timeout, connection hiccup). Retried by the source.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// A source gave up or its producer reported an error.
    #[error("exchange source {task_id} failed: {message}")]
    SourceFailed { task_id: String, message: String },

    /// The memory pool denied a reservation.
    #[error(
        "memory pool '{pool}' cannot allocate {requested} bytes (used {used}, capacity {capacity})"
    )]
    AllocationFailed {
        pool: String,
        requested: u64,
        used: u64,
        capacity: u64,
    },

    #[error("output buffer for task {0} not found")]
    TaskNotFound(String),

    #[error("task {0} was aborted")]
    TaskAborted(String),

    #[error("output buffer for task {0} already exists")]
    TaskAlreadyExists(String),

    #[error("task {0} already signaled no more data")]
    NoMoreData(String),

    #[error("destination {destination} out of range for task {task_id} ({num_destinations} destinations)")]
    InvalidDestination {
        task_id: String,
        destination: u32,
        num_destinations: u32,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ExchangeError {
    pub fn source_creation(task_id: &str, message: impl Into<String>) -> Self {
        Self::SourceCreation {
            task_id: truncate_task_id(task_id).to_string(),
            message: message.into(),
        }
    }

    pub fn source_failed(task_id: &str, message: impl Into<String>) -> Self {
        Self::SourceFailed {
            task_id: truncate_task_id(task_id).to_string(),
            message: message.into(),
        }
    }

    /// Whether a fetch source should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Cut a task id to at most [`MAX_TASK_ID_DISPLAY_LEN`] characters.
pub fn truncate_task_id(task_id: &str) -> &str {
    match task_id.char_indices().nth(MAX_TASK_ID_DISPLAY_LEN) {
        Some((idx, _)) => &task_id[..idx],
        None => task_id,
    }
}

pub type Result<T> = std::result::Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_task_id() {
        assert_eq!(truncate_task_id("task.1.2.3"), "task.1.2.3");

        let long = "x".repeat(1024);
        assert_eq!(truncate_task_id(&long).len(), MAX_TASK_ID_DISPLAY_LEN);

        // Multi-byte characters are never split.
        let wide = "é".repeat(200);
        assert_eq!(truncate_task_id(&wide).chars().count(), MAX_TASK_ID_DISPLAY_LEN);
    }

    #[test]
    fn test_source_creation_message() {
        let err = ExchangeError::source_creation("task.1.2.3", "Testing error");
        assert_eq!(
            err.to_string(),
            "failed to create exchange source: Testing error. Task ID: task.1.2.3."
        );
        assert!(!err.is_transient());
        assert!(ExchangeError::Transient("reset".into()).is_transient());
    }
}
