//! Error handling for the cogroup workspace.

use thiserror::Error;

/// Error type shared by every stage of a shuffle run.
///
/// All failures surface to the scan consumer as a single terminal error.
/// The core performs no local recovery, so none of these are retryable.
#[derive(Error, Debug)]
pub enum CogroupError {
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    #[error("Shard {shard} failed to generate records: {message}")]
    Generation {
        shard: usize,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Shard {shard} contributed to key {key} more than once")]
    DuplicateContribution { key: String, shard: usize },

    #[error("Group for key {key} received a contribution after completing with {expected} values")]
    GroupOverflow { key: String, expected: usize },

    #[error(
        "Partition {partition} finished with {incomplete} incomplete groups (expected {expected} values per key): {}",
        sample.join(", ")
    )]
    IncompleteGroups {
        partition: u32,
        incomplete: usize,
        expected: usize,
        sample: Vec<String>,
    },

    #[error("Transform failed for key {key}")]
    Transform {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Verification found {discrepancies} discrepancies, first: {first}")]
    Verification { discrepancies: usize, first: String },
}

/// Result type alias for cogroup operations.
pub type Result<T> = std::result::Result<T, CogroupError>;

/// Error category for grouping related error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected before the run started
    Configuration,
    /// A shard source misbehaved
    Generation,
    /// The grouping buffers saw too few or too many contributions
    Grouping,
    /// The caller-supplied aggregator failed
    Transform,
    /// The run was cancelled from outside
    Cancellation,
    /// Consumer-side verification failed
    Verification,
    /// Engine invariant broken
    Internal,
}

impl CogroupError {
    /// Create a configuration error with a custom message.
    pub fn configuration_error<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a generation error for a shard.
    pub fn generation_error<S: Into<String>>(shard: usize, message: S) -> Self {
        Self::Generation {
            shard,
            message: message.into(),
            source: None,
        }
    }

    /// Create a generation error for a shard with a source error.
    pub fn generation_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        shard: usize,
        message: S,
        source: E,
    ) -> Self {
        Self::Generation {
            shard,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a transform error for the key whose group failed.
    pub fn transform_error<S: Into<String>, E: Into<anyhow::Error>>(key: S, source: E) -> Self {
        Self::Transform {
            key: key.into(),
            source: source.into(),
        }
    }

    /// Create an internal error with a custom message.
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error with a custom message and source error.
    pub fn internal_error_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CogroupError::Configuration { .. } => ErrorCategory::Configuration,
            CogroupError::Generation { .. } => ErrorCategory::Generation,
            CogroupError::DuplicateContribution { .. }
            | CogroupError::GroupOverflow { .. }
            | CogroupError::IncompleteGroups { .. } => ErrorCategory::Grouping,
            CogroupError::Transform { .. } => ErrorCategory::Transform,
            CogroupError::Cancelled => ErrorCategory::Cancellation,
            CogroupError::Verification { .. } => ErrorCategory::Verification,
            CogroupError::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Check if the error is retryable.
    ///
    /// Retrying a shard or a partial shuffle is left to whatever schedules
    /// the run, so this is always false.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Whether this error came from cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CogroupError::Cancelled)
    }
}
