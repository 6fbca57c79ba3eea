//! Error types for provider id parsing and construction.

use thiserror::Error;

/// Errors that can occur when parsing or building a provider id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The id string is empty.
    #[error("provider id cannot be empty")]
    Empty,

    /// The id does not start with the `metal://` scheme.
    #[error("provider id missing scheme: expected '{expected}', got '{actual}'")]
    MissingScheme {
        expected: &'static str,
        actual: String,
    },

    /// The partition is empty.
    #[error("partition cannot be empty")]
    EmptyPartition,

    /// The partition contains the reserved separator.
    #[error("partition '{0}' contains reserved separator '/'")]
    ReservedSeparator(String),

    /// The instance id is empty.
    #[error("instance id cannot be empty")]
    EmptyInstanceId,

    /// The id format is invalid.
    #[error("invalid provider id format: {message}")]
    InvalidFormat { message: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error was caused by the partition component.
    pub fn is_partition_error(&self) -> bool {
        matches!(self, IdError::EmptyPartition | IdError::ReservedSeparator(_))
    }
}
