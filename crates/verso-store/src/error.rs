//! Error types for verso-store operations.

use arrow::error::ArrowError;
use thiserror::Error;
use verso_core::Transient;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A connection could not be established or was lost.
    ///
    /// This is the only transient failure class: writes retry it with backoff.
    #[error("connectivity error: {message}")]
    Connectivity {
        /// Description of the connectivity failure.
        message: String,
    },

    /// A statement failed while executing.
    #[error("query failed: {message}")]
    Query {
        /// Description of the query failure.
        message: String,
    },

    /// Arrow batch construction or filtering failed.
    #[error("arrow error: {message}")]
    Arrow {
        /// Description of the Arrow failure.
        message: String,
    },

    /// A stored document could not be (de)serialized.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Write input was rejected before touching storage.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the rejected input.
        message: String,
    },

    /// Resource not found.
    #[error("not found: {message}")]
    NotFound {
        /// Description of what was not found.
        message: String,
    },

    /// Stored data violates an internal invariant (schema drift, unbound parameter).
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// Description of the violated invariant.
        message: String,
    },

    /// Core error (identifier parsing, workspace validation).
    #[error("core error: {0}")]
    Core(#[from] verso_core::Error),
}

impl StoreError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates an invariant violation error.
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }
}

impl From<ArrowError> for StoreError {
    fn from(err: ArrowError) -> Self {
        Self::Arrow {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connectivity_is_transient() {
        let transient = StoreError::Connectivity {
            message: "connection reset".into(),
        };
        assert!(transient.is_transient());
        assert!(!StoreError::validation("bad input").is_transient());
        assert!(!StoreError::invariant("bad column").is_transient());
        assert!(!StoreError::Query {
            message: "boom".into()
        }
        .is_transient());
    }
}
