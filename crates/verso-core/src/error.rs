//! Error types and result aliases for Verso.
//!
//! This module defines the shared error types used by the primitive types in
//! this crate. Storage and API layers define their own error enums and convert
//! from this one.

/// The result type used throughout Verso primitives.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when constructing or parsing Verso primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}
