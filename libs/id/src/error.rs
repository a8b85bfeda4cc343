//! Error types for identifier parsing.

use thiserror::Error;

/// Errors produced while parsing an identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input was empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The input had no `_` between prefix and ULID.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The prefix does not belong to the requested identifier type.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ULID portion failed to decode.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if the input named a different identifier type.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
