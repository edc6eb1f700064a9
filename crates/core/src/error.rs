//! Core error model.

use thiserror::Error;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while constructing or parsing core primitives.
///
/// Everything here is deterministic input rejection; IO failures belong to
/// the broker and infra crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A hub identifier was empty or malformed.
    #[error("invalid hub: {0}")]
    InvalidHub(String),

    /// An entity type or key was malformed.
    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    /// A value failed validation.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_hub(msg: impl Into<String>) -> Self {
        Self::InvalidHub(msg.into())
    }

    pub fn invalid_entity(msg: impl Into<String>) -> Self {
        Self::InvalidEntity(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
