//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// stock checks, races lost against another commit). Storage failures belong
/// to the infrastructure layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Client-supplied input was rejected (e.g. a quantity below 1).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The requested quantity exceeds what is left at check time.
    #[error("insufficient stock: {0}")]
    InsufficientStock(String),

    /// A concurrent commit consumed the stock between check and write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A referenced record does not exist (for this user).
    #[error("{0} not found")]
    NotFound(&'static str),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn insufficient_stock(msg: impl Into<String>) -> Self {
        Self::InsufficientStock(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(what: &'static str) -> Self {
        Self::NotFound(what)
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
