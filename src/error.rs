//! Application error types.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Classification of a failure reported by an external graph source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFault {
    /// Network hiccup or timeout.
    Transient,
    /// Expired or rejected credentials.
    Auth,
    /// The source is throttling us.
    RateLimited,
    /// The source could not be reached at all.
    Unavailable,
    /// The source answered with something we cannot use.
    Fatal,
}

impl SourceFault {
    /// Whether a call failing with this fault should be attempted again.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            SourceFault::Transient | SourceFault::Auth | SourceFault::RateLimited
        )
    }
}

impl fmt::Display for SourceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SourceFault::Transient => "transient",
            SourceFault::Auth => "auth",
            SourceFault::RateLimited => "rate limited",
            SourceFault::Unavailable => "unavailable",
            SourceFault::Fatal => "fatal",
        };
        f.write_str(label)
    }
}

/// Application-level errors for twingraph.
#[derive(Error, Debug)]
pub enum AppError {
    // Collaborator errors
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Source '{source_name}' failed ({fault}): {message}")]
    Source {
        source_name: String,
        fault: SourceFault,
        message: String,
    },

    // Domain errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Type not found: {0}")]
    TypeNotFound(String),

    // Plumbing
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Operation cancelled")]
    Cancelled,

    /// An error observed by several waiters of one single-flight call.
    #[error("{0}")]
    Shared(Arc<AppError>),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Shorthand for a source failure.
    pub fn source_failure(name: &str, fault: SourceFault, message: impl Into<String>) -> Self {
        AppError::Source {
            source_name: name.to_string(),
            fault,
            message: message.into(),
        }
    }

    /// True for transient, auth and throttling faults.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Source { fault, .. } => fault.is_retryable(),
            AppError::Shared(inner) => inner.is_retryable(),
            _ => false,
        }
    }

    /// True when the error is the cancellation signal rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            AppError::Cancelled => true,
            AppError::Shared(inner) => inner.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_faults() {
        assert!(AppError::source_failure("a", SourceFault::Transient, "x").is_retryable());
        assert!(AppError::source_failure("a", SourceFault::Auth, "x").is_retryable());
        assert!(AppError::source_failure("a", SourceFault::RateLimited, "x").is_retryable());
        assert!(!AppError::source_failure("a", SourceFault::Unavailable, "x").is_retryable());
        assert!(!AppError::source_failure("a", SourceFault::Fatal, "x").is_retryable());
        assert!(!AppError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn test_shared_delegates() {
        let shared = AppError::Shared(Arc::new(AppError::source_failure(
            "a",
            SourceFault::RateLimited,
            "slow down",
        )));
        assert!(shared.is_retryable());
        assert!(AppError::Shared(Arc::new(AppError::Cancelled)).is_cancelled());
    }

    #[test]
    fn test_source_display() {
        let err = AppError::source_failure("primary", SourceFault::Auth, "token expired");
        assert_eq!(
            err.to_string(),
            "Source 'primary' failed (auth): token expired"
        );
    }
}
