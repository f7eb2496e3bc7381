//! Unified error types for Backspace

use thiserror::Error;

use crate::AbortReason;

/// Unified error type for all Backspace operations
#[derive(Error, Debug)]
pub enum BackspaceError {
    // Resource errors
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // Workspace errors
    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Path validation failed: {0}")]
    PathValidation(String),

    // Source control errors
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    // Generator errors
    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("API rate limit: {0}")]
    ApiLimit(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    // Publisher errors
    #[error("Publish failed: {0}")]
    Publish(String),

    // Job lifecycle
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl BackspaceError {
    /// Terminal job outcome this error maps to when it escapes the agent loop
    pub fn abort_reason(&self) -> AbortReason {
        match self {
            Self::ResourceExhausted(_) => AbortReason::ResourceExhausted,
            Self::SourceUnavailable(_) => AbortReason::SourceUnavailable,
            Self::Generation(_) | Self::Api(_) | Self::ApiLimit(_) | Self::Auth(_) => {
                AbortReason::GenerationExhausted
            }
            Self::Publish(_) => AbortReason::PublishFailed,
            Self::Cancelled => AbortReason::Cancelled,
            Self::DeadlineExceeded => AbortReason::DeadlineExceeded,
            Self::Workspace(_)
            | Self::PathValidation(_)
            | Self::JobNotFound(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Other(_) => AbortReason::IoFailure,
        }
    }

    /// True for the two interruption errors that end a job without a verdict
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// Result type alias using BackspaceError
pub type Result<T> = std::result::Result<T, BackspaceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_reason_mapping() {
        assert_eq!(
            BackspaceError::SourceUnavailable("bad ref".into()).abort_reason(),
            AbortReason::SourceUnavailable
        );
        assert_eq!(
            BackspaceError::ResourceExhausted("quota".into()).abort_reason(),
            AbortReason::ResourceExhausted
        );
        assert_eq!(
            BackspaceError::Io(std::io::Error::other("disk")).abort_reason(),
            AbortReason::IoFailure
        );
        assert_eq!(BackspaceError::Cancelled.abort_reason(), AbortReason::Cancelled);
    }

    #[test]
    fn test_interruptions() {
        assert!(BackspaceError::Cancelled.is_interruption());
        assert!(BackspaceError::DeadlineExceeded.is_interruption());
        assert!(!BackspaceError::Other("x".into()).is_interruption());
    }
}
