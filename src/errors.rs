use std::str::Utf8Error;

use thiserror::Error;

/// Classified provider failure, produced by the client facade in `crate::aws`.
///
/// The reconcilers branch on the class, not on raw SDK types: transient and
/// access errors requeue, validation errors surface as an `Invalid` condition
/// and wait for a spec fix, fatal errors move the entity to a terminal state.
#[derive(Error, Debug)]
pub enum AwsError {
    #[error("transient provider error [{code}]: {message}")]
    Transient { code: String, message: String },

    #[error("access denied [{code}]: {message}")]
    AccessDenied { code: String, message: String },

    #[error("validation failure [{code}]: {message}")]
    Validation { code: String, message: String },

    #[error("resource not found [{code}]: {message}")]
    NotFound { code: String, message: String },

    #[error("fatal provider error [{code}]: {message}")]
    Fatal { code: String, message: String },

    #[error("missing field in provider response: {0}")]
    MissingField(&'static str),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl AwsError {
    pub fn code(&self) -> &str {
        match self {
            AwsError::Transient { code, .. }
            | AwsError::AccessDenied { code, .. }
            | AwsError::Validation { code, .. }
            | AwsError::NotFound { code, .. }
            | AwsError::Fatal { code, .. } => code,
            AwsError::MissingField(_) => "MissingField",
            AwsError::Timeout(_) => "Timeout",
        }
    }

    /// Whether the caller should requeue and try again rather than fail the
    /// entity.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AwsError::Transient { .. } | AwsError::AccessDenied { .. } | AwsError::Timeout(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AwsError::NotFound { .. })
    }
}

#[derive(Error, Debug)]
pub enum ValueError {
    #[error("Invalid value: {0}")]
    Invalid(String),
    #[error("Byte error: {0}")]
    ByteError(#[from] Utf8Error),
    #[error("IntError: {0}")]
    IntError(#[from] std::num::ParseIntError),
    #[error("FloatError: {0}")]
    FloatError(#[from] std::num::ParseFloatError),
    #[error("DateTime Parse Error: {0}")]
    ChronoParseError(#[from] chrono::format::ParseError),
}
