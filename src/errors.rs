//! Application error model
//!
//! Defines a typed error hierarchy using `thiserror`. Every component fails
//! fast with one of these kinds; only the batch executor absorbs per-item
//! failures into its report instead of propagating them.

use thiserror::Error;

/// Application error type
///
/// Each variant carries a human-readable message and maps to a stable
/// machine-readable code via [`AppError::code`].
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (malformed address, bad parameter, invalid path)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (identity, message, attachment part)
    #[error("not found: {0}")]
    NotFound(String),
    /// Duplicate registration (identity already present)
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Path vetoed by the path guard
    #[error("blocked for security reasons: {0}")]
    SecurityBlocked(String),
    /// Credential missing, corrupt, or not refreshable
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Remote mailbox API failure, preserving its status and message
    #[error("remote request failed ({status}): {message}")]
    Remote {
        /// HTTP-equivalent status code reported by the collaborator
        status: u16,
        /// Collaborator error message
        message: String,
    },
    /// No identity hint was given and no default identity is registered
    #[error("no identity available: pass an account or set a default account")]
    NoDefaultIdentity,
    /// Operation timeout
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Internal error (I/O, serialization, unexpected failure)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Convenience constructor for `Remote`
    pub fn remote(status: u16, msg: impl Into<String>) -> Self {
        Self::Remote {
            status,
            message: msg.into(),
        }
    }

    /// Stable machine-readable code for this error kind
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::SecurityBlocked(_) => "security_blocked",
            Self::AuthFailed(_) => "auth_failed",
            Self::Remote { .. } => "remote_failure",
            Self::NoDefaultIdentity => "no_default_identity",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether this error means the addressed resource does not exist
    ///
    /// True for `NotFound` and for remote failures with status 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Remote { status: 404, .. })
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;
