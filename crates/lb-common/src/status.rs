//! Table operation status and error handling.
//!
//! Every keyed-table operation resolves to one of five classes. `Ok(_)` is
//! the OK class; the remaining four are carried by [`DbError`].

use std::fmt;
use thiserror::Error;

/// Status classes reported by table operations.
///
/// Used as a structured log field so that every failure line carries the
/// same vocabulary regardless of which table produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Ok,
    NotFound,
    NotSupported,
    InternalError,
    BackendError,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusKind::Ok => "OK",
            StatusKind::NotFound => "NOT_FOUND",
            StatusKind::NotSupported => "NOT_SUPPORTED",
            StatusKind::InternalError => "INTERNAL_ERROR",
            StatusKind::BackendError => "BACKEND_ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Error type for keyed-table and registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// The requested entry does not exist.
    #[error("entry not found")]
    NotFound,

    /// The request is well formed but not supported by this node.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Invariant violation or unrecoverable backend state.
    #[error("internal error: {0}")]
    Internal(String),

    /// Backend failure caused by capacity or a transient condition.
    #[error("backend error: {0}")]
    Backend(String),

    /// Hardware lookup engine failure. Reported as a backend error but
    /// never survivable while applying incremental events.
    #[error("hardware error: {0}")]
    Hardware(String),
}

impl DbError {
    /// Creates a not-supported error.
    pub fn not_supported(message: impl Into<String>) -> Self {
        DbError::NotSupported(message.into())
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        DbError::Internal(message.into())
    }

    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        DbError::Backend(message.into())
    }

    /// Creates a hardware error.
    pub fn hardware(message: impl Into<String>) -> Self {
        DbError::Hardware(message.into())
    }

    /// Returns the status class of this error.
    pub fn kind(&self) -> StatusKind {
        match self {
            DbError::NotFound => StatusKind::NotFound,
            DbError::NotSupported(_) => StatusKind::NotSupported,
            DbError::Internal(_) => StatusKind::InternalError,
            DbError::Backend(_) | DbError::Hardware(_) => StatusKind::BackendError,
        }
    }

    /// Returns true if this error must stop incremental event processing.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::Internal(_) | DbError::Hardware(_))
    }

    /// Returns true for [`DbError::Internal`].
    pub fn is_internal(&self) -> bool {
        matches!(self, DbError::Internal(_))
    }
}

/// Result type for table operations.
pub type DbResult<T> = Result<T, DbError>;
