//! Error types for lbsyncd

use crate::control::DecodeError;
use crate::exit::FatalError;
use lb_common::DbError;
use thiserror::Error;

/// Errors that can occur in lbsyncd
#[derive(Debug, Error)]
pub enum LbsyncError {
    /// Configuration file missing, unreadable or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Control source transport failure
    #[error("Control source error: {0}")]
    Control(String),

    /// Control record failed validation
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Table operation failed
    #[error("Table error: {0}")]
    Db(#[from] DbError),

    /// Unrecoverable failure routed through the exit controller
    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for lbsyncd operations
pub type Result<T> = std::result::Result<T, LbsyncError>;
