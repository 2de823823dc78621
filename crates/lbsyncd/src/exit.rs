//! Exit controller - the single escape path for unrecoverable failures.
//!
//! Components never terminate the process. They call
//! [`ExitController::fatal`], which raises the process-wide cancellation
//! flag and hands back a [`FatalError`] to propagate. The supervisor in
//! [`crate::daemon`] observes the token, stops the control loop and tears
//! the tables down in order.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Unrecoverable failure; the daemon must shut down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fatal: {reason}")]
pub struct FatalError {
    pub reason: String,
}

impl FatalError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Default)]
struct ExitState {
    first_reason: Option<String>,
    invocations: u64,
}

/// Process-wide cancellation flag plus the first fatal reason.
///
/// Cheap to clone; all clones share the same token.
#[derive(Debug, Clone, Default)]
pub struct ExitController {
    token: CancellationToken,
    state: Arc<Mutex<ExitState>>,
}

impl ExitController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fatal failure and requests cancellation.
    ///
    /// Idempotent: only the first reason is kept and logged at error
    /// level; later calls are logged at warn level and return an error
    /// carrying the first reason.
    pub fn fatal(&self, reason: impl Into<String>) -> FatalError {
        let reason = reason.into();
        let mut state = self.state.lock();
        state.invocations += 1;

        let first = match &state.first_reason {
            Some(first) => {
                warn!(reason = %reason, first = %first, "Fatal error after shutdown was requested");
                first.clone()
            }
            None => {
                error!(reason = %reason, "Fatal error, shutting down");
                state.first_reason = Some(reason.clone());
                reason
            }
        };
        drop(state);

        self.token.cancel();
        FatalError::new(first)
    }

    /// Requests an orderly shutdown without recording a failure.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The cancellation token observed by the control loop and timers.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The first fatal reason, if any.
    pub fn fatal_reason(&self) -> Option<String> {
        self.state.lock().first_reason.clone()
    }

    /// Number of times [`fatal`](Self::fatal) has been called.
    pub fn fatal_count(&self) -> u64 {
        self.state.lock().invocations
    }
}
