use std::fmt;

use thiserror::Error;

use crate::guest::GuestError;

/// Request to stop the whole run immediately.
///
/// This is not a failure. It travels through the task and queue layers
/// untouched and is handed back to the top-level caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunExit {
    pub reason: String,
}

impl RunExit {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for RunExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Specification error: {0}")]
    Specification(String),

    #[error("Duplicate phase name '{name}' in step '{step}'")]
    DuplicatePhase { step: String, name: String },

    #[error("Unsupported how '{how}' in step '{step}'")]
    UnknownHow { step: String, how: String },

    #[error("No guests left for phase '{0}', check its 'where' filter")]
    EmptyGuestSet(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Guest '{guest}' did not come back within {timeout_secs}s after reboot")]
    RebootTimeout { guest: String, timeout_secs: u64 },

    #[error("Test '{test}' exceeded the maximum of {max} restarts")]
    RestartLimitExceeded { test: String, max: u32 },

    #[error("Phase '{phase}' failed: {reason}")]
    PhaseFailed { phase: String, reason: String },

    #[error("Guest error: {0}")]
    Guest(#[from] GuestError),

    #[error("Run was interrupted")]
    Interrupted,

    #[error("Run exit requested: {0}")]
    Exit(RunExit),

    #[error("Unit panicked: {0}")]
    Panicked(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    #[error(transparent)]
    Core(#[from] testrun_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OrchestratorError {
    /// Create a specification error.
    pub fn specification(message: impl Into<String>) -> Self {
        Self::Specification(message.into())
    }

    /// Create a phase failed error.
    pub fn phase_failed(phase: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PhaseFailed {
            phase: phase.into(),
            reason: reason.into(),
        }
    }

    /// Configuration problems are never retried nor turned into results.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Specification(_)
                | Self::DuplicatePhase { .. }
                | Self::UnknownHow { .. }
                | Self::EmptyGuestSet(_)
        )
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<RunExit> for OrchestratorError {
    fn from(exit: RunExit) -> Self {
        Self::Exit(exit)
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
