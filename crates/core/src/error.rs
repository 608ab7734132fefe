use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Cannot reduce an empty set of outcomes")]
    EmptyOutcomeSet,

    #[error("Invalid result outcome: {0}")]
    InvalidOutcome(String),

    #[error("Invalid result interpretation: {0}")]
    InvalidInterpret(String),

    #[error("No interpretation defined for check '{0}'")]
    MissingCheckInterpret(String),

    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

impl CoreError {
    /// Create an invalid duration error.
    pub fn invalid_duration(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDuration {
            value: value.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
