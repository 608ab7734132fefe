//! Guests: the machines tests run against.
//!
//! The orchestrator only talks to guests through the [`Guest`] trait. A guest
//! is never shared between concurrently running phases as is; every phase
//! gets its own copy from [`Guest::reparent`].

mod local;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use testrun_core::ResultGuestData;

use crate::error::{OrchestratorError, Result};

pub use local::LocalGuest;

/// Return code reported when a command is killed after its deadline.
pub const TIMEOUT_RETURN_CODE: i32 = 124;

/// A command finished with a non-zero return code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Command '{command}' returned {}", describe_returncode(.returncode))]
pub struct RunError {
    pub command: String,
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

fn describe_returncode(returncode: &Option<i32>) -> String {
    returncode
        .map(|code| code.to_string())
        .unwrap_or_else(|| "no return code".to_string())
}

#[derive(Debug, Error)]
pub enum GuestError {
    #[error(transparent)]
    Run(#[from] RunError),

    #[error("Unsupported on guest '{guest}': {operation}")]
    Unsupported { guest: String, operation: String },

    #[error("Failed to transfer {path:?}: {reason}")]
    Transfer { path: PathBuf, reason: String },

    #[error("Guest runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GuestError {
    pub fn unsupported(guest: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            guest: guest.into(),
            operation: operation.into(),
        }
    }
}

pub type GuestResult<T> = std::result::Result<T, GuestError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootMode {
    Soft,
    Hard,
}

impl RebootMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebootMode::Soft => "soft",
            RebootMode::Hard => "hard",
        }
    }
}

pub trait Guest: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn role(&self) -> Option<&str>;

    /// Name of the phase this copy of the guest belongs to.
    fn phase(&self) -> Option<&str>;

    /// Run a shell command. A non-zero return code is a [`GuestError::Run`].
    fn execute(&self, command: &str, options: &ExecuteOptions) -> GuestResult<CommandOutput>;

    /// Sync a local path to the guest.
    fn push(&self, path: &Path) -> GuestResult<()>;

    /// Sync a path from the guest back to the local copy.
    fn pull(&self, path: &Path) -> GuestResult<()>;

    /// Reboot and wait for the guest to come back.
    ///
    /// Returns `false` when the guest did not reconnect within `timeout`.
    /// Modes the guest cannot perform yield [`GuestError::Unsupported`].
    fn reboot(
        &self,
        mode: RebootMode,
        command: Option<&str>,
        timeout: Duration,
    ) -> GuestResult<bool>;

    /// Copy of this guest bound to the given phase.
    fn reparent(&self, phase: &str) -> Arc<dyn Guest>;

    fn matches(&self, target: &str) -> bool {
        self.name() == target || self.role() == Some(target)
    }

    fn result_data(&self) -> ResultGuestData {
        ResultGuestData::new(self.name(), self.role().map(str::to_string))
    }
}

/// Guests selected by a `where` filter. An empty filter selects everything.
pub fn filter_guests(guests: &[Arc<dyn Guest>], targets: &[String]) -> Vec<Arc<dyn Guest>> {
    guests
        .iter()
        .filter(|guest| targets.is_empty() || targets.iter().any(|t| guest.matches(t)))
        .cloned()
        .collect()
}

/// Reboot a guest, falling back to a hard reboot when it cannot do a soft one.
///
/// Returns the mode that was actually used. A guest that does not come back
/// within `timeout` is a [`OrchestratorError::RebootTimeout`].
pub fn reboot_guest(
    guest: &dyn Guest,
    hard: bool,
    command: Option<&str>,
    timeout: Duration,
) -> Result<RebootMode> {
    let mode = if hard { RebootMode::Hard } else { RebootMode::Soft };
    info!(guest = %guest.name(), mode = mode.as_str(), "Rebooting guest");

    let (mode, reconnected) = match guest.reboot(mode, command, timeout) {
        Ok(reconnected) => (mode, reconnected),
        Err(GuestError::Unsupported { operation, .. }) if mode == RebootMode::Soft => {
            warn!(guest = %guest.name(), operation = %operation, "Soft reboot unsupported, trying hard reboot");
            (
                RebootMode::Hard,
                guest.reboot(RebootMode::Hard, None, timeout)?,
            )
        }
        Err(e) => return Err(e.into()),
    };

    if !reconnected {
        return Err(OrchestratorError::RebootTimeout {
            guest: guest.name().to_string(),
            timeout_secs: timeout.as_secs(),
        });
    }
    Ok(mode)
}
