use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use super::{
    CommandOutput, ExecuteOptions, Guest, GuestError, GuestResult, RebootMode, RunError,
    TIMEOUT_RETURN_CODE,
};

/// The machine running the orchestrator.
///
/// Commands go through `sh -c`. Pushing and pulling are no-ops since the
/// workdir is already local, and the host is never rebooted.
#[derive(Clone)]
pub struct LocalGuest {
    name: String,
    role: Option<String>,
    phase: Option<String>,
    runtime: Arc<Runtime>,
}

impl LocalGuest {
    pub fn new(name: impl Into<String>) -> GuestResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("local-guest")
            .enable_all()
            .build()
            .map_err(|e| GuestError::Runtime(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            role: None,
            phase: None,
            runtime: Arc::new(runtime),
        })
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    async fn run(command: &str, options: &ExecuteOptions) -> GuestResult<CommandOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd.spawn()?;
        let output = match options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(output) => output?,
                // Dropping the wait future kills the child
                Err(_) => {
                    return Err(RunError {
                        command: command.to_string(),
                        returncode: Some(TIMEOUT_RETURN_CODE),
                        stdout: String::new(),
                        stderr: format!("Command timed out after {:?}", timeout),
                    }
                    .into())
                }
            },
            None => child.wait_with_output().await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            Ok(CommandOutput { stdout, stderr })
        } else {
            Err(RunError {
                command: command.to_string(),
                returncode: output.status.code(),
                stdout,
                stderr,
            }
            .into())
        }
    }
}

impl std::fmt::Debug for LocalGuest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGuest")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("phase", &self.phase)
            .finish()
    }
}

impl Guest for LocalGuest {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    fn phase(&self) -> Option<&str> {
        self.phase.as_deref()
    }

    fn execute(&self, command: &str, options: &ExecuteOptions) -> GuestResult<CommandOutput> {
        debug!(guest = %self.name, command = %command, "Executing command");
        self.runtime.block_on(Self::run(command, options))
    }

    fn push(&self, path: &Path) -> GuestResult<()> {
        debug!(guest = %self.name, path = ?path, "Nothing to push on local guest");
        Ok(())
    }

    fn pull(&self, path: &Path) -> GuestResult<()> {
        debug!(guest = %self.name, path = ?path, "Nothing to pull on local guest");
        Ok(())
    }

    fn reboot(
        &self,
        mode: RebootMode,
        _command: Option<&str>,
        _timeout: Duration,
    ) -> GuestResult<bool> {
        warn!(guest = %self.name, mode = mode.as_str(), "Refusing to reboot the local host");
        Err(GuestError::unsupported(
            &self.name,
            format!("{} reboot", mode.as_str()),
        ))
    }

    fn reparent(&self, phase: &str) -> Arc<dyn Guest> {
        let mut guest = self.clone();
        guest.phase = Some(phase.to_string());
        Arc::new(guest)
    }
}
