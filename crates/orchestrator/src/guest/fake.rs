//! Scripted guest for unit tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{CommandOutput, ExecuteOptions, Guest, GuestError, GuestResult, RebootMode};

type Responder = dyn Fn(&str, &ExecuteOptions) -> GuestResult<CommandOutput> + Send + Sync;

#[derive(Clone)]
pub(crate) struct FakeGuest {
    name: String,
    role: Option<String>,
    phase: Option<String>,
    responder: Arc<Responder>,
    soft_reboot: bool,
    reboot_succeeds: bool,
    executed: Arc<Mutex<Vec<String>>>,
    reboots: Arc<Mutex<Vec<RebootMode>>>,
    pulls: Arc<AtomicUsize>,
    pushes: Arc<AtomicUsize>,
}

impl FakeGuest {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            role: None,
            phase: None,
            responder: Arc::new(|_, _| Ok(CommandOutput::default())),
            soft_reboot: true,
            reboot_succeeds: true,
            executed: Arc::new(Mutex::new(Vec::new())),
            reboots: Arc::new(Mutex::new(Vec::new())),
            pulls: Arc::new(AtomicUsize::new(0)),
            pushes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn with_role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }

    pub(crate) fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str, &ExecuteOptions) -> GuestResult<CommandOutput> + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    pub(crate) fn without_soft_reboot(mut self) -> Self {
        self.soft_reboot = false;
        self
    }

    pub(crate) fn with_failing_reboot(mut self) -> Self {
        self.reboot_succeeds = false;
        self
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub(crate) fn reboots(&self) -> Vec<RebootMode> {
        self.reboots.lock().unwrap().clone()
    }

    pub(crate) fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub(crate) fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for FakeGuest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeGuest")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .finish()
    }
}

impl Guest for FakeGuest {
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
        self.executed.lock().unwrap().push(command.to_string());
        (self.responder)(command, options)
    }

    fn push(&self, _path: &Path) -> GuestResult<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn pull(&self, _path: &Path) -> GuestResult<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reboot(
        &self,
        mode: RebootMode,
        _command: Option<&str>,
        _timeout: Duration,
    ) -> GuestResult<bool> {
        if mode == RebootMode::Soft && !self.soft_reboot {
            return Err(GuestError::unsupported(&self.name, "soft reboot"));
        }
        self.reboots.lock().unwrap().push(mode);
        Ok(self.reboot_succeeds)
    }

    fn reparent(&self, phase: &str) -> Arc<dyn Guest> {
        let mut guest = self.clone();
        guest.phase = Some(phase.to_string());
        Arc::new(guest)
    }
}
