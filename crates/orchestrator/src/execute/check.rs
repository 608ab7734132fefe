//! Probes run around every test.

use std::fs;
use std::sync::OnceLock;

use regex::Regex;
use testrun_core::{CheckEvent, CheckResult, ResultOutcome};
use tracing::{debug, warn};

use super::invocation::TestInvocation;
use crate::error::{OrchestratorError, Result};
use crate::guest::{ExecuteOptions, GuestError};

pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    fn before_test(&self, invocation: &TestInvocation<'_>) -> Result<Vec<CheckResult>>;

    fn after_test(&self, invocation: &TestInvocation<'_>) -> Result<Vec<CheckResult>>;
}

/// Look up a check by its `how`.
pub fn check_for(how: &str) -> Result<Box<dyn Check>> {
    match how {
        DmesgCheck::NAME => Ok(Box::new(DmesgCheck)),
        other => Err(OrchestratorError::specification(format!(
            "Unsupported check '{}'",
            other
        ))),
    }
}

static KERNEL_FAILURE: OnceLock<Option<Regex>> = OnceLock::new();

fn kernel_failure() -> Option<&'static Regex> {
    KERNEL_FAILURE
        .get_or_init(|| Regex::new(r"Call Trace|segfault|BUG:").ok())
        .as_ref()
}

/// Kernel ring buffer capture.
///
/// Only lines that appeared while the test was running are searched for
/// kernel failures.
pub struct DmesgCheck;

impl DmesgCheck {
    pub const NAME: &'static str = "dmesg";

    fn capture(&self, invocation: &TestInvocation<'_>, event: CheckEvent) -> Result<CheckResult> {
        let logdir = invocation.checks_path();
        fs::create_dir_all(&logdir)?;
        let log = logdir.join(format!("{}-{}.txt", Self::NAME, event.as_str()));

        let output = match invocation.guest.execute("dmesg", &ExecuteOptions::new()) {
            Ok(output) => output,
            Err(GuestError::Run(error)) => {
                warn!(guest = %invocation.guest.name(), error = %error, "Failed to read kernel ring buffer");
                return Ok(CheckResult::new(Self::NAME, ResultOutcome::Warn, event)
                    .with_note(format!("failed to read kernel ring buffer: {}", error)));
            }
            Err(e) => return Err(e.into()),
        };
        fs::write(&log, &output.stdout)?;

        let outcome = match event {
            CheckEvent::BeforeTest => ResultOutcome::Pass,
            CheckEvent::AfterTest => {
                let before = logdir.join(format!("{}-{}.txt", Self::NAME, CheckEvent::BeforeTest.as_str()));
                let before = fs::read_to_string(before).unwrap_or_default();
                let new_lines = output.stdout.strip_prefix(before.as_str()).unwrap_or(&output.stdout);

                match kernel_failure() {
                    Some(pattern) if pattern.is_match(new_lines) => ResultOutcome::Fail,
                    _ => ResultOutcome::Pass,
                }
            }
        };
        debug!(guest = %invocation.guest.name(), event = event.as_str(), result = %outcome, "Checked kernel ring buffer");

        Ok(CheckResult::new(Self::NAME, outcome, event).with_log(log))
    }
}

impl Check for DmesgCheck {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn before_test(&self, invocation: &TestInvocation<'_>) -> Result<Vec<CheckResult>> {
        Ok(vec![self.capture(invocation, CheckEvent::BeforeTest)?])
    }

    fn after_test(&self, invocation: &TestInvocation<'_>) -> Result<Vec<CheckResult>> {
        Ok(vec![self.capture(invocation, CheckEvent::AfterTest)?])
    }
}
