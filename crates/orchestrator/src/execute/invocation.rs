//! One run of one test on one guest.
//!
//! The test talks back to the orchestrator through marker files in its
//! invocation directory. The directory is pushed to the guest before the test
//! starts and pulled back after every run, so the markers are always read
//! from the local copy.
//!
//! | marker            | meaning                                       |
//! |-------------------|-----------------------------------------------|
//! | `reboot-request`  | reboot the guest, then run the test again     |
//! | `restart-request` | run the test again without a reboot           |
//! | `abort`           | fail the test and stop running further tests  |
//! | `report-results`  | JSON lines of results reported by the test    |

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use events::Event;
use serde::{Deserialize, Serialize};
use testrun_core::{CheckResult, ResultInterpret, ResultOutcome, TestDefinition, TestResult};
use tracing::{debug, error, info, warn};

use super::check::{check_for, Check};
use super::framework::framework_for;
use crate::error::{OrchestratorError, Result};
use crate::guest::{reboot_guest, ExecuteOptions, Guest, GuestError, RebootMode, TIMEOUT_RETURN_CODE};
use crate::phase::PhaseContext;

pub const REBOOT_REQUEST_FILE: &str = "reboot-request";
pub const RESTART_REQUEST_FILE: &str = "restart-request";
pub const ABORT_FILE: &str = "abort";
pub const REPORT_RESULTS_FILE: &str = "report-results";

const DATA_DIR: &str = "data";
const CHECKS_DIR: &str = "checks";

/// Payload of the reboot marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootRequest {
    #[serde(default)]
    pub command: Option<String>,
    /// Seconds to wait for the guest to come back.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// A result reported by the test itself, either through the report marker
/// or in the `results.json` of a test with custom results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedResult {
    pub name: String,
    pub result: ResultOutcome,
    #[serde(default)]
    pub note: Vec<String>,
    #[serde(default)]
    pub log: Vec<PathBuf>,
}

/// What the execute loop needs to know once a test is over.
#[derive(Debug)]
pub struct InvocationReport {
    pub results: Vec<TestResult>,
    pub aborted: bool,
}

pub struct TestInvocation<'a> {
    ctx: &'a PhaseContext,
    pub test: &'a TestDefinition,
    pub guest: Arc<dyn Guest>,
    path: PathBuf,
    timeout: Duration,
    pub return_code: Option<i32>,
    /// Combined output of the last run.
    pub output: String,
    pub exceptions: Vec<String>,
    pub check_results: Vec<CheckResult>,
    pub reboot_count: u32,
    pub restart_count: u32,
    pub abort_requested: bool,
    pub timed_out: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl<'a> TestInvocation<'a> {
    pub fn new(
        ctx: &'a PhaseContext,
        phase: &str,
        test: &'a TestDefinition,
        guest: Arc<dyn Guest>,
    ) -> Self {
        let path = ctx
            .phase_workdir(phase)
            .join(guest.name())
            .join(format!("{}-{}", test.serial_number, test.safe_name()));

        Self {
            ctx,
            test,
            guest,
            path,
            timeout: Duration::ZERO,
            return_code: None,
            output: String::new(),
            exceptions: Vec::new(),
            check_results: Vec::new(),
            reboot_count: 0,
            restart_count: 0,
            abort_requested: false,
            timed_out: false,
            start_time: None,
            end_time: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory the test may store artifacts in.
    pub fn data_path(&self) -> PathBuf {
        self.path.join(DATA_DIR)
    }

    pub fn checks_path(&self) -> PathBuf {
        self.path.join(CHECKS_DIR)
    }

    pub fn marker(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Variables visible to the test.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut environment = self.ctx.environment.clone();
        environment.extend(self.test.environment.clone());

        let path = |name: &str| self.marker(name).display().to_string();
        environment.extend([
            ("TESTRUN_TEST_NAME".to_string(), self.test.name.clone()),
            (
                "TESTRUN_TEST_SERIAL_NUMBER".to_string(),
                self.test.serial_number.to_string(),
            ),
            (
                "TESTRUN_TEST_DATA".to_string(),
                self.data_path().display().to_string(),
            ),
            ("TESTRUN_REBOOT_COUNT".to_string(), self.reboot_count.to_string()),
            ("TESTRUN_RESTART_COUNT".to_string(), self.restart_count.to_string()),
            ("TESTRUN_REBOOT_REQUEST".to_string(), path(REBOOT_REQUEST_FILE)),
            ("TESTRUN_RESTART_REQUEST".to_string(), path(RESTART_REQUEST_FILE)),
            ("TESTRUN_ABORT_REQUEST".to_string(), path(ABORT_FILE)),
            ("TESTRUN_REPORT_RESULTS".to_string(), path(REPORT_RESULTS_FILE)),
        ]);
        environment
    }

    /// Deadline of a single run of the test command.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A result for this test with the invocation's guest, data and timing.
    pub fn new_result(&self, name: impl Into<String>, outcome: ResultOutcome) -> TestResult {
        let mut result = TestResult::new(name, outcome)
            .with_serial_number(self.test.serial_number)
            .with_guest(self.guest.result_data())
            .with_data_path(self.data_path());
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            result = result.with_timing(start, end);
        }
        result
    }

    /// Run the test to completion. Failures of the invocation itself become
    /// an `error` result, a run exit request is returned as an error.
    pub fn go(mut self) -> Result<InvocationReport> {
        info!(
            test = %self.test.name,
            serial_number = self.test.serial_number,
            guest = %self.guest.name(),
            "Running test"
        );
        self.ctx.config.emit(Event::TestStarted {
            test: self.test.name.clone(),
            serial_number: self.test.serial_number,
            guest: self.guest.name().to_string(),
        });

        let results = match self.run() {
            Ok(results) => results,
            Err(e) => self.failure_results(e)?,
        };

        for result in &results {
            info!(
                test = %result.name,
                guest = %self.guest.name(),
                result = %result.result,
                "Test finished"
            );
            self.ctx.config.emit(Event::TestFinished {
                test: result.name.clone(),
                serial_number: result.serial_number,
                guest: self.guest.name().to_string(),
                outcome: result.result.as_str().to_string(),
            });
        }

        Ok(InvocationReport {
            results,
            aborted: self.abort_requested,
        })
    }

    fn failure_results(&mut self, e: OrchestratorError) -> Result<Vec<TestResult>> {
        if let OrchestratorError::Exit(exit) = &e {
            info!(test = %self.test.name, guest = %self.guest.name(), reason = %exit, "Run exit requested");
            return Err(e);
        }

        error!(test = %self.test.name, guest = %self.guest.name(), error = %e, "Test invocation failed");
        self.exceptions.push(e.to_string());
        if let Err(pull_error) = self.guest.pull(&self.path) {
            warn!(test = %self.test.name, error = %pull_error, "Failed to pull test data");
        }
        self.end_time.get_or_insert_with(Utc::now);
        Ok(vec![self.new_result(&self.test.name, ResultOutcome::Error).with_note(e.to_string())])
    }

    fn run(&mut self) -> Result<Vec<TestResult>> {
        self.timeout = self.test.timeout()?;
        let checks = self
            .test
            .enabled_checks()
            .map(|spec| check_for(&spec.how))
            .collect::<Result<Vec<_>>>()?;
        let framework = framework_for(&self.test.framework)?;

        fs::create_dir_all(self.data_path())?;
        fs::create_dir_all(self.checks_path())?;
        self.guest.push(&self.path)?;

        self.start_time = Some(Utc::now());
        self.run_checks(&checks, |check, invocation| check.before_test(invocation))?;

        loop {
            self.execute()?;
            self.guest.pull(&self.path)?;

            if let Some(request) = self.take_reboot_request()? {
                self.handle_reboot(request)?;
                continue;
            }
            if self.take_restart_request()? {
                self.handle_restart()?;
                continue;
            }
            break;
        }

        self.run_checks(&checks, |check, invocation| check.after_test(invocation))?;
        self.abort_requested = self.marker(ABORT_FILE).exists();
        self.end_time = Some(Utc::now());

        let reported = self.load_reported()?;
        let results = framework.extract_results(self, &reported)?;

        let interpret = match self.test.result {
            ResultInterpret::Restraint => ResultInterpret::Respect,
            other => other,
        };
        let policies = self.test.check_interprets();
        let mut results = results
            .into_iter()
            .map(|result| result.interpret_result(interpret, &policies))
            .collect::<testrun_core::Result<Vec<_>>>()?;

        if self.abort_requested {
            warn!(test = %self.test.name, guest = %self.guest.name(), "Test requested abort");
            for result in &mut results {
                result.result = ResultOutcome::Fail;
                result.note.push("aborted".to_string());
            }
        }

        Ok(results)
    }

    fn run_checks<F>(&mut self, checks: &[Box<dyn Check>], invoke: F) -> Result<()>
    where
        F: Fn(&dyn Check, &TestInvocation<'a>) -> Result<Vec<CheckResult>>,
    {
        for check in checks {
            let results = invoke(check.as_ref(), self)?;
            self.check_results.extend(results);
        }
        Ok(())
    }

    fn execute(&mut self) -> Result<()> {
        let mut options = ExecuteOptions::new()
            .with_env(self.environment())
            .with_timeout(self.timeout);
        if let Some(path) = &self.test.path {
            options = options.with_cwd(path);
        }

        debug!(test = %self.test.name, command = %self.test.test, "Executing test command");
        let started = Instant::now();
        let outcome = self.guest.execute(&self.test.test, &options);
        let elapsed = started.elapsed();

        match outcome {
            Ok(output) => {
                self.return_code = Some(0);
                self.timed_out = false;
                self.output = output.stdout + &output.stderr;
            }
            Err(GuestError::Run(run_error)) => {
                self.return_code = run_error.returncode;
                self.timed_out =
                    run_error.returncode == Some(TIMEOUT_RETURN_CODE) && elapsed >= self.timeout;
                self.output = run_error.stdout + &run_error.stderr;
                if self.timed_out {
                    warn!(test = %self.test.name, timeout = ?self.timeout, "Test timed out");
                }
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn take_reboot_request(&self) -> Result<Option<RebootRequest>> {
        let marker = self.marker(REBOOT_REQUEST_FILE);
        if !marker.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&marker)?;
        let request = if content.trim().is_empty() {
            RebootRequest::default()
        } else {
            serde_json::from_str(&content).map_err(|e| {
                OrchestratorError::Serialization(format!("Invalid reboot request: {}", e))
            })?
        };
        fs::remove_file(&marker)?;
        Ok(Some(request))
    }

    fn handle_reboot(&mut self, request: RebootRequest) -> Result<()> {
        self.reboot_count += 1;
        info!(
            test = %self.test.name,
            guest = %self.guest.name(),
            reboot_count = self.reboot_count,
            "Test requested reboot"
        );
        self.guest.push(&self.path)?;

        let timeout = request
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.ctx.config.reboot_timeout);
        let mode = reboot_guest(
            self.guest.as_ref(),
            false,
            request.command.as_deref(),
            timeout,
        )?;

        self.ctx.config.emit(Event::GuestRebooted {
            guest: self.guest.name().to_string(),
            reboot_count: self.reboot_count,
            hard: mode == RebootMode::Hard,
        });
        Ok(())
    }

    fn take_restart_request(&self) -> Result<bool> {
        let marker = self.marker(RESTART_REQUEST_FILE);
        let requested = marker.exists();
        if requested {
            fs::remove_file(&marker)?;
        }

        let by_code = self
            .return_code
            .is_some_and(|code| self.test.restart_on_exit_code.contains(&code));
        Ok(requested || by_code)
    }

    fn handle_restart(&mut self) -> Result<()> {
        if self.restart_count >= self.test.restart_max_count {
            return Err(OrchestratorError::RestartLimitExceeded {
                test: self.test.name.clone(),
                max: self.test.restart_max_count,
            });
        }

        self.restart_count += 1;
        info!(
            test = %self.test.name,
            guest = %self.guest.name(),
            restart_count = self.restart_count,
            return_code = ?self.return_code,
            "Restarting test"
        );

        if self.test.restart_with_reboot {
            self.handle_reboot(RebootRequest::default())?;
        } else {
            self.guest.push(&self.path)?;
        }
        Ok(())
    }

    fn load_reported(&self) -> Result<Vec<ReportedResult>> {
        let marker = self.marker(REPORT_RESULTS_FILE);
        if !marker.exists() {
            return Ok(Vec::new());
        }

        fs::read_to_string(&marker)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    OrchestratorError::Serialization(format!("Invalid reported result: {}", e))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::error::RunExit;
    use crate::guest::fake::FakeGuest;
    use crate::guest::{CommandOutput, RunError};
    use crate::phase::StepKind;
    use events::EventBus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use testrun_core::{CheckResultInterpret, CheckSpec};

    fn context(temp_dir: &TempDir) -> PhaseContext {
        PhaseContext::new(
            RunConfig::new(temp_dir.path()),
            StepKind::Execute,
            temp_dir.path().join("execute"),
        )
        .with_environment([("PLAN_VAR".to_string(), "plan".to_string())].into())
    }

    fn run_error(command: &str, returncode: i32) -> GuestError {
        RunError {
            command: command.to_string(),
            returncode: Some(returncode),
            stdout: String::new(),
            stderr: String::new(),
        }
        .into()
    }

    fn marker_in(options: &ExecuteOptions, variable: &str) -> PathBuf {
        PathBuf::from(options.env.get(variable).unwrap())
    }

    #[test]
    fn test_passing_test() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let test = TestDefinition::new("/smoke", "true").with_serial_number(3);
        let fake = FakeGuest::new("vm").with_responder(|_, options| {
            assert_eq!(options.env["PLAN_VAR"], "plan");
            assert_eq!(options.env["TESTRUN_TEST_SERIAL_NUMBER"], "3");
            Ok(CommandOutput {
                stdout: "all good\n".to_string(),
                stderr: String::new(),
            })
        });

        let invocation = TestInvocation::new(&ctx, "default-0", &test, Arc::new(fake.clone()));
        let path = invocation.path().to_path_buf();
        let report = invocation.go().unwrap();

        assert!(!report.aborted);
        assert_eq!(report.results.len(), 1);
        let result = &report.results[0];
        assert_eq!(result.result, ResultOutcome::Pass);
        assert_eq!(result.serial_number, 3);
        assert_eq!(result.guest.name, "vm");
        assert!(result.start_time.is_some());
        assert!(path.ends_with("default-0/vm/3-smoke"));
        assert_eq!(fake.pulls(), 1);
    }

    #[test]
    fn test_failing_test_and_xfail() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let guest: Arc<dyn Guest> =
            Arc::new(FakeGuest::new("vm").with_responder(|command, _| Err(run_error(command, 1))));

        let plain = TestDefinition::new("/fails", "false");
        let report = TestInvocation::new(&ctx, "default-0", &plain, Arc::clone(&guest)).go().unwrap();
        assert_eq!(report.results[0].result, ResultOutcome::Fail);

        let expected = TestDefinition::new("/expected", "false").with_result(ResultInterpret::Xfail);
        let report = TestInvocation::new(&ctx, "default-0", &expected, guest).go().unwrap();
        assert_eq!(report.results[0].result, ResultOutcome::Pass);
        assert!(report.results[0].note.contains(&"test failed as expected".to_string()));
    }

    #[test]
    fn test_timeout_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let test = TestDefinition::new("/hangs", "sleep 100").with_duration("0s");
        let guest: Arc<dyn Guest> = Arc::new(
            FakeGuest::new("vm").with_responder(|command, _| Err(run_error(command, TIMEOUT_RETURN_CODE))),
        );

        let report = TestInvocation::new(&ctx, "default-0", &test, guest).go().unwrap();
        assert_eq!(report.results[0].result, ResultOutcome::Error);
        assert!(report.results[0].note.contains(&"timeout".to_string()));
    }

    #[test]
    fn test_reboot_request_reruns_test() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let test = TestDefinition::new("/reboots", "./test.sh");

        let fake = FakeGuest::new("vm").with_responder(|_, options| {
            if options.env["TESTRUN_REBOOT_COUNT"] == "0" {
                let marker = marker_in(options, "TESTRUN_REBOOT_REQUEST");
                fs::write(marker, r#"{"command": "systemctl reboot", "timeout": 60}"#).unwrap();
            }
            Ok(CommandOutput::default())
        });

        let invocation = TestInvocation::new(&ctx, "default-0", &test, Arc::new(fake.clone()));
        let marker = invocation.marker(REBOOT_REQUEST_FILE);
        let report = invocation.go().unwrap();

        assert_eq!(report.results[0].result, ResultOutcome::Pass);
        assert_eq!(fake.executed().len(), 2);
        assert_eq!(fake.reboots(), vec![RebootMode::Soft]);
        assert_eq!(fake.pushes(), 2);
        assert_eq!(fake.pulls(), 2);
        assert!(!marker.exists());
    }

    #[test]
    fn test_reboot_timeout_is_error_result() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let test = TestDefinition::new("/reboots", "./test.sh");
        let fake = FakeGuest::new("vm").with_failing_reboot().with_responder(|_, options| {
            fs::write(marker_in(options, "TESTRUN_REBOOT_REQUEST"), "").unwrap();
            Ok(CommandOutput::default())
        });

        let report = TestInvocation::new(&ctx, "default-0", &test, Arc::new(fake)).go().unwrap();
        assert_eq!(report.results[0].result, ResultOutcome::Error);
        assert!(report.results[0].note[0].contains("did not come back"));
    }

    #[test]
    fn test_restart_on_exit_code_is_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let flaky: Arc<dyn Guest> = Arc::new(FakeGuest::new("vm").with_responder(move |command, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(run_error(command, 79))
            } else {
                Ok(CommandOutput::default())
            }
        }));
        let test = TestDefinition::new("/flaky", "./flaky.sh").with_restart(vec![79], 2);
        let report = TestInvocation::new(&ctx, "default-0", &test, flaky).go().unwrap();
        assert_eq!(report.results[0].result, ResultOutcome::Pass);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let broken: Arc<dyn Guest> =
            Arc::new(FakeGuest::new("vm").with_responder(|command, _| Err(run_error(command, 79))));
        let test = TestDefinition::new("/broken", "./broken.sh").with_restart(vec![79], 1);
        let report = TestInvocation::new(&ctx, "default-0", &test, broken).go().unwrap();
        assert_eq!(report.results[0].result, ResultOutcome::Error);
        assert!(report.results[0].note[0].contains("maximum of 1 restarts"));
    }

    #[test]
    fn test_restart_with_reboot() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let fake = FakeGuest::new("vm").with_responder(|_, options| {
            if options.env["TESTRUN_RESTART_COUNT"] == "0" {
                fs::write(marker_in(options, "TESTRUN_RESTART_REQUEST"), "").unwrap();
            }
            Ok(CommandOutput::default())
        });
        let mut test = TestDefinition::new("/restarts", "./test.sh");
        test.restart_with_reboot = true;

        let report = TestInvocation::new(&ctx, "default-0", &test, Arc::new(fake.clone())).go().unwrap();
        assert_eq!(report.results[0].result, ResultOutcome::Pass);
        assert_eq!(fake.reboots().len(), 1);
        assert_eq!(fake.pushes(), 2);
        assert_eq!(fake.executed().len(), 2);
    }

    #[test]
    fn test_abort_forces_fail() {
        let temp_dir = TempDir::new().unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let ctx = PhaseContext::new(
            RunConfig::new(temp_dir.path()).with_event_bus(bus),
            StepKind::Execute,
            temp_dir.path().join("execute"),
        );
        let fake = FakeGuest::new("vm").with_responder(|_, options| {
            fs::write(marker_in(options, "TESTRUN_ABORT_REQUEST"), "").unwrap();
            Ok(CommandOutput::default())
        });
        let test = TestDefinition::new("/aborts", "./test.sh");

        let report = TestInvocation::new(&ctx, "default-0", &test, Arc::new(fake.clone())).go().unwrap();

        assert!(report.aborted);
        assert_eq!(report.results[0].result, ResultOutcome::Fail);
        assert!(report.results[0].note.contains(&"aborted".to_string()));
        assert_eq!(fake.pulls(), 1);

        let finished: Vec<_> = EventBus::drain(&mut rx)
            .into_iter()
            .filter_map(|envelope| match envelope.event {
                Event::TestFinished { outcome, .. } => Some(outcome),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec!["fail"]);
    }

    #[test]
    fn test_reported_subresults_are_reduced() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let fake = FakeGuest::new("vm").with_responder(|_, options| {
            let lines = [
                r#"{"name": "/setup", "result": "pass"}"#,
                r#"{"name": "/check", "result": "warn", "note": ["slow"]}"#,
            ];
            fs::write(marker_in(options, "TESTRUN_REPORT_RESULTS"), lines.join("\n")).unwrap();
            Ok(CommandOutput::default())
        });
        let test = TestDefinition::new("/reports", "./test.sh");

        let report = TestInvocation::new(&ctx, "default-0", &test, Arc::new(fake)).go().unwrap();
        let result = &report.results[0];
        assert_eq!(result.result, ResultOutcome::Warn);
        assert_eq!(result.subresult.len(), 2);
        assert!(!result.note.iter().any(|note| note.starts_with("original test result")));
    }

    #[test]
    fn test_restraint_results_are_standalone() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let fake = FakeGuest::new("vm").with_responder(|_, options| {
            let lines = [
                r#"{"name": "/first", "result": "pass"}"#,
                r#"{"name": "/second", "result": "fail"}"#,
            ];
            fs::write(marker_in(options, "TESTRUN_REPORT_RESULTS"), lines.join("\n")).unwrap();
            Ok(CommandOutput::default())
        });
        let test = TestDefinition::new("/suite", "./test.sh").with_result(ResultInterpret::Restraint);

        let report = TestInvocation::new(&ctx, "default-0", &test, Arc::new(fake)).go().unwrap();
        let names: Vec<_> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["/suite/first", "/suite/second"]);
        assert_eq!(report.results[1].result, ResultOutcome::Fail);
    }

    /// Guest whose kernel log gains a BUG line after the first `dmesg` call.
    fn crashing_guest() -> FakeGuest {
        let dmesg_calls = Arc::new(AtomicUsize::new(0));
        FakeGuest::new("vm").with_responder(move |command, _| {
            let stdout = match command {
                "dmesg" if dmesg_calls.fetch_add(1, Ordering::SeqCst) > 0 => {
                    "boot\nkernel BUG: at mm/slub.c\n".to_string()
                }
                "dmesg" => "boot\n".to_string(),
                _ => String::new(),
            };
            Ok(CommandOutput {
                stdout,
                stderr: String::new(),
            })
        })
    }

    #[test]
    fn test_failing_check_fails_test() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);

        let test = TestDefinition::new("/crash", "./test.sh").with_check(CheckSpec::new("dmesg"));
        let report = TestInvocation::new(&ctx, "default-0", &test, Arc::new(crashing_guest())).go().unwrap();
        let result = &report.results[0];
        assert_eq!(result.result, ResultOutcome::Fail);
        assert_eq!(result.check.len(), 2);
        assert!(result.note.contains(&"check 'dmesg' failed".to_string()));
        assert!(result.note.contains(&"original test result: pass".to_string()));
    }

    #[test]
    fn test_informational_check_keeps_pass() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);

        let test = TestDefinition::new("/crash-info", "./test.sh")
            .with_check(CheckSpec::new("dmesg").with_result(CheckResultInterpret::Info));
        let report = TestInvocation::new(&ctx, "default-0", &test, Arc::new(crashing_guest())).go().unwrap();
        let result = &report.results[0];
        assert_eq!(result.result, ResultOutcome::Pass);
        assert_eq!(result.check[1].result, ResultOutcome::Fail);
        assert!(result.note.contains(&"check 'dmesg' is informational".to_string()));
    }

    #[test]
    fn test_exit_request_is_not_a_result() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let test = TestDefinition::new("/exits", "./test.sh");
        let fake = FakeGuest::new("vm");
        let mut invocation = TestInvocation::new(&ctx, "default-0", &test, Arc::new(fake.clone()));

        let error = invocation
            .failure_results(RunExit::new("plan finished early").into())
            .unwrap_err();
        assert!(matches!(error, OrchestratorError::Exit(ref exit) if exit.reason == "plan finished early"));
        assert!(invocation.exceptions.is_empty());
        assert_eq!(fake.pulls(), 0);

        let results = invocation
            .failure_results(OrchestratorError::specification("broken"))
            .unwrap();
        assert_eq!(results[0].result, ResultOutcome::Error);
        assert_eq!(invocation.exceptions.len(), 1);
        assert_eq!(fake.pulls(), 1);
    }

    #[test]
    fn test_unknown_framework_is_error_result() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(&temp_dir);
        let mut test = TestDefinition::new("/beakerlib", "./runtest.sh");
        test.framework = "beakerlib".to_string();

        let fake = FakeGuest::new("vm");
        let report = TestInvocation::new(&ctx, "default-0", &test, Arc::new(fake.clone())).go().unwrap();
        assert_eq!(report.results[0].result, ResultOutcome::Error);
        assert!(fake.executed().is_empty());
    }
}
