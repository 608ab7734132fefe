//! Turning a finished invocation into results.

use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use testrun_core::{ResultInterpret, ResultOutcome, SubResult, TestResult};
use tracing::{debug, warn};

use super::invocation::{ReportedResult, TestInvocation};
use crate::error::{OrchestratorError, Result};
use crate::files::{append_failures, Workdir, RESULTS_FILE};

const OUTPUT_FILE: &str = "output.txt";

pub trait TestFramework: Send + Sync {
    fn extract_results(
        &self,
        invocation: &TestInvocation<'_>,
        reported: &[ReportedResult],
    ) -> Result<Vec<TestResult>>;
}

pub fn framework_for(name: &str) -> Result<Box<dyn TestFramework>> {
    match name {
        ShellFramework::NAME => Ok(Box::new(ShellFramework)),
        other => Err(OrchestratorError::specification(format!(
            "Unsupported test framework '{}'",
            other
        ))),
    }
}

static FAILURE_LINE: OnceLock<Option<Regex>> = OnceLock::new();

fn failure_line() -> Option<&'static Regex> {
    FAILURE_LINE
        .get_or_init(|| Regex::new(r"(?i)error|fail(ed|ure)?").ok())
        .as_ref()
}

/// Output lines worth keeping in the failure excerpt.
pub fn failure_lines(output: &str) -> Vec<String> {
    let Some(pattern) = failure_line() else {
        return Vec::new();
    };
    output
        .lines()
        .filter(|line| pattern.is_match(line))
        .map(str::to_string)
        .collect()
}

/// `parent` joined with a reported name, `/` alone meaning the parent itself.
fn child_name(parent: &str, child: &str) -> String {
    let child = child.trim_matches('/');
    if child.is_empty() {
        parent.to_string()
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), child)
    }
}

/// Plain shell commands: the return code decides.
pub struct ShellFramework;

impl ShellFramework {
    pub const NAME: &'static str = "shell";

    fn outcome(invocation: &TestInvocation<'_>) -> (ResultOutcome, Option<String>) {
        if invocation.timed_out {
            return (ResultOutcome::Error, Some("timeout".to_string()));
        }
        match invocation.return_code {
            Some(0) => (ResultOutcome::Pass, None),
            Some(1) => (ResultOutcome::Fail, None),
            Some(code) => (
                ResultOutcome::Error,
                Some(format!("unexpected return code {}", code)),
            ),
            None => (ResultOutcome::Error, Some("no return code".to_string())),
        }
    }

    fn save_output(invocation: &TestInvocation<'_>) -> Result<PathBuf> {
        fs::create_dir_all(invocation.path())?;
        let log = invocation.path().join(OUTPUT_FILE);
        fs::write(&log, &invocation.output)?;
        Ok(log)
    }

    /// Results the test wrote itself to `data/results.json`.
    fn custom_results(invocation: &TestInvocation<'_>, log: PathBuf) -> Result<Vec<TestResult>> {
        let data = Workdir::new(invocation.data_path());
        let Some(reported) = data.read_json::<Vec<ReportedResult>>(RESULTS_FILE)? else {
            warn!(test = %invocation.test.name, "Custom results file not found");
            return Ok(vec![invocation
                .new_result(&invocation.test.name, ResultOutcome::Error)
                .with_note(format!("custom results file '{}' not found", RESULTS_FILE))
                .with_log(log)]);
        };

        Ok(reported
            .into_iter()
            .map(|report| Self::standalone_result(invocation, report))
            .collect())
    }

    fn standalone_result(invocation: &TestInvocation<'_>, report: ReportedResult) -> TestResult {
        let mut result =
            invocation.new_result(child_name(&invocation.test.name, &report.name), report.result);
        result.note.extend(report.note);
        result.log.extend(report.log);
        result
    }
}

impl TestFramework for ShellFramework {
    fn extract_results(
        &self,
        invocation: &TestInvocation<'_>,
        reported: &[ReportedResult],
    ) -> Result<Vec<TestResult>> {
        let log = Self::save_output(invocation)?;

        if invocation.test.result == ResultInterpret::Custom {
            return Self::custom_results(invocation, log);
        }

        let (mut outcome, note) = Self::outcome(invocation);

        if invocation.test.result == ResultInterpret::Restraint && !reported.is_empty() {
            debug!(test = %invocation.test.name, reports = reported.len(), "Splitting reported results");
            let mut results: Vec<TestResult> = reported
                .iter()
                .cloned()
                .map(|report| Self::standalone_result(invocation, report).with_log(log.clone()))
                .collect();
            if let Some(first) = results.first_mut() {
                first.check = invocation.check_results.clone();
            }
            return Ok(results);
        }

        if matches!(outcome, ResultOutcome::Pass | ResultOutcome::Fail) {
            let observed = std::iter::once(outcome).chain(reported.iter().map(|r| r.result));
            if let Some(worst) = ResultOutcome::reduce_subresults(observed) {
                outcome = worst;
            }
        }

        if matches!(outcome, ResultOutcome::Fail | ResultOutcome::Error) {
            let failures = failure_lines(&invocation.output);
            append_failures(&Workdir::new(invocation.path()), &failures)?;
        }

        let subresults = reported
            .iter()
            .map(|report| {
                let mut subresult = SubResult::new(&report.name, report.result);
                subresult.note.extend(report.note.iter().cloned());
                subresult.log.extend(report.log.iter().cloned());
                subresult
            })
            .collect();

        let mut result = invocation
            .new_result(&invocation.test.name, outcome)
            .with_log(log)
            .with_checks(invocation.check_results.clone())
            .with_subresults(subresults);
        if let Some(note) = note {
            result = result.with_note(note);
        }
        Ok(vec![result])
    }
}
