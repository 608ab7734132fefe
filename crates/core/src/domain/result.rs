//! Result model and the interpretation engine.
//!
//! Every result keeps an immutable `original_result` snapshot taken when it
//! is constructed. Interpretation only ever appends to `note`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::interpret::{CheckResultInterpret, ResultInterpret};
use crate::domain::outcome::ResultOutcome;
use crate::error::{CoreError, Result};

/// When a check was invoked relative to the test.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CheckEvent {
    BeforeTest,
    AfterTest,
}

impl CheckEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeTest => "before-test",
            Self::AfterTest => "after-test",
        }
    }
}

/// Outcome of one check invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub result: ResultOutcome,
    pub event: CheckEvent,
    #[serde(default)]
    pub note: Vec<String>,
    #[serde(default)]
    pub log: Vec<PathBuf>,
}

/// Check results attached to a sub-result share the shape of test-level ones.
pub type SubCheckResult = CheckResult;

impl CheckResult {
    pub fn new(name: impl Into<String>, result: ResultOutcome, event: CheckEvent) -> Self {
        Self {
            name: name.into(),
            result,
            event,
            note: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note.push(note.into());
        self
    }

    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log.push(path.into());
        self
    }
}

/// Identification of the guest a result was produced on.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultGuestData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl ResultGuestData {
    pub fn new(name: impl Into<String>, role: Option<String>) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }
}

/// A result reported from inside a test run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubResult {
    pub name: String,
    pub result: ResultOutcome,
    original_result: ResultOutcome,
    #[serde(default)]
    pub note: Vec<String>,
    #[serde(default)]
    pub log: Vec<PathBuf>,
    #[serde(default)]
    pub check: Vec<SubCheckResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl SubResult {
    pub fn new(name: impl Into<String>, result: ResultOutcome) -> Self {
        Self {
            name: name.into(),
            result,
            original_result: result,
            note: Vec::new(),
            log: Vec::new(),
            check: Vec::new(),
            end_time: None,
        }
    }

    pub fn original_result(&self) -> ResultOutcome {
        self.original_result
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note.push(note.into());
        self
    }

    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log.push(path.into());
        self
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }
}

/// Result of a prepare or finish phase on one guest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseResult {
    pub name: String,
    pub result: ResultOutcome,
    original_result: ResultOutcome,
    #[serde(default)]
    pub note: Vec<String>,
    #[serde(default)]
    pub log: Vec<PathBuf>,
    #[serde(default)]
    pub guest: ResultGuestData,
}

impl PhaseResult {
    pub fn new(name: impl Into<String>, result: ResultOutcome, guest: ResultGuestData) -> Self {
        Self {
            name: name.into(),
            result,
            original_result: result,
            note: Vec::new(),
            log: Vec::new(),
            guest,
        }
    }

    pub fn original_result(&self) -> ResultOutcome {
        self.original_result
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note.push(note.into());
        self
    }

    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log.push(path.into());
        self
    }
}

/// Final, reportable result of one test run on one guest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResult {
    pub name: String,
    #[serde(default)]
    pub serial_number: u32,
    pub result: ResultOutcome,
    original_result: ResultOutcome,
    #[serde(default)]
    pub note: Vec<String>,
    #[serde(default)]
    pub log: Vec<PathBuf>,
    #[serde(default)]
    pub check: Vec<CheckResult>,
    #[serde(default)]
    pub subresult: Vec<SubResult>,
    #[serde(default)]
    pub guest: ResultGuestData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

impl TestResult {
    pub fn new(name: impl Into<String>, result: ResultOutcome) -> Self {
        Self {
            name: name.into(),
            serial_number: 0,
            result,
            original_result: result,
            note: Vec::new(),
            log: Vec::new(),
            check: Vec::new(),
            subresult: Vec::new(),
            guest: ResultGuestData::default(),
            data_path: None,
            start_time: None,
            end_time: None,
            duration: None,
        }
    }

    /// The outcome as it was when the result was constructed.
    pub fn original_result(&self) -> ResultOutcome {
        self.original_result
    }

    pub fn with_serial_number(mut self, serial_number: u32) -> Self {
        self.serial_number = serial_number;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note.push(note.into());
        self
    }

    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log.push(path.into());
        self
    }

    pub fn with_checks(mut self, checks: Vec<CheckResult>) -> Self {
        self.check = checks;
        self
    }

    pub fn with_subresults(mut self, subresults: Vec<SubResult>) -> Self {
        self.subresult = subresults;
        self
    }

    pub fn with_guest(mut self, guest: ResultGuestData) -> Self {
        self.guest = guest;
        self
    }

    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    /// Record start and end of the run along with an `hh:mm:ss` duration.
    pub fn with_timing(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let seconds = (end - start).num_seconds().max(0);
        self.duration = Some(format!(
            "{:02}:{:02}:{:02}",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        ));
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    /// Turn the raw outcome into the reported one.
    ///
    /// `interpret_checks` must hold a policy for every check name present in
    /// the result, otherwise interpretation fails.
    pub fn interpret_result(
        mut self,
        interpret: ResultInterpret,
        interpret_checks: &BTreeMap<String, CheckResultInterpret>,
    ) -> Result<Self> {
        if interpret == ResultInterpret::Custom {
            return Ok(self);
        }

        let mut contributions = vec![self.result];
        for name in distinct_check_names(&self.check) {
            let policy = interpret_checks
                .get(name)
                .copied()
                .ok_or_else(|| CoreError::MissingCheckInterpret(name.to_string()))?;

            let observed = ResultOutcome::reduce(
                self.check
                    .iter()
                    .filter(|check| check.name == name)
                    .map(|check| check.result),
            )?;

            let (contribution, note) = interpret_check(name, observed, policy);
            if let Some(note) = note {
                self.note.push(note);
            }
            contributions.push(contribution);
        }

        self.result = ResultOutcome::reduce(contributions)?;

        if let Some(forced) = interpret.forced_outcome() {
            self.result = forced;
            self.note.push(format!("test result overridden: {}", forced));
        } else if interpret == ResultInterpret::Xfail {
            match self.result {
                ResultOutcome::Pass => {
                    self.result = ResultOutcome::Fail;
                    self.note.push("test was expected to fail".to_string());
                }
                ResultOutcome::Fail => {
                    self.result = ResultOutcome::Pass;
                    self.note.push("test failed as expected".to_string());
                }
                _ => {}
            }
        }

        if self.result != self.original_result {
            self.note
                .push(format!("original test result: {}", self.original_result));
        }

        Ok(self)
    }
}

/// Check names in order of first appearance.
fn distinct_check_names(checks: &[CheckResult]) -> Vec<&str> {
    let mut names: Vec<&str> = Vec::new();
    for check in checks {
        if !names.contains(&check.name.as_str()) {
            names.push(&check.name);
        }
    }
    names
}

fn interpret_check(
    name: &str,
    observed: ResultOutcome,
    policy: CheckResultInterpret,
) -> (ResultOutcome, Option<String>) {
    match policy {
        CheckResultInterpret::Respect => {
            let note = (observed == ResultOutcome::Fail).then(|| format!("check '{}' failed", name));
            (observed, note)
        }
        CheckResultInterpret::Info => (
            ResultOutcome::Info,
            Some(format!("check '{}' is informational", name)),
        ),
        CheckResultInterpret::Xfail => match observed {
            ResultOutcome::Fail => (
                ResultOutcome::Pass,
                Some(format!("check '{}' failed as expected", name)),
            ),
            ResultOutcome::Pass => (
                ResultOutcome::Fail,
                Some(format!("check '{}' did not fail as expected", name)),
            ),
            other => (other, None),
        },
    }
}
