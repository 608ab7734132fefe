use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::outcome::ResultOutcome;
use crate::domain::result::TestResult;

/// Process exit codes summarizing a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    Success,
    Fail,
    Error,
    NoResultsFound,
    AllTestsSkipped,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Fail => 1,
            Self::Error => 2,
            Self::NoResultsFound => 3,
            Self::AllTestsSkipped => 4,
        }
    }
}

/// Count results per outcome.
pub fn outcome_totals(results: &[TestResult]) -> BTreeMap<&'static str, usize> {
    let mut totals = BTreeMap::new();
    for result in results {
        *totals.entry(result.result.as_str()).or_insert(0) += 1;
    }
    totals
}

/// Map a final result list to the run's exit code.
///
/// Checked in this order: no results, any `error`/`pending`, any
/// `fail`/`warn`, all `skip`, otherwise success.
pub fn results_to_exit_code(results: &[TestResult]) -> ExitCode {
    if results.is_empty() {
        return ExitCode::NoResultsFound;
    }

    let any = |outcomes: &[ResultOutcome]| results.iter().any(|r| outcomes.contains(&r.result));

    if any(&[ResultOutcome::Error, ResultOutcome::Pending]) {
        ExitCode::Error
    } else if any(&[ResultOutcome::Fail, ResultOutcome::Warn]) {
        ExitCode::Fail
    } else if results.iter().all(|r| r.result == ResultOutcome::Skip) {
        ExitCode::AllTestsSkipped
    } else {
        ExitCode::Success
    }
}
