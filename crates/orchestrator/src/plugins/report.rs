use std::sync::Arc;

use serde::Deserialize;
use testrun_core::{outcome_totals, ResultOutcome, TestResult};
use tracing::{info, warn};

use crate::error::Result;
use crate::phase::{
    parse_phase_data, Configurable, Phase, PhaseCommon, PhaseContext, PhaseData, PhaseOutput,
    RunsStandalone, StepKind,
};

#[derive(Debug, Deserialize)]
struct ReportDisplayData {
    #[serde(flatten)]
    common: PhaseCommon,
    /// Also log notes of passing tests.
    #[serde(default)]
    verbose: bool,
}

/// Log every result and a summary line.
pub struct ReportDisplay {
    common: PhaseCommon,
    verbose: bool,
}

impl ReportDisplay {
    pub fn from_data(step: StepKind, data: &PhaseData) -> Result<Phase> {
        let data: ReportDisplayData = parse_phase_data(step, data)?;
        Ok(Phase::Standalone(Arc::new(Self {
            common: data.common,
            verbose: data.verbose,
        })))
    }

    fn show(&self, result: &TestResult) {
        let failed = matches!(result.result, ResultOutcome::Fail | ResultOutcome::Error);
        if failed {
            warn!(
                test = %result.name,
                serial_number = result.serial_number,
                guest = %result.guest.name,
                result = %result.result,
                "Test result"
            );
        } else {
            info!(
                test = %result.name,
                serial_number = result.serial_number,
                guest = %result.guest.name,
                result = %result.result,
                "Test result"
            );
        }

        if failed || self.verbose {
            for note in &result.note {
                info!(test = %result.name, note = %note, "Note");
            }
        }
    }
}

/// Summary such as `2 pass, 1 fail`, empty outcomes left out.
pub(crate) fn summary(results: &[TestResult]) -> String {
    let totals = outcome_totals(results);
    let parts: Vec<String> = ResultOutcome::ALL
        .iter()
        .filter_map(|outcome| {
            let count = totals.get(outcome.as_str()).copied().unwrap_or(0);
            (count > 0).then(|| format!("{} {}", count, outcome))
        })
        .collect();

    if parts.is_empty() {
        "no results".to_string()
    } else {
        parts.join(", ")
    }
}

impl Configurable for ReportDisplay {
    fn common(&self) -> &PhaseCommon {
        &self.common
    }

    fn always_force(&self) -> bool {
        true
    }
}

impl RunsStandalone for ReportDisplay {
    fn go(&self, ctx: &PhaseContext) -> Result<PhaseOutput> {
        for result in ctx.results.iter() {
            self.show(result);
        }
        info!(phase = %self.name(), summary = %summary(&ctx.results), "Summary");
        Ok(PhaseOutput::None)
    }
}
