//! Execute step: run discovered tests on every guest.

mod check;
mod framework;
mod invocation;

use std::collections::BTreeSet;
use std::sync::Arc;

use events::Event;
use serde::Deserialize;
use testrun_core::ResultOutcome;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::guest::Guest;
use crate::phase::{
    parse_phase_data, Configurable, Phase, PhaseCommon, PhaseContext, PhaseData, PhaseOutput,
    RunsPerGuest, StepKind,
};

pub use check::{check_for, Check, DmesgCheck};
pub use framework::{failure_lines, framework_for, ShellFramework, TestFramework};
pub use invocation::{
    InvocationReport, RebootRequest, ReportedResult, TestInvocation, ABORT_FILE,
    REBOOT_REQUEST_FILE, REPORT_RESULTS_FILE, RESTART_REQUEST_FILE,
};

#[derive(Debug, Deserialize)]
struct ExecuteInternalData {
    #[serde(flatten)]
    common: PhaseCommon,
}

/// Runs the tests one after another on each guest.
pub struct ExecuteInternal {
    common: PhaseCommon,
}

impl ExecuteInternal {
    pub fn from_data(step: StepKind, data: &PhaseData) -> Result<Phase> {
        let data: ExecuteInternalData = parse_phase_data(step, data)?;
        Ok(Phase::PerGuest(Arc::new(Self {
            common: data.common,
        })))
    }
}

impl Configurable for ExecuteInternal {
    fn common(&self) -> &PhaseCommon {
        &self.common
    }
}

impl RunsPerGuest for ExecuteInternal {
    /// Tests already present in `ctx.results` for this guest are skipped, so
    /// an interrupted run picks up where it stopped.
    ///
    /// The interrupt flag is polled before every test. Once it is set no new
    /// test starts and the results collected so far are returned.
    fn go(&self, ctx: &PhaseContext, guest: &Arc<dyn Guest>) -> Result<PhaseOutput> {
        let completed: BTreeSet<u32> = ctx
            .results
            .iter()
            .filter(|result| result.guest.name == guest.name())
            .map(|result| result.serial_number)
            .collect();

        let mut results = Vec::new();
        for test in ctx.tests.iter() {
            if !test.enabled || !test.runs_on(guest.name(), guest.role()) {
                continue;
            }
            if completed.contains(&test.serial_number) {
                debug!(test = %test.name, guest = %guest.name(), "Test already done");
                continue;
            }
            if ctx.config.is_interrupted() {
                warn!(guest = %guest.name(), "Interrupted, not starting further tests");
                ctx.config.emit(Event::RunInterrupted {
                    guest: guest.name().to_string(),
                });
                break;
            }

            let report = TestInvocation::new(ctx, self.name(), test, Arc::clone(guest)).go()?;
            let failed = report
                .results
                .iter()
                .any(|result| matches!(result.result, ResultOutcome::Fail | ResultOutcome::Error));
            results.extend(report.results);

            if report.aborted {
                warn!(test = %test.name, guest = %guest.name(), "Test aborted the run");
                ctx.config.emit(Event::RunAborted {
                    test: test.name.clone(),
                    guest: guest.name().to_string(),
                });
                break;
            }
            if failed && ctx.config.exit_first {
                info!(test = %test.name, guest = %guest.name(), "Stopping after first failure");
                break;
            }
        }

        info!(phase = %self.name(), guest = %guest.name(), results = results.len(), "Execution finished");
        Ok(PhaseOutput::TestResults(results))
    }
}
