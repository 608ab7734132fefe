//! Shell scripts run on guests, used by prepare and finish.

use std::fs;
use std::sync::Arc;

use serde::Deserialize;
use testrun_core::{PhaseResult, ResultOutcome};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::guest::{ExecuteOptions, Guest, GuestError};
use crate::phase::{
    one_or_many, parse_phase_data, Configurable, Phase, PhaseCommon, PhaseContext, PhaseData,
    PhaseOutput, RunsPerGuest, StepKind,
};

const OUTPUT_FILE: &str = "output.txt";

#[derive(Debug, Deserialize)]
struct ShellScriptData {
    #[serde(flatten)]
    common: PhaseCommon,
    #[serde(deserialize_with = "one_or_many")]
    script: Vec<String>,
}

pub struct ShellScript {
    common: PhaseCommon,
    script: Vec<String>,
}

impl ShellScript {
    pub fn from_data(step: StepKind, data: &PhaseData) -> Result<Phase> {
        let data: ShellScriptData = parse_phase_data(step, data)?;
        Ok(Phase::PerGuest(Arc::new(Self {
            common: data.common,
            script: data.script,
        })))
    }
}

impl Configurable for ShellScript {
    fn common(&self) -> &PhaseCommon {
        &self.common
    }
}

impl RunsPerGuest for ShellScript {
    /// Scripts run in order and the first failing one ends the phase with a
    /// `fail` result for the guest.
    fn go(&self, ctx: &PhaseContext, guest: &Arc<dyn Guest>) -> Result<PhaseOutput> {
        let logdir = ctx.phase_workdir(self.name()).join(guest.name());
        fs::create_dir_all(&logdir)?;
        let log = logdir.join(OUTPUT_FILE);

        let options = ExecuteOptions::new().with_env(ctx.environment.clone());
        let mut output = String::new();
        let mut failed = None;

        for script in &self.script {
            debug!(phase = %self.name(), guest = %guest.name(), script = %script, "Running script");
            match guest.execute(script, &options) {
                Ok(result) => {
                    output.push_str(&result.stdout);
                    output.push_str(&result.stderr);
                }
                Err(GuestError::Run(error)) => {
                    warn!(phase = %self.name(), guest = %guest.name(), error = %error, "Script failed");
                    output.push_str(&error.stdout);
                    output.push_str(&error.stderr);
                    failed = Some(error.to_string());
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        fs::write(&log, &output)?;

        let result = match failed {
            Some(reason) => PhaseResult::new(self.name(), ResultOutcome::Fail, guest.result_data())
                .with_note(reason),
            None => {
                info!(phase = %self.name(), guest = %guest.name(), "Scripts finished");
                PhaseResult::new(self.name(), ResultOutcome::Pass, guest.result_data())
            }
        };
        Ok(PhaseOutput::PhaseResults(vec![result.with_log(log)]))
    }
}
