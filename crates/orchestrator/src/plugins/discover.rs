//! Discover tests declared inline in the plan.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use testrun_core::TestDefinition;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::execute::{check_for, framework_for};
use crate::phase::{
    parse_phase_data, Configurable, Phase, PhaseCommon, PhaseContext, PhaseData, PhaseOutput,
    RunsStandalone, StepKind,
};

#[derive(Debug, Deserialize)]
struct DiscoverShellData {
    #[serde(flatten)]
    common: PhaseCommon,
    #[serde(default)]
    tests: Vec<Value>,
}

pub struct DiscoverShell {
    common: PhaseCommon,
    tests: Vec<Value>,
}

impl DiscoverShell {
    pub fn from_data(step: StepKind, data: &PhaseData) -> Result<Phase> {
        let data: DiscoverShellData = parse_phase_data(step, data)?;
        Ok(Phase::Standalone(Arc::new(Self {
            common: data.common,
            tests: data.tests,
        })))
    }

    fn parse_test(&self, raw: &Value, default_duration: &str) -> Result<TestDefinition> {
        let mut raw = raw.clone();
        if let Value::Object(fields) = &mut raw {
            fields
                .entry("duration")
                .or_insert_with(|| Value::from(default_duration));
        }

        let test: TestDefinition = serde_json::from_value(raw).map_err(|e| {
            OrchestratorError::specification(format!(
                "Invalid test in discover phase '{}': {}",
                self.name(),
                e
            ))
        })?;
        test.validate()?;
        framework_for(&test.framework)?;
        for check in test.enabled_checks() {
            check_for(&check.how)?;
        }
        Ok(test)
    }
}

impl Configurable for DiscoverShell {
    fn common(&self) -> &PhaseCommon {
        &self.common
    }
}

impl RunsStandalone for DiscoverShell {
    fn go(&self, ctx: &PhaseContext) -> Result<PhaseOutput> {
        let mut names = BTreeSet::new();
        let mut tests = Vec::with_capacity(self.tests.len());

        for raw in &self.tests {
            let test = self.parse_test(raw, &ctx.config.default_test_duration)?;
            if !names.insert(test.name.clone()) {
                return Err(OrchestratorError::specification(format!(
                    "Duplicate test '{}' in discover phase '{}'",
                    test.name,
                    self.name()
                )));
            }
            debug!(phase = %self.name(), test = %test.name, "Discovered test");
            tests.push(test);
        }

        info!(phase = %self.name(), tests = tests.len(), "Discovered tests");
        Ok(PhaseOutput::Tests(tests))
    }
}
