//! A plan run: the six steps in order, each fed the outputs of the previous ones.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use testrun_core::{PhaseResult, ResultOutcome, TestDefinition, TestResult};
use tracing::{info, warn};

use crate::config::{PlanConfig, RunConfig};
use crate::error::{OrchestratorError, Result};
use crate::files::{RESULTS_FILE, TESTS_FILE};
use crate::guest::Guest;
use crate::phase::{PhaseContext, PhaseInvocation, PhaseOutput, StepKind};
use crate::registry::PluginRegistry;
use crate::step::Step;

pub struct Plan {
    config: PlanConfig,
    run: RunConfig,
    registry: PluginRegistry,
    invocations: BTreeMap<StepKind, Vec<PhaseInvocation>>,
}

impl Plan {
    pub fn new(config: PlanConfig, run: RunConfig) -> Self {
        Self {
            config,
            run,
            registry: PluginRegistry::with_builtins(),
            invocations: BTreeMap::new(),
        }
    }

    pub fn with_registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Command line phase changes for one step, applied in the given order.
    pub fn with_invocations(mut self, step: StepKind, invocations: Vec<PhaseInvocation>) -> Self {
        self.invocations.entry(step).or_default().extend(invocations);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn workdir(&self) -> PathBuf {
        self.run.workdir.join(self.config.safe_name())
    }

    /// Run discover, provision, prepare, execute, report and finish.
    ///
    /// Steps already done in this workdir are skipped and their stored
    /// outputs reused. An interrupted execute step saves what it collected
    /// and returns [`OrchestratorError::Interrupted`]; the next run resumes it.
    pub fn go(&self) -> Result<Vec<TestResult>> {
        info!(plan = %self.config.name, workdir = %self.workdir().display(), "Running plan");

        let tests = self.discover()?;
        let guests = self.provision()?;
        self.prepare(&guests)?;
        let results = self.execute(&tests, &guests)?;
        self.report(&results, &guests)?;
        self.finish(&guests)?;

        info!(plan = %self.config.name, results = results.len(), "Plan finished");
        Ok(results)
    }

    fn step(&self, kind: StepKind) -> Step {
        Step::new(
            kind,
            self.workdir().join(kind.as_str()),
            self.config.phases(kind).to_vec(),
        )
        .with_invocations(self.invocations.get(&kind).cloned().unwrap_or_default())
    }

    fn context(&self, step: &Step) -> PhaseContext {
        PhaseContext::new(self.run.clone(), step.kind(), step.workdir().root())
            .with_environment(self.config.environment.clone())
    }

    fn discover(&self) -> Result<Vec<TestDefinition>> {
        let mut step = self.step(StepKind::Discover);
        step.wake(&self.registry, &self.run)?;

        if step.is_done() {
            return step.workdir().read_json(TESTS_FILE)?.ok_or_else(|| {
                OrchestratorError::specification(format!(
                    "Step 'discover' is done but '{}' is missing, run again with --force",
                    TESTS_FILE
                ))
            });
        }

        let outputs = step.go(&self.registry, self.context(&step), &[])?;
        let mut tests: Vec<TestDefinition> = outputs
            .into_iter()
            .filter_map(|output| match output {
                PhaseOutput::Tests(tests) => Some(tests),
                _ => None,
            })
            .flatten()
            .collect();
        for (index, test) in tests.iter_mut().enumerate() {
            test.serial_number = index as u32 + 1;
        }

        step.workdir().write_json(TESTS_FILE, &tests)?;
        step.finish(&self.run)?;
        info!(tests = tests.len(), "Discovered tests");
        Ok(tests)
    }

    fn provision(&self) -> Result<Vec<Arc<dyn Guest>>> {
        let mut step = self.step(StepKind::Provision);
        step.wake(&self.registry, &self.run)?;

        if step.is_done() {
            return Err(OrchestratorError::specification(
                "Step 'provision' is done but guests are not stored, its phases must always run",
            ));
        }

        let outputs = step.go(&self.registry, self.context(&step), &[])?;
        let guests: Vec<Arc<dyn Guest>> = outputs
            .into_iter()
            .filter_map(|output| match output {
                PhaseOutput::Guests(guests) => Some(guests),
                _ => None,
            })
            .flatten()
            .collect();
        if guests.is_empty() {
            return Err(OrchestratorError::specification("No guests were provisioned"));
        }

        step.finish(&self.run)?;
        info!(guests = guests.len(), "Provisioned guests");
        Ok(guests)
    }

    fn prepare(&self, guests: &[Arc<dyn Guest>]) -> Result<()> {
        let results = self.run_guest_step(StepKind::Prepare, guests)?;
        let failed: Vec<&PhaseResult> = results.iter().filter(|r| is_failure(r.result)).collect();
        match failed.first() {
            None => Ok(()),
            Some(first) => Err(OrchestratorError::phase_failed(
                &first.name,
                format!(
                    "{} on guest '{}'",
                    first.note.first().map(String::as_str).unwrap_or("failed"),
                    first.guest.name
                ),
            )),
        }
    }

    fn execute(
        &self,
        tests: &[TestDefinition],
        guests: &[Arc<dyn Guest>],
    ) -> Result<Vec<TestResult>> {
        let mut step = self.step(StepKind::Execute);
        step.wake(&self.registry, &self.run)?;

        let stored: Vec<TestResult> = step.workdir().read_json(RESULTS_FILE)?.unwrap_or_default();
        if step.is_done() {
            return Ok(stored);
        }
        let previous = if step.resumed() {
            info!(results = stored.len(), "Resuming with results of the interrupted run");
            stored
        } else {
            Vec::new()
        };

        let ctx = self
            .context(&step)
            .with_tests(tests.to_vec())
            .with_results(previous.clone());
        let outputs = step.go(&self.registry, ctx, guests)?;

        let mut results = previous;
        for output in outputs {
            if let PhaseOutput::TestResults(found) = output {
                results.extend(found);
            }
        }
        results.sort_by(|a, b| {
            (a.serial_number, &a.guest.name).cmp(&(b.serial_number, &b.guest.name))
        });
        step.workdir().write_json(RESULTS_FILE, &results)?;

        if self.run.is_interrupted() {
            warn!(results = results.len(), "Execution interrupted, step stays unfinished");
            return Err(OrchestratorError::Interrupted);
        }

        step.finish(&self.run)?;
        Ok(results)
    }

    fn report(&self, results: &[TestResult], guests: &[Arc<dyn Guest>]) -> Result<()> {
        let mut step = self.step(StepKind::Report);
        step.wake(&self.registry, &self.run)?;
        if step.is_done() {
            return Ok(());
        }

        let ctx = self.context(&step).with_results(results.to_vec());
        step.go(&self.registry, ctx, guests)?;
        step.finish(&self.run)
    }

    fn finish(&self, guests: &[Arc<dyn Guest>]) -> Result<()> {
        let results = self.run_guest_step(StepKind::Finish, guests)?;
        for result in results.iter().filter(|r| is_failure(r.result)) {
            warn!(phase = %result.name, guest = %result.guest.name, result = %result.result, "Finish phase failed");
        }
        Ok(())
    }

    /// Prepare and finish: phase results are stored, the step is finished
    /// only when none of them failed.
    fn run_guest_step(&self, kind: StepKind, guests: &[Arc<dyn Guest>]) -> Result<Vec<PhaseResult>> {
        let mut step = self.step(kind);
        step.wake(&self.registry, &self.run)?;
        if step.is_done() {
            return Ok(step.workdir().read_json(RESULTS_FILE)?.unwrap_or_default());
        }

        let outputs = step.go(&self.registry, self.context(&step), guests)?;
        let results: Vec<PhaseResult> = outputs
            .into_iter()
            .filter_map(|output| match output {
                PhaseOutput::PhaseResults(results) => Some(results),
                _ => None,
            })
            .flatten()
            .collect();
        step.workdir().write_json(RESULTS_FILE, &results)?;

        if kind == StepKind::Prepare && results.iter().any(|r| is_failure(r.result)) {
            return Ok(results);
        }
        step.finish(&self.run)?;
        Ok(results)
    }
}

fn is_failure(outcome: ResultOutcome) -> bool {
    matches!(outcome, ResultOutcome::Fail | ResultOutcome::Error)
}
