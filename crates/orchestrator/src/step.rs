//! Steps: one stage of a plan owning an ordered list of phases.
//!
//! The raw phase data (plan file merged with command line invocations) is the
//! source of truth. Typed phases are materialized from it on first use and
//! cached until the data changes.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use events::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::config::RunConfig;
use crate::error::{OrchestratorError, Result};
use crate::files::{Workdir, STEP_FILE};
use crate::guest::{filter_guests, Guest};
use crate::phase::{
    phase_how, phase_name, InvocationAction, Phase, PhaseContext, PhaseData, PhaseInvocation,
    PhaseOutput, StepKind,
};
use crate::phase_queue::PhaseQueue;
use crate::registry::PluginRegistry;
use crate::state_machine::{StepStatus, StepStatusMachine};

/// What `step.json` holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct StepState {
    status: StepStatus,
    #[serde(default)]
    data: Vec<PhaseData>,
}

pub struct Step {
    kind: StepKind,
    workdir: Workdir,
    status: StepStatus,
    raw_data: Vec<PhaseData>,
    invocations: Vec<PhaseInvocation>,
    phases: Option<Vec<Phase>>,
    resumed: bool,
}

impl Step {
    pub fn new(kind: StepKind, workdir: impl Into<PathBuf>, data: Vec<PhaseData>) -> Self {
        Self {
            kind,
            workdir: Workdir::new(workdir),
            status: StepStatus::Unset,
            raw_data: data,
            invocations: Vec::new(),
            phases: None,
            resumed: false,
        }
    }

    pub fn with_invocations(mut self, invocations: Vec<PhaseInvocation>) -> Self {
        self.invocations = invocations;
        self
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn is_done(&self) -> bool {
        self.status == StepStatus::Done
    }

    /// Whether the step picks up a run that was interrupted earlier.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn raw_data(&self) -> &[PhaseData] {
        &self.raw_data
    }

    pub fn workdir(&self) -> &Workdir {
        &self.workdir
    }

    /// Merge stored state, plan data and invocations, then decide whether the
    /// step has to run.
    ///
    /// The step is (re)run when it never ran, when a previous run was
    /// interrupted, when forced by the run config or the command line, when
    /// a phase always forces its step, or when the phase data changed since
    /// the stored run. Entering `todo` cleans the workdir.
    pub fn wake(&mut self, registry: &PluginRegistry, config: &RunConfig) -> Result<()> {
        let stored: Option<StepState> = self.workdir.read_json(STEP_FILE)?;

        let mut data = std::mem::take(&mut self.raw_data);
        if data.is_empty() && self.kind.has_default_phase() {
            let mut phase = PhaseData::new();
            phase.insert("name".to_string(), Value::from("default-0"));
            phase.insert("how".to_string(), Value::from(self.kind.default_how()));
            data.push(phase);
        }
        self.raw_data = merge_phase_data(self.kind, data, &self.invocations)?;
        self.phases = None;

        let always_force = self.phases(registry)?.iter().any(Phase::always_force);

        let (stored_status, changed) = match &stored {
            Some(state) => (state.status, state.data != self.raw_data),
            None => (StepStatus::Unset, false),
        };
        self.status = stored_status;

        let forced = config.force || !self.invocations.is_empty() || always_force || changed;
        match (stored_status, forced) {
            (StepStatus::Done, false) => {
                info!(step = %self.kind, "Step is already done");
                Ok(())
            }
            (StepStatus::Todo, false) => {
                info!(step = %self.kind, "Resuming interrupted step");
                self.resumed = true;
                self.workdir.wipe(self.kind.preserved_files())?;
                self.set_status(StepStatus::Todo, config)
            }
            _ => {
                if changed {
                    info!(step = %self.kind, "Phase data changed since the last run");
                }
                self.workdir.wipe(self.kind.preserved_files())?;
                self.set_status(StepStatus::Todo, config)
            }
        }
    }

    /// Typed phases sorted by `order`, materialized on first use.
    pub fn phases(&mut self, registry: &PluginRegistry) -> Result<&[Phase]> {
        if self.phases.is_none() {
            let mut phases = self
                .raw_data
                .iter()
                .map(|data| registry.materialize(self.kind, data))
                .collect::<Result<Vec<_>>>()?;
            phases.sort_by_key(Phase::order);
            self.phases = Some(phases);
        }
        Ok(self.phases.as_deref().unwrap_or_default())
    }

    /// Run every phase. Per-guest phases get the guests matching their
    /// `where` filter.
    pub fn go(
        &mut self,
        registry: &PluginRegistry,
        ctx: PhaseContext,
        guests: &[Arc<dyn Guest>],
    ) -> Result<Vec<PhaseOutput>> {
        let phases = self.phases(registry)?.to_vec();
        info!(step = %self.kind, phases = phases.len(), "Running step");

        let config = ctx.config.clone();
        let mut queue = PhaseQueue::new(ctx);
        for phase in &phases {
            queue.enqueue(phase, &filter_guests(guests, phase.where_()))?;
        }

        let mut outputs = Vec::new();
        let mut first_error = None;
        for outcome in queue.run() {
            let phase = outcome.task_name.clone();
            let guest = outcome.guest_name().unwrap_or("").to_string();
            match outcome.into_result() {
                Ok(output) => outputs.push(output),
                Err(OrchestratorError::Exit(exit)) => return Err(OrchestratorError::Exit(exit)),
                Err(e) => {
                    error!(step = %self.kind, phase = %phase, guest = %guest, error = %e, "Phase failed");
                    config.emit(Event::Error {
                        message: e.to_string(),
                        context: Some(format!("{}/{}", self.kind, phase)),
                    });
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outputs),
        }
    }

    /// Mark the step done.
    pub fn finish(&mut self, config: &RunConfig) -> Result<()> {
        self.set_status(StepStatus::Done, config)
    }

    fn set_status(&mut self, to: StepStatus, config: &RunConfig) -> Result<()> {
        StepStatusMachine::validate_transition(&self.status, &to)?;

        let from = self.status;
        self.status = to;
        self.save()?;

        info!(step = %self.kind, from = %from, to = %to, "Step status changed");
        config.emit(Event::StepStatusChanged {
            step: self.kind.as_str().to_string(),
            from_status: from.as_str().to_string(),
            to_status: to.as_str().to_string(),
        });
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let state = StepState {
            status: self.status,
            data: self.raw_data.clone(),
        };
        self.workdir.write_json(STEP_FILE, &state)?;
        Ok(())
    }
}

impl StepKind {
    /// Steps that get a default phase when the plan leaves them empty.
    pub fn has_default_phase(&self) -> bool {
        matches!(
            self,
            StepKind::Provision | StepKind::Execute | StepKind::Report
        )
    }
}

/// Merge command line invocations into the raw phase data.
///
/// Inserts, and updates naming their target phase, apply right away.
/// Updates without a target apply afterwards to every phase. When an update,
/// or an untargeted update-missing, switches a phase to a different `how`,
/// the phase is first reduced to its name so options of the old plugin do
/// not leak into the new one.
pub fn merge_phase_data(
    step: StepKind,
    mut data: Vec<PhaseData>,
    invocations: &[PhaseInvocation],
) -> Result<Vec<PhaseData>> {
    assign_default_names(&mut data);

    let mut postponed = Vec::new();
    for invocation in invocations {
        match (invocation.action, invocation.name()) {
            (InvocationAction::Insert, _) => data.push(invocation.fields.clone()),
            (_, Some(target)) => {
                let phase = data
                    .iter_mut()
                    .find(|phase| phase_name(phase) == Some(target))
                    .ok_or_else(|| {
                        OrchestratorError::specification(format!(
                            "Cannot update phase '{}' of step '{}', no such phase",
                            target, step
                        ))
                    })?;
                apply_invocation(step, phase, invocation, false);
            }
            (_, None) => postponed.push(invocation),
        }
    }

    for invocation in postponed {
        for phase in data.iter_mut() {
            apply_invocation(step, phase, invocation, true);
        }
    }

    assign_default_names(&mut data);

    let mut names = BTreeSet::new();
    for phase in &data {
        if let Some(name) = phase_name(phase) {
            if !names.insert(name) {
                return Err(OrchestratorError::DuplicatePhase {
                    step: step.as_str().to_string(),
                    name: name.to_string(),
                });
            }
        }
    }

    Ok(data)
}

fn apply_invocation(
    step: StepKind,
    phase: &mut PhaseData,
    invocation: &PhaseInvocation,
    postponed: bool,
) {
    let collapses = match invocation.action {
        InvocationAction::Update => true,
        InvocationAction::UpdateMissing => postponed,
        InvocationAction::Insert => false,
    };
    if collapses {
        if let Some(how) = invocation.how() {
            let current = phase_how(phase).unwrap_or(step.default_how());
            if current != how {
                let name = phase.remove("name");
                phase.clear();
                if let Some(name) = name {
                    phase.insert("name".to_string(), name);
                }
            }
        }
    }

    for (key, value) in &invocation.fields {
        match invocation.action {
            InvocationAction::UpdateMissing if phase.contains_key(key) => {}
            _ => {
                phase.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Name unnamed phases `default-N`, skipping names already taken.
fn assign_default_names(data: &mut [PhaseData]) {
    let mut taken: BTreeSet<String> = data
        .iter()
        .filter_map(|phase| phase_name(phase).map(str::to_string))
        .collect();

    for (index, phase) in data.iter_mut().enumerate() {
        if phase_name(phase).is_some() {
            continue;
        }
        let mut counter = index;
        let mut name = format!("default-{}", counter);
        while taken.contains(&name) {
            counter += 1;
            name = format!("default-{}", counter);
        }
        taken.insert(name.clone());
        phase.insert("name".to_string(), Value::from(name));
    }
}
