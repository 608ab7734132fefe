use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::error::Result;
use crate::guest::{Guest, LocalGuest};
use crate::phase::{
    parse_phase_data, Configurable, Phase, PhaseCommon, PhaseContext, PhaseData, PhaseOutput,
    RunsStandalone, StepKind,
};

#[derive(Debug, Deserialize)]
struct ProvisionLocalData {
    #[serde(flatten)]
    common: PhaseCommon,
    #[serde(default)]
    role: Option<String>,
}

/// The local host, named after the phase.
pub struct ProvisionLocal {
    common: PhaseCommon,
    role: Option<String>,
}

impl ProvisionLocal {
    pub fn from_data(step: StepKind, data: &PhaseData) -> Result<Phase> {
        let data: ProvisionLocalData = parse_phase_data(step, data)?;
        Ok(Phase::Standalone(Arc::new(Self {
            common: data.common,
            role: data.role,
        })))
    }
}

impl Configurable for ProvisionLocal {
    fn common(&self) -> &PhaseCommon {
        &self.common
    }

    /// Guest objects are not persisted, every run needs them again.
    fn always_force(&self) -> bool {
        true
    }
}

impl RunsStandalone for ProvisionLocal {
    fn go(&self, _ctx: &PhaseContext) -> Result<PhaseOutput> {
        let mut guest = LocalGuest::new(self.name())?;
        if let Some(role) = &self.role {
            guest = guest.with_role(role);
        }
        info!(guest = %self.name(), role = ?self.role, "Provisioned local guest");

        let guest: Arc<dyn Guest> = Arc::new(guest);
        Ok(PhaseOutput::Guests(vec![guest]))
    }
}
