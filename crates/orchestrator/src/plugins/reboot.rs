//! Reboot action between phases.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use events::Event;
use serde::Deserialize;
use testrun_core::{parse_duration, PhaseResult, ResultOutcome};

use crate::error::Result;
use crate::guest::{reboot_guest, Guest, RebootMode};
use crate::phase::{
    parse_phase_data, Configurable, Phase, PhaseCommon, PhaseContext, PhaseData, PhaseOutput,
    RunsPerGuest, StepKind,
};

#[derive(Debug, Deserialize)]
struct RebootData {
    #[serde(flatten)]
    common: PhaseCommon,
    #[serde(default)]
    hard: bool,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    timeout: Option<String>,
}

pub struct RebootAction {
    common: PhaseCommon,
    hard: bool,
    command: Option<String>,
    timeout: Option<Duration>,
    /// Reboots done by this phase, per guest.
    counts: Mutex<BTreeMap<String, u32>>,
}

impl RebootAction {
    pub fn from_data(step: StepKind, data: &PhaseData) -> Result<Phase> {
        let data: RebootData = parse_phase_data(step, data)?;
        let timeout = data.timeout.as_deref().map(parse_duration).transpose()?;

        Ok(Phase::PerGuest(Arc::new(Self {
            common: data.common,
            hard: data.hard,
            command: data.command,
            timeout,
            counts: Mutex::new(BTreeMap::new()),
        })))
    }

    fn bump(&self, guest: &str) -> u32 {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(guest.to_string()).or_insert(0);
        *count += 1;
        *count
    }
}

impl Configurable for RebootAction {
    fn common(&self) -> &PhaseCommon {
        &self.common
    }
}

impl RunsPerGuest for RebootAction {
    fn go(&self, ctx: &PhaseContext, guest: &Arc<dyn Guest>) -> Result<PhaseOutput> {
        let timeout = self.timeout.unwrap_or(ctx.config.reboot_timeout);
        let reboot_count = self.bump(guest.name());

        let mode = reboot_guest(guest.as_ref(), self.hard, self.command.as_deref(), timeout)?;
        ctx.config.emit(Event::GuestRebooted {
            guest: guest.name().to_string(),
            reboot_count,
            hard: mode == RebootMode::Hard,
        });

        let result = PhaseResult::new(self.name(), ResultOutcome::Pass, guest.result_data())
            .with_note(format!("{} reboot #{}", mode.as_str(), reboot_count));
        Ok(PhaseOutput::PhaseResults(vec![result]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::error::OrchestratorError;
    use crate::guest::fake::FakeGuest;
    use events::EventBus;
    use serde_json::json;

    fn reboot_phase(data: serde_json::Value) -> Arc<dyn RunsPerGuest> {
        match RebootAction::from_data(StepKind::Prepare, data.as_object().unwrap()).unwrap() {
            Phase::PerGuest(plugin) => plugin,
            Phase::Standalone(_) => panic!("reboot must run per guest"),
        }
    }

    #[test]
    fn test_reboot_counts_per_guest() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let ctx = PhaseContext::new(
            RunConfig::new("/tmp/run").with_event_bus(bus),
            StepKind::Prepare,
            "/tmp/run/prepare",
        );
        let phase = reboot_phase(json!({"name": "restart", "how": "reboot"}));
        let fake = FakeGuest::new("vm");
        let guest: Arc<dyn Guest> = Arc::new(fake.clone());

        phase.go(&ctx, &guest).unwrap();
        let PhaseOutput::PhaseResults(results) = phase.go(&ctx, &guest).unwrap() else {
            panic!("expected phase results");
        };

        assert_eq!(results[0].note, vec!["soft reboot #2"]);
        assert_eq!(fake.reboots(), vec![RebootMode::Soft, RebootMode::Soft]);

        let counts: Vec<_> = EventBus::drain(&mut rx)
            .into_iter()
            .filter_map(|envelope| match envelope.event {
                Event::GuestRebooted { reboot_count, .. } => Some(reboot_count),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![1, 2]);
    }

    #[test]
    fn test_reboot_timeout_is_fatal() {
        let ctx = PhaseContext::new(RunConfig::new("/tmp/run"), StepKind::Finish, "/tmp/run/finish");
        let phase = reboot_phase(json!({"name": "restart", "how": "reboot", "timeout": "30s"}));
        let guest: Arc<dyn Guest> = Arc::new(FakeGuest::new("vm").with_failing_reboot());

        let error = phase.go(&ctx, &guest).unwrap_err();
        assert!(matches!(error, OrchestratorError::RebootTimeout { timeout_secs: 30, .. }));
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let data = json!({"name": "restart", "how": "reboot", "timeout": "whenever"});
        assert!(RebootAction::from_data(StepKind::Prepare, data.as_object().unwrap()).is_err());
    }
}
