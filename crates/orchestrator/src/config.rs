//! Run-scoped configuration and the declarative plan document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use events::{Event, EventBus};
use serde::{Deserialize, Serialize};
use testrun_core::DEFAULT_TEST_DURATION;

use crate::error::{OrchestratorError, Result};
use crate::phase::{PhaseData, StepKind};

/// Default deadline for a guest to come back after a reboot.
pub const DEFAULT_REBOOT_TIMEOUT: Duration = Duration::from_secs(600);

/// Set asynchronously by a signal handler, polled between tests.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Settings shared by every step and phase of one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub workdir: PathBuf,
    pub force: bool,
    pub exit_first: bool,
    pub default_test_duration: String,
    pub reboot_timeout: Duration,
    pub interrupt: InterruptFlag,
    pub event_bus: Option<EventBus>,
}

impl RunConfig {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            force: false,
            exit_first: false,
            default_test_duration: DEFAULT_TEST_DURATION.to_string(),
            reboot_timeout: DEFAULT_REBOOT_TIMEOUT,
            interrupt: InterruptFlag::new(),
            event_bus: None,
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_exit_first(mut self, exit_first: bool) -> Self {
        self.exit_first = exit_first;
        self
    }

    pub fn with_default_test_duration(mut self, duration: impl Into<String>) -> Self {
        self.default_test_duration = duration.into();
        self
    }

    pub fn with_reboot_timeout(mut self, timeout: Duration) -> Self {
        self.reboot_timeout = timeout;
        self
    }

    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_set()
    }

    pub fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

/// A plan as written in its TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanConfig {
    pub name: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub discover: Vec<PhaseData>,
    #[serde(default)]
    pub provision: Vec<PhaseData>,
    #[serde(default)]
    pub prepare: Vec<PhaseData>,
    #[serde(default)]
    pub execute: Vec<PhaseData>,
    #[serde(default)]
    pub report: Vec<PhaseData>,
    #[serde(default)]
    pub finish: Vec<PhaseData>,
}

impl PlanConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let plan: PlanConfig = toml::from_str(content)
            .map_err(|e| OrchestratorError::specification(format!("Invalid plan: {}", e)))?;
        if plan.name.trim().is_empty() {
            return Err(OrchestratorError::specification("Plan name must not be empty"));
        }
        Ok(plan)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn phases(&self, step: StepKind) -> &[PhaseData] {
        match step {
            StepKind::Discover => &self.discover,
            StepKind::Provision => &self.provision,
            StepKind::Prepare => &self.prepare,
            StepKind::Execute => &self.execute,
            StepKind::Report => &self.report,
            StepKind::Finish => &self.finish,
        }
    }

    /// Plan name usable as a directory name.
    pub fn safe_name(&self) -> String {
        let safe: String = self
            .name
            .trim_start_matches('/')
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        if safe.is_empty() {
            "plan".to_string()
        } else {
            safe
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
name = "/plans/smoke"

[environment]
LEVEL = "1"

[[discover]]
how = "shell"
tests = [{ name = "/hello", test = "echo hello" }]

[[execute]]
how = "internal"

[[prepare]]
name = "packages"
script = "true"
order = 40
"#;

    #[test]
    fn test_plan_from_toml() {
        let plan = PlanConfig::from_toml_str(PLAN).unwrap();

        assert_eq!(plan.name, "/plans/smoke");
        assert_eq!(plan.environment.get("LEVEL"), Some(&"1".to_string()));
        assert_eq!(plan.phases(StepKind::Discover).len(), 1);
        assert_eq!(plan.phases(StepKind::Prepare)[0]["order"], 40);
        assert!(plan.phases(StepKind::Provision).is_empty());
        assert_eq!(plan.safe_name(), "plans-smoke");
    }

    #[test]
    fn test_plan_requires_name() {
        assert!(PlanConfig::from_toml_str("name = \"\"").is_err());
        assert!(PlanConfig::from_toml_str("[[discover]]\nhow = \"shell\"").is_err());
    }

    #[test]
    fn test_interrupt_flag_shared() {
        let flag = InterruptFlag::new();
        let config = RunConfig::new("/tmp/run").with_interrupt(flag.clone());

        assert!(!config.is_interrupted());
        flag.set();
        assert!(config.is_interrupted());
    }

    #[test]
    fn test_run_config_builders() {
        let config = RunConfig::new("/tmp/run")
            .with_force(true)
            .with_exit_first(true)
            .with_default_test_duration("1m")
            .with_reboot_timeout(Duration::from_secs(5));

        assert!(config.force);
        assert!(config.exit_first);
        assert_eq!(config.default_test_duration, "1m");
        assert_eq!(config.reboot_timeout, Duration::from_secs(5));
        assert!(config.event_bus.is_none());
    }

    #[test]
    fn test_emit_with_bus() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let config = RunConfig::new("/tmp/run").with_event_bus(bus);

        config.emit(Event::RunInterrupted {
            guest: "default-0".to_string(),
        });
        assert_eq!(EventBus::drain(&mut rx).len(), 1);
    }
}
