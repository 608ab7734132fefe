//! Plugin lookup by step and `how`.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::execute::ExecuteInternal;
use crate::phase::{phase_how, Phase, PhaseData, StepKind};
use crate::plugins::{DiscoverShell, ProvisionLocal, RebootAction, ReportDisplay, ShellScript};

/// Builds a phase from its raw data. The data always carries the resolved
/// `how` and a `name`.
pub type PhaseFactory = fn(StepKind, &PhaseData) -> Result<Phase>;

#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<StepKind, BTreeMap<String, PhaseFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every plugin shipped with the crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(StepKind::Discover, "shell", DiscoverShell::from_data);
        registry.register(StepKind::Provision, "local", ProvisionLocal::from_data);
        registry.register(StepKind::Prepare, "shell", ShellScript::from_data);
        registry.register(StepKind::Prepare, "reboot", RebootAction::from_data);
        registry.register(StepKind::Execute, "internal", ExecuteInternal::from_data);
        registry.register(StepKind::Report, "display", ReportDisplay::from_data);
        registry.register(StepKind::Finish, "shell", ShellScript::from_data);
        registry.register(StepKind::Finish, "reboot", RebootAction::from_data);
        registry
    }

    pub fn register(&mut self, step: StepKind, how: impl Into<String>, factory: PhaseFactory) {
        self.plugins
            .entry(step)
            .or_default()
            .insert(how.into(), factory);
    }

    /// Plugin names available for a step.
    pub fn available(&self, step: StepKind) -> Vec<&str> {
        self.plugins
            .get(&step)
            .map(|plugins| plugins.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Find the plugin for `how`, accepting any unique prefix.
    pub fn resolve(&self, step: StepKind, how: &str) -> Result<(String, PhaseFactory)> {
        let unknown = || OrchestratorError::UnknownHow {
            step: step.as_str().to_string(),
            how: how.to_string(),
        };
        let plugins = self.plugins.get(&step).ok_or_else(unknown)?;

        if let Some(factory) = plugins.get(how) {
            return Ok((how.to_string(), *factory));
        }

        let candidates: Vec<_> = plugins
            .iter()
            .filter(|(name, _)| !how.is_empty() && name.starts_with(how))
            .collect();

        match candidates.as_slice() {
            [(name, factory)] => Ok(((*name).clone(), **factory)),
            [] => Err(unknown()),
            many => Err(OrchestratorError::specification(format!(
                "Ambiguous {} plugin '{}', matches {}",
                step,
                how,
                many.iter()
                    .map(|(name, _)| name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Build a phase from raw data. A missing `how` means the step default.
    pub fn materialize(&self, step: StepKind, data: &PhaseData) -> Result<Phase> {
        let how = phase_how(data).unwrap_or(step.default_how());
        let (resolved, factory) = self.resolve(step, how)?;
        debug!(step = %step, how = %resolved, "Materializing phase");

        let mut data = data.clone();
        data.insert("how".to_string(), Value::from(resolved));
        factory(step, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> PhaseData {
        value.as_object().cloned().unwrap()
    }

    fn report_factory(step: StepKind, data: &PhaseData) -> Result<Phase> {
        ReportDisplay::from_data(step, data)
    }

    #[test]
    fn test_builtins_available() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(registry.available(StepKind::Prepare), vec!["reboot", "shell"]);
        assert_eq!(registry.available(StepKind::Execute), vec!["internal"]);
    }

    #[test]
    fn test_resolve_prefix() {
        let registry = PluginRegistry::with_builtins();
        let (how, _) = registry.resolve(StepKind::Prepare, "sh").unwrap();
        assert_eq!(how, "shell");

        let (how, _) = registry.resolve(StepKind::Prepare, "reboot").unwrap();
        assert_eq!(how, "reboot");
    }

    #[test]
    fn test_resolve_ambiguous_prefix() {
        let mut registry = PluginRegistry::new();
        registry.register(StepKind::Report, "display", report_factory);
        registry.register(StepKind::Report, "disk", report_factory);

        let error = registry.resolve(StepKind::Report, "di").err().unwrap();
        assert!(error.is_configuration());
        assert!(error.to_string().contains("disk, display"));

        assert!(registry.resolve(StepKind::Report, "dis").is_err());
        assert!(registry.resolve(StepKind::Report, "disp").is_ok());
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = PluginRegistry::with_builtins();
        let error = registry.resolve(StepKind::Prepare, "ansible").err().unwrap();
        assert!(matches!(error, OrchestratorError::UnknownHow { ref how, .. } if how == "ansible"));

        let error = PluginRegistry::new()
            .resolve(StepKind::Prepare, "shell")
            .err()
            .unwrap();
        assert!(matches!(error, OrchestratorError::UnknownHow { .. }));
    }

    #[test]
    fn test_materialize_uses_default_how() {
        let registry = PluginRegistry::with_builtins();
        let phase = registry
            .materialize(StepKind::Report, &data(json!({"name": "default-0"})))
            .unwrap();
        assert_eq!(phase.how(), "display");

        let phase = registry
            .materialize(
                StepKind::Prepare,
                &data(json!({"name": "restart", "how": "reb", "order": 70})),
            )
            .unwrap();
        assert_eq!(phase.how(), "reboot");
        assert_eq!(phase.order(), 70);
    }
}
