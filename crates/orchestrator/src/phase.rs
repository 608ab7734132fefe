//! Phases: the schedulable units of a step.
//!
//! A phase is either a plugin or an action. Plugins are built from their raw
//! data by the registry and expose their capabilities through two traits:
//! [`Configurable`] for what every phase carries, and one of
//! [`RunsStandalone`] or [`RunsPerGuest`] for how it runs.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use testrun_core::{PhaseResult, TestDefinition, TestResult};

use crate::config::RunConfig;
use crate::error::{OrchestratorError, Result};
use crate::guest::Guest;

/// Raw declarative data of one phase, as written by the user.
pub type PhaseData = serde_json::Map<String, Value>;

pub const PHASE_ORDER_START: i64 = 10;
pub const PHASE_ORDER_BASE: i64 = 50;
pub const PHASE_ORDER_END: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Discover,
    Provision,
    Prepare,
    Execute,
    Report,
    Finish,
}

impl StepKind {
    /// Steps in the order a plan runs them.
    pub const ALL: [StepKind; 6] = [
        StepKind::Discover,
        StepKind::Provision,
        StepKind::Prepare,
        StepKind::Execute,
        StepKind::Report,
        StepKind::Finish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Discover => "discover",
            StepKind::Provision => "provision",
            StepKind::Prepare => "prepare",
            StepKind::Execute => "execute",
            StepKind::Report => "report",
            StepKind::Finish => "finish",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|step| step.as_str() == s)
    }

    /// Plugin used by phases that do not say otherwise.
    pub fn default_how(&self) -> &'static str {
        match self {
            StepKind::Discover => "shell",
            StepKind::Provision => "local",
            StepKind::Prepare => "shell",
            StepKind::Execute => "internal",
            StepKind::Report => "display",
            StepKind::Finish => "shell",
        }
    }

    /// Files kept in the step workdir when the step is reset.
    pub fn preserved_files(&self) -> &'static [&'static str] {
        match self {
            StepKind::Execute => &["results.json"],
            _ => &[],
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn phase_name(data: &PhaseData) -> Option<&str> {
    data.get("name").and_then(Value::as_str)
}

pub fn phase_how(data: &PhaseData) -> Option<&str> {
    data.get("how").and_then(Value::as_str)
}

fn default_order() -> i64 {
    PHASE_ORDER_BASE
}

/// Accept either a single string or a list of strings.
pub(crate) fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

/// Keys every phase understands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseCommon {
    pub name: String,
    pub how: String,
    #[serde(default = "default_order")]
    pub order: i64,
    #[serde(default, rename = "where", deserialize_with = "one_or_many")]
    pub where_: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Deserialize a plugin's typed configuration from its raw data.
pub fn parse_phase_data<T: DeserializeOwned>(step: StepKind, data: &PhaseData) -> Result<T> {
    serde_json::from_value(Value::Object(data.clone())).map_err(|e| {
        OrchestratorError::specification(format!(
            "Invalid {} phase '{}': {}",
            step,
            phase_name(data).unwrap_or("<unnamed>"),
            e
        ))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationAction {
    Insert,
    Update,
    UpdateMissing,
}

/// A command-line change to a step's phases.
///
/// `fields` holds only the keys the user actually passed. A key that is
/// absent was never given, which is how updates tell "set" from "defaulted".
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseInvocation {
    pub action: InvocationAction,
    pub fields: PhaseData,
}

impl PhaseInvocation {
    pub fn new(action: InvocationAction, fields: PhaseData) -> Self {
        Self { action, fields }
    }

    pub fn insert(fields: PhaseData) -> Self {
        Self::new(InvocationAction::Insert, fields)
    }

    pub fn update(fields: PhaseData) -> Self {
        Self::new(InvocationAction::Update, fields)
    }

    pub fn update_missing(fields: PhaseData) -> Self {
        Self::new(InvocationAction::UpdateMissing, fields)
    }

    /// Phase this invocation targets, if the user named one.
    pub fn name(&self) -> Option<&str> {
        phase_name(&self.fields)
    }

    pub fn how(&self) -> Option<&str> {
        phase_how(&self.fields)
    }
}

/// What a phase hands back to its step.
#[derive(Debug, Default)]
pub enum PhaseOutput {
    #[default]
    None,
    Tests(Vec<TestDefinition>),
    Guests(Vec<Arc<dyn Guest>>),
    PhaseResults(Vec<PhaseResult>),
    TestResults(Vec<TestResult>),
}

/// Everything a phase can see while it runs.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub config: RunConfig,
    pub step: StepKind,
    /// Workdir of the owning step.
    pub workdir: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub tests: Arc<Vec<TestDefinition>>,
    /// Results already known before the phase started.
    pub results: Arc<Vec<TestResult>>,
}

impl PhaseContext {
    pub fn new(config: RunConfig, step: StepKind, workdir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            step,
            workdir: workdir.into(),
            environment: BTreeMap::new(),
            tests: Arc::new(Vec::new()),
            results: Arc::new(Vec::new()),
        }
    }

    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_tests(mut self, tests: Vec<TestDefinition>) -> Self {
        self.tests = Arc::new(tests);
        self
    }

    pub fn with_results(mut self, results: Vec<TestResult>) -> Self {
        self.results = Arc::new(results);
        self
    }

    pub fn phase_workdir(&self, phase: &str) -> PathBuf {
        self.workdir.join(phase)
    }

    pub fn step_workdir(&self) -> &Path {
        &self.workdir
    }
}

pub trait Configurable: Send + Sync {
    fn common(&self) -> &PhaseCommon;

    fn name(&self) -> &str {
        &self.common().name
    }

    fn how(&self) -> &str {
        &self.common().how
    }

    fn order(&self) -> i64 {
        self.common().order
    }

    fn where_(&self) -> &[String] {
        &self.common().where_
    }

    /// Whether the owning step must run even when it is already done.
    fn always_force(&self) -> bool {
        false
    }
}

pub trait RunsStandalone: Configurable {
    fn go(&self, ctx: &PhaseContext) -> Result<PhaseOutput>;
}

pub trait RunsPerGuest: Configurable {
    fn go(&self, ctx: &PhaseContext, guest: &Arc<dyn Guest>) -> Result<PhaseOutput>;
}

/// A materialized phase, ready to be queued.
#[derive(Clone)]
pub enum Phase {
    Standalone(Arc<dyn RunsStandalone>),
    PerGuest(Arc<dyn RunsPerGuest>),
}

impl Phase {
    pub fn name(&self) -> &str {
        match self {
            Phase::Standalone(plugin) => plugin.name(),
            Phase::PerGuest(plugin) => plugin.name(),
        }
    }

    pub fn how(&self) -> &str {
        match self {
            Phase::Standalone(plugin) => plugin.how(),
            Phase::PerGuest(plugin) => plugin.how(),
        }
    }

    pub fn order(&self) -> i64 {
        match self {
            Phase::Standalone(plugin) => plugin.order(),
            Phase::PerGuest(plugin) => plugin.order(),
        }
    }

    pub fn where_(&self) -> &[String] {
        match self {
            Phase::Standalone(plugin) => plugin.where_(),
            Phase::PerGuest(plugin) => plugin.where_(),
        }
    }

    pub fn always_force(&self) -> bool {
        match self {
            Phase::Standalone(plugin) => plugin.always_force(),
            Phase::PerGuest(plugin) => plugin.always_force(),
        }
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Phase::Standalone(_) => "standalone",
            Phase::PerGuest(_) => "per-guest",
        };
        f.debug_struct("Phase")
            .field("name", &self.name())
            .field("how", &self.how())
            .field("order", &self.order())
            .field("kind", &kind)
            .finish()
    }
}
