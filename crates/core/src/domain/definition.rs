use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::interpret::{CheckResultInterpret, ResultInterpret};
use crate::error::{CoreError, Result};

pub const DEFAULT_TEST_DURATION: &str = "5m";
pub const DEFAULT_FRAMEWORK: &str = "shell";
pub const DEFAULT_RESTART_MAX_COUNT: u32 = 1;

fn default_true() -> bool {
    true
}

fn default_duration() -> String {
    DEFAULT_TEST_DURATION.to_string()
}

fn default_framework() -> String {
    DEFAULT_FRAMEWORK.to_string()
}

fn default_restart_max_count() -> u32 {
    DEFAULT_RESTART_MAX_COUNT
}

/// A check requested by a test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckSpec {
    pub how: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub result: CheckResultInterpret,
}

impl CheckSpec {
    pub fn new(how: impl Into<String>) -> Self {
        Self {
            how: how.into(),
            enabled: true,
            result: CheckResultInterpret::default(),
        }
    }

    pub fn with_result(mut self, result: CheckResultInterpret) -> Self {
        self.result = result;
        self
    }
}

/// A discovered work item, serialized with every field so later steps never
/// need the code that discovered it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestDefinition {
    pub name: String,
    #[serde(default)]
    pub serial_number: u32,
    pub test: String,
    /// Working directory for the test command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default = "default_duration")]
    pub duration: String,
    #[serde(default = "default_framework")]
    pub framework: String,
    #[serde(default)]
    pub result: ResultInterpret,
    #[serde(default)]
    pub check: Vec<CheckSpec>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub restart_on_exit_code: Vec<i32>,
    #[serde(default = "default_restart_max_count")]
    pub restart_max_count: u32,
    #[serde(default)]
    pub restart_with_reboot: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Guest names or roles the test is limited to. Empty means all guests.
    #[serde(default, rename = "where", skip_serializing_if = "Vec::is_empty")]
    pub where_: Vec<String>,
}

impl TestDefinition {
    pub fn new(name: impl Into<String>, test: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            serial_number: 0,
            test: test.into(),
            path: None,
            duration: default_duration(),
            framework: default_framework(),
            result: ResultInterpret::default(),
            check: Vec::new(),
            environment: BTreeMap::new(),
            restart_on_exit_code: Vec::new(),
            restart_max_count: DEFAULT_RESTART_MAX_COUNT,
            restart_with_reboot: false,
            enabled: true,
            where_: Vec::new(),
        }
    }

    pub fn with_serial_number(mut self, serial_number: u32) -> Self {
        self.serial_number = serial_number;
        self
    }

    pub fn with_duration(mut self, duration: impl Into<String>) -> Self {
        self.duration = duration.into();
        self
    }

    pub fn with_result(mut self, result: ResultInterpret) -> Self {
        self.result = result;
        self
    }

    pub fn with_check(mut self, check: CheckSpec) -> Self {
        self.check.push(check);
        self
    }

    pub fn with_restart(mut self, exit_codes: Vec<i32>, max_count: u32) -> Self {
        self.restart_on_exit_code = exit_codes;
        self.restart_max_count = max_count;
        self
    }

    /// Whether the test should run on a guest with this name and role.
    pub fn runs_on(&self, name: &str, role: Option<&str>) -> bool {
        self.where_.is_empty()
            || self
                .where_
                .iter()
                .any(|target| target == name || Some(target.as_str()) == role)
    }

    /// Deadline for a single run of the test.
    pub fn timeout(&self) -> Result<Duration> {
        parse_duration(&self.duration)
    }

    pub fn enabled_checks(&self) -> impl Iterator<Item = &CheckSpec> {
        self.check.iter().filter(|check| check.enabled)
    }

    /// Interpretation policy for every enabled check.
    pub fn check_interprets(&self) -> BTreeMap<String, CheckResultInterpret> {
        self.enabled_checks()
            .map(|check| (check.how.clone(), check.result))
            .collect()
    }

    /// Name usable as a single path component.
    pub fn safe_name(&self) -> String {
        let trimmed = self.name.trim_start_matches('/');
        let safe: String = trimmed
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '-'
                }
            })
            .collect();

        if safe.is_empty() {
            "test".to_string()
        } else {
            safe
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Validation("Test name must not be empty".to_string()));
        }
        if self.test.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "Test '{}' has no command",
                self.name
            )));
        }
        self.timeout()?;
        Ok(())
    }
}

/// Parse a duration such as `5m`, `1h 30m` or `5m*2`.
///
/// Everything after `*` is a multiplier applied to the base duration.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let mut parts = value.split('*');
    let base = parts.next().unwrap_or_default().trim();

    let mut duration = humantime::parse_duration(base)
        .map_err(|e| CoreError::invalid_duration(value, e.to_string()))?;

    for multiplier in parts {
        let factor: f64 = multiplier
            .trim()
            .parse()
            .map_err(|_| CoreError::invalid_duration(value, "invalid multiplier"))?;
        if !factor.is_finite() || factor < 0.0 {
            return Err(CoreError::invalid_duration(value, "invalid multiplier"));
        }
        duration = Duration::try_from_secs_f64(duration.as_secs_f64() * factor)
            .map_err(|_| CoreError::invalid_duration(value, "duration out of range"))?;
    }

    Ok(duration)
}
