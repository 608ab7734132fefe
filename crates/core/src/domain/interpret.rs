use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::outcome::ResultOutcome;
use crate::error::{CoreError, Result};

/// How the raw outcome of a test becomes the reported one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResultInterpret {
    #[default]
    Respect,
    Xfail,
    Info,
    Warn,
    Error,
    Pass,
    Fail,
    /// The test reports its own results; nothing is reinterpreted.
    Custom,
    /// Every in-test report becomes a standalone result.
    Restraint,
}

impl ResultInterpret {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Respect => "respect",
            Self::Xfail => "xfail",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Custom => "custom",
            Self::Restraint => "restraint",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "respect" => Some(Self::Respect),
            "xfail" => Some(Self::Xfail),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "custom" => Some(Self::Custom),
            "restraint" => Some(Self::Restraint),
            _ => None,
        }
    }

    pub fn from_spec(s: &str) -> Result<Self> {
        Self::parse(s.trim()).ok_or_else(|| CoreError::InvalidInterpret(s.to_string()))
    }

    /// The literal outcome this policy forces, if it is an override.
    pub fn forced_outcome(&self) -> Option<ResultOutcome> {
        match self {
            Self::Info => Some(ResultOutcome::Info),
            Self::Warn => Some(ResultOutcome::Warn),
            Self::Error => Some(ResultOutcome::Error),
            Self::Pass => Some(ResultOutcome::Pass),
            Self::Fail => Some(ResultOutcome::Fail),
            Self::Respect | Self::Xfail | Self::Custom | Self::Restraint => None,
        }
    }
}

impl fmt::Display for ResultInterpret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the outcome of a single check contributes to the test result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckResultInterpret {
    #[default]
    Respect,
    Info,
    Xfail,
}

impl CheckResultInterpret {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Respect => "respect",
            Self::Info => "info",
            Self::Xfail => "xfail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "respect" => Some(Self::Respect),
            "info" => Some(Self::Info),
            "xfail" => Some(Self::Xfail),
            _ => None,
        }
    }
}
