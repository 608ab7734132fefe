use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Unset,
    Todo,
    Done,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Unset => "unset",
            StepStatus::Todo => "todo",
            StepStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unset" => Some(StepStatus::Unset),
            "todo" => Some(StepStatus::Todo),
            "done" => Some(StepStatus::Done),
            _ => None,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct StepStatusMachine;

impl StepStatusMachine {
    pub fn validate_transition(from: &StepStatus, to: &StepStatus) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    /// `done -> todo` is a forced re-run, `todo -> todo` resumes an
    /// interrupted run.
    fn allowed_transitions(from: &StepStatus) -> Vec<StepStatus> {
        match from {
            StepStatus::Unset => vec![StepStatus::Todo],
            StepStatus::Todo => vec![StepStatus::Todo, StepStatus::Done],
            StepStatus::Done => vec![StepStatus::Todo],
        }
    }

    pub fn can_transition(from: &StepStatus, to: &StepStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    pub fn next_status(current: &StepStatus) -> Option<StepStatus> {
        match current {
            StepStatus::Unset => Some(StepStatus::Todo),
            StepStatus::Todo => Some(StepStatus::Done),
            StepStatus::Done => None,
        }
    }
}
