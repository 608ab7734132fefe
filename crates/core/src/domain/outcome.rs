//! Result outcomes and the two reduction orders defined over them.
//!
//! [`ResultOutcome::reduce`] picks the representative outcome of a test and
//! its checks. [`ResultOutcome::reduce_subresults`] folds in-test reported
//! sub-results into one outcome. The two orders rank `pass`, `info` and
//! `error` differently and must not be mixed up.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResultOutcome {
    Pass,
    Fail,
    Info,
    Warn,
    Error,
    Skip,
    Pending,
}

/// First match wins when reducing test and check outcomes.
const REDUCTION_PRECEDENCE: [ResultOutcome; 7] = [
    ResultOutcome::Error,
    ResultOutcome::Fail,
    ResultOutcome::Warn,
    ResultOutcome::Pass,
    ResultOutcome::Info,
    ResultOutcome::Skip,
    ResultOutcome::Pending,
];

/// Severity of reported sub-results, least severe first. `info` and
/// `pending` carry no severity and are left out.
const SUBRESULT_SEVERITY: [ResultOutcome; 5] = [
    ResultOutcome::Skip,
    ResultOutcome::Pass,
    ResultOutcome::Warn,
    ResultOutcome::Fail,
    ResultOutcome::Error,
];

impl ResultOutcome {
    pub const ALL: [ResultOutcome; 7] = [
        Self::Pass,
        Self::Fail,
        Self::Info,
        Self::Warn,
        Self::Error,
        Self::Skip,
        Self::Pending,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Skip => "skip",
            Self::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "skip" => Some(Self::Skip),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }

    /// Parse an outcome, case-insensitively, failing on unknown values.
    pub fn from_spec(s: &str) -> Result<Self> {
        Self::parse(&s.trim().to_ascii_lowercase())
            .ok_or_else(|| CoreError::InvalidOutcome(s.to_string()))
    }

    /// Pick the representative outcome of a non-empty set.
    ///
    /// Used both for repeated observations of one check and for combining a
    /// test's own outcome with its checks' contributions.
    pub fn reduce<I>(outcomes: I) -> Result<Self>
    where
        I: IntoIterator<Item = ResultOutcome>,
    {
        let outcomes: Vec<ResultOutcome> = outcomes.into_iter().collect();
        if outcomes.is_empty() {
            return Err(CoreError::EmptyOutcomeSet);
        }

        REDUCTION_PRECEDENCE
            .iter()
            .copied()
            .find(|candidate| outcomes.contains(candidate))
            .ok_or(CoreError::EmptyOutcomeSet)
    }

    /// Fold sub-results reported from inside a test into the worst one.
    ///
    /// `error` outranks `fail`. `info` and `pending` never raise the
    /// severity. Returns `None` when nothing ranked was reported so callers
    /// can fall back to the test's own outcome.
    pub fn reduce_subresults<I>(outcomes: I) -> Option<Self>
    where
        I: IntoIterator<Item = ResultOutcome>,
    {
        outcomes
            .into_iter()
            .filter_map(|outcome| {
                SUBRESULT_SEVERITY
                    .iter()
                    .position(|candidate| *candidate == outcome)
                    .map(|rank| (rank, outcome))
            })
            .max_by_key(|(rank, _)| *rank)
            .map(|(_, outcome)| outcome)
    }

    /// Swap `pass` and `fail`, leaving every other outcome untouched.
    pub fn inverted(self) -> Self {
        match self {
            Self::Pass => Self::Fail,
            Self::Fail => Self::Pass,
            other => other,
        }
    }
}

impl fmt::Display for ResultOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_empty_fails() {
        assert_eq!(
            ResultOutcome::reduce(Vec::new()),
            Err(CoreError::EmptyOutcomeSet)
        );
    }

    #[test]
    fn test_reduce_precedence() {
        use ResultOutcome::*;

        assert_eq!(ResultOutcome::reduce([Pass, Error, Fail]), Ok(Error));
        assert_eq!(ResultOutcome::reduce([Pass, Fail, Warn]), Ok(Fail));
        assert_eq!(ResultOutcome::reduce([Info, Warn]), Ok(Warn));
        assert_eq!(ResultOutcome::reduce([Info, Pass, Skip]), Ok(Pass));
        assert_eq!(ResultOutcome::reduce([Skip, Info]), Ok(Info));
        assert_eq!(ResultOutcome::reduce([Pending, Skip]), Ok(Skip));
        assert_eq!(ResultOutcome::reduce([Pending]), Ok(Pending));
    }

    #[test]
    fn test_reduce_returns_member_of_input() {
        for a in ResultOutcome::ALL {
            for b in ResultOutcome::ALL {
                let reduced = ResultOutcome::reduce([a, b]).unwrap();
                assert!(reduced == a || reduced == b);
                assert_eq!(reduced, ResultOutcome::reduce([b, a]).unwrap());
            }
        }
    }

    #[test]
    fn test_reduce_subresults_order() {
        use ResultOutcome::*;

        assert_eq!(ResultOutcome::reduce_subresults(Vec::new()), None);
        assert_eq!(ResultOutcome::reduce_subresults([Skip, Pass]), Some(Pass));
        assert_eq!(ResultOutcome::reduce_subresults([Pass, Warn, Skip]), Some(Warn));
        assert_eq!(ResultOutcome::reduce_subresults([Fail, Warn, Pass]), Some(Fail));
    }

    #[test]
    fn test_reduce_subresults_error_info_pending() {
        use ResultOutcome::*;

        assert_eq!(ResultOutcome::reduce_subresults([Pass, Error, Fail]), Some(Error));
        assert_eq!(ResultOutcome::reduce_subresults([Pass, Info]), Some(Pass));
        assert_eq!(ResultOutcome::reduce_subresults([Skip, Pending, Info]), Some(Skip));
        assert_eq!(ResultOutcome::reduce_subresults([Info, Pending]), None);
    }

    #[test]
    fn test_orders_differ_for_pass_and_skip() {
        use ResultOutcome::*;

        // Test-level reduction prefers pass over skip, and so does the
        // sub-result fold, but info only ranks in the former.
        assert_eq!(ResultOutcome::reduce([Skip, Pass]), Ok(Pass));
        assert_eq!(ResultOutcome::reduce([Info, Skip]), Ok(Info));
        assert_eq!(ResultOutcome::reduce_subresults([Info, Skip]), Some(Skip));
    }

    #[test]
    fn test_parse_and_serialize() {
        assert_eq!(ResultOutcome::parse("warn"), Some(ResultOutcome::Warn));
        assert_eq!(ResultOutcome::parse("bogus"), None);
        assert_eq!(ResultOutcome::from_spec(" PASS "), Ok(ResultOutcome::Pass));
        assert!(ResultOutcome::from_spec("maybe").is_err());

        let json = serde_json::to_string(&ResultOutcome::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
    }

    #[test]
    fn test_inverted() {
        assert_eq!(ResultOutcome::Pass.inverted(), ResultOutcome::Fail);
        assert_eq!(ResultOutcome::Fail.inverted(), ResultOutcome::Pass);
        assert_eq!(ResultOutcome::Error.inverted(), ResultOutcome::Error);
    }
}
