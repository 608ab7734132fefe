pub mod definition;
pub mod exit_code;
pub mod interpret;
pub mod outcome;
pub mod result;

pub use definition::{
    parse_duration, CheckSpec, TestDefinition, DEFAULT_FRAMEWORK, DEFAULT_RESTART_MAX_COUNT,
    DEFAULT_TEST_DURATION,
};
pub use exit_code::{outcome_totals, results_to_exit_code, ExitCode};
pub use interpret::{CheckResultInterpret, ResultInterpret};
pub use outcome::ResultOutcome;
pub use result::{
    CheckEvent, CheckResult, PhaseResult, ResultGuestData, SubCheckResult, SubResult, TestResult,
};
