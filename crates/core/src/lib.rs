//! Domain model shared by the test orchestrator.
//!
//! Outcomes, interpretation policies, result records and the reduction
//! rules that turn raw signals into a final verdict.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::{CoreError, Result};
