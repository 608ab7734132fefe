//! Event system for test runs
//!
//! This crate provides the event bus and event types used to observe a run
//! (step transitions, phases, tests, reboots) from outside the orchestrator.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
