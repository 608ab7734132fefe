pub mod config;
pub mod error;
pub mod execute;
pub mod files;
pub mod guest;
pub mod phase;
pub mod phase_queue;
pub mod plan;
pub mod plugins;
pub mod queue;
pub mod registry;
pub mod state_machine;
pub mod step;

pub use config::{InterruptFlag, PlanConfig, RunConfig, DEFAULT_REBOOT_TIMEOUT};
pub use error::{OrchestratorError, Result, RunExit};
pub use guest::{Guest, GuestError, LocalGuest};
pub use phase::{InvocationAction, Phase, PhaseContext, PhaseData, PhaseInvocation, PhaseOutput, StepKind};
pub use plan::Plan;
pub use queue::{Queue, TaskOutcome};
pub use registry::{PhaseFactory, PluginRegistry};
pub use state_machine::{StepStatus, StepStatusMachine};
pub use step::{merge_phase_data, Step};
