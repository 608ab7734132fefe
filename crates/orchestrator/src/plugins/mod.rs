//! Built-in phase plugins.
//!
//! - [`DiscoverShell`] - tests declared inline in the plan
//! - [`ProvisionLocal`] - the local host as the only guest
//! - [`ShellScript`] - shell scripts run on every guest (prepare, finish)
//! - [`RebootAction`] - reboot every guest between phases
//! - [`ReportDisplay`] - log results and the summary

mod discover;
mod provision;
mod reboot;
mod report;
mod script;

pub use discover::DiscoverShell;
pub use provision::ProvisionLocal;
pub use reboot::RebootAction;
pub use report::ReportDisplay;
pub use script::ShellScript;
