//! Install and configure the Rackspace Cloud Monitoring agent.
//!
//! A convergence run resolves the agent's token and id (finding or creating
//! an agent token through the Cloud Monitoring API when node attributes do
//! not already carry them), renders the agent config, installs the package,
//! manages the service and syncs the plugin directory.

pub mod config;
pub mod converge;
pub mod error;
pub mod host;
pub mod monitoring;
pub mod provision;

/// Version injected at compile time via CMAGENT_VERSION env var (set by CI/CD),
/// or the crate version for local builds.
pub const VERSION: &str = match option_env!("CMAGENT_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};
