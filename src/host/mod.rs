//! Host collaborators
//!
//! Everything a convergence run does to the machine itself goes through the
//! [`Host`] trait: package repositories, packages, services, the rendered
//! config file and the plugin directory. Each operation is idempotent and
//! reports whether it changed anything.
//!
//! - [`system`] - Applies changes with the host's own tools
//! - [`dry_run`] - Logs what would be done, changes nothing
//! - [`platform`] - OS detection and package repository selection
//! - [`template`] - Config file rendering

pub mod dry_run;
pub mod platform;
pub mod system;
pub mod template;

use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub use dry_run::DryRunHost;
pub use platform::{Platform, PlatformFamily, Repository};
pub use system::SystemHost;

/// Whether an operation modified the host
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Changed,
    Unchanged,
}

impl Change {
    pub fn is_changed(self) -> bool {
        self == Change::Changed
    }

    pub fn from_bool(changed: bool) -> Self {
        if changed {
            Change::Changed
        } else {
            Change::Unchanged
        }
    }

    /// Changed if either side changed
    pub fn or(self, other: Change) -> Change {
        Change::from_bool(self.is_changed() || other.is_changed())
    }
}

/// Package version requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageVersion {
    /// Install, or upgrade to the newest available
    Latest,
    /// Install exactly this version
    Pinned(String),
}

impl PackageVersion {
    pub fn parse(version: &str) -> Self {
        match version.trim() {
            "" | "latest" => PackageVersion::Latest,
            pinned => PackageVersion::Pinned(pinned.to_string()),
        }
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageVersion::Latest => write!(f, "latest"),
            PackageVersion::Pinned(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Enable,
    Start,
    Restart,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::Start => "start",
            Self::Restart => "restart",
        }
    }
}

/// Where a template's source comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    /// Template compiled into the binary
    Builtin {
        name: &'static str,
        source: &'static str,
    },
    /// Template file on disk
    File(PathBuf),
}

/// A file to render from a template
#[derive(Debug, Clone)]
pub struct TemplateRequest {
    pub source: TemplateSource,
    pub destination: PathBuf,
    pub owner: String,
    pub group: String,
    pub mode: u32,
    pub variables: BTreeMap<String, String>,
}

/// Operations a convergence run performs on the host
#[allow(async_fn_in_trait)]
pub trait Host {
    /// Ensure a package repository (and its signing key) is configured
    async fn add_repository(&self, repository: &Repository) -> Result<Change>;

    /// Ensure a package is installed at the requested version
    async fn install_package(&self, name: &str, version: &PackageVersion) -> Result<Change>;

    /// Apply service actions in order
    async fn manage_service(&self, name: &str, actions: &[ServiceAction]) -> Result<Change>;

    /// Render a template to its destination with the requested ownership and mode
    async fn render_template(&self, request: &TemplateRequest) -> Result<Change>;

    /// Ensure a directory exists, owned by root, with `mode`
    async fn ensure_directory(&self, path: &Path, mode: u32) -> Result<Change>;

    /// Copy `source` recursively into `destination` without removing extra files
    async fn sync_directory(&self, source: &Path, destination: &Path, file_mode: u32) -> Result<Change>;
}
