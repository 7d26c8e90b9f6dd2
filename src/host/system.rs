//! System host
//!
//! Applies changes with the host's own tools: `apt-get`/`dpkg-query` or
//! `yum`/`rpm` for packages, `systemctl` or `service` for services, and the
//! filesystem for repository definitions, the config file and plugins.

use super::platform::{Platform, PlatformFamily, Repository};
use super::{template, Change, Host, PackageVersion, ServiceAction, TemplateRequest};
use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use walkdir::WalkDir;

const APT_SOURCES_DIR: &str = "/etc/apt/sources.list.d";
const APT_KEYS_DIR: &str = "/etc/apt/trusted.gpg.d";
const YUM_REPOS_DIR: &str = "/etc/yum.repos.d";

/// Host implementation that changes the running system
pub struct SystemHost {
    platform: Platform,
    /// Filesystem root every absolute path is resolved against
    root: PathBuf,
    /// Whether to chown written files to root
    manage_ownership: bool,
    http: reqwest::Client,
}

impl SystemHost {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            root: PathBuf::from("/"),
            manage_ownership: true,
            http: reqwest::Client::new(),
        }
    }

    /// Resolve paths under `root` instead of `/`, without changing ownership.
    /// Used to stage files for an image or a test.
    pub fn with_root(platform: Platform, root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manage_ownership: false,
            ..Self::new(platform)
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    /// Write `content` to `path` if it differs, replacing the file atomically
    fn write_file(&self, path: &Path, content: &[u8], mode: u32) -> Result<Change> {
        let content_changed = fs::read(path).map(|old| old != content).unwrap_or(true);

        if content_changed {
            let parent = path
                .parent()
                .with_context(|| format!("{:?} has no parent directory", path))?;
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;

            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("file");
            let staging = parent.join(format!(".{}.cmagent-tmp", file_name));

            // The mode only applies on creation, so never reuse a leftover
            if staging.exists() {
                fs::remove_file(&staging)
                    .with_context(|| format!("Failed to remove stale {:?}", staging))?;
            }
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode)
                .open(&staging)
                .with_context(|| format!("Failed to create {:?}", staging))?;
            file.write_all(content)
                .with_context(|| format!("Failed to write {:?}", staging))?;
            drop(file);
            // Creation mode is masked by the umask
            fs::set_permissions(&staging, fs::Permissions::from_mode(mode))?;
            self.chown_root(&staging)?;
            fs::rename(&staging, path)
                .with_context(|| format!("Failed to move {:?} into place", path))?;

            tracing::info!("Wrote {:?} (mode {:o})", path, mode);
            return Ok(Change::Changed);
        }

        self.set_mode(path, mode)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<Change> {
        let current = fs::metadata(path)
            .with_context(|| format!("Failed to stat {:?}", path))?
            .permissions()
            .mode()
            & 0o7777;

        if current == mode {
            return Ok(Change::Unchanged);
        }

        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to chmod {:?}", path))?;
        tracing::info!("Changed mode of {:?} from {:o} to {:o}", path, current, mode);
        Ok(Change::Changed)
    }

    fn chown_root(&self, path: &Path) -> Result<()> {
        if self.manage_ownership {
            std::os::unix::fs::chown(path, Some(0), Some(0))
                .with_context(|| format!("Failed to chown {:?} to root:root", path))?;
        }
        Ok(())
    }

    async fn fetch_key(&self, url: &str) -> Result<Vec<u8>> {
        tracing::info!("Fetching repository signing key {}", url);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?
            .error_for_status()
            .with_context(|| format!("Failed to fetch {}", url))?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn installed_version(&self, name: &str) -> Result<Option<String>> {
        match self.platform.family {
            PlatformFamily::Debian => {
                let status = capture("dpkg-query", &["-W", "-f=${db:Status-Abbrev}", name]).await;
                if !status.is_some_and(|s| s.starts_with("ii")) {
                    return Ok(None);
                }
                Ok(capture("dpkg-query", &["-W", "-f=${Version}", name]).await)
            }
            PlatformFamily::Rhel => {
                Ok(capture("rpm", &["-q", "--qf", "%{VERSION}-%{RELEASE}", name]).await)
            }
            PlatformFamily::Other => anyhow::bail!(
                "Package management is not supported on {}",
                self.platform.name
            ),
        }
    }

    async fn uses_systemd(&self) -> bool {
        succeeds("systemctl", &["--version"]).await
    }
}

impl Host for SystemHost {
    async fn add_repository(&self, repository: &Repository) -> Result<Change> {
        let (dir, extension, key_dir) = match repository {
            Repository::Apt { .. } => (APT_SOURCES_DIR, "list", Some(APT_KEYS_DIR)),
            Repository::Yum { .. } => (YUM_REPOS_DIR, "repo", None),
        };

        let mut change = Change::Unchanged;

        if let Some(key_dir) = key_dir {
            let key_path = self.resolve(Path::new(key_dir)).join(format!("{}.asc", repository.name()));
            if !key_path.exists() {
                let key = self.fetch_key(repository.key_url()).await?;
                change = change.or(self.write_file(&key_path, &key, 0o644)?);
            }
        }

        let repo_path = self
            .resolve(Path::new(dir))
            .join(format!("{}.{}", repository.name(), extension));
        let written = self.write_file(&repo_path, repository.render().as_bytes(), 0o644)?;

        if written.is_changed() {
            match repository {
                Repository::Apt { .. } => run("apt-get", &["update"]).await?,
                Repository::Yum { key_url, .. } => run("rpm", &["--import", key_url.as_str()]).await?,
            }
        }

        Ok(change.or(written))
    }

    async fn install_package(&self, name: &str, version: &PackageVersion) -> Result<Change> {
        let before = self.installed_version(name).await?;

        match (self.platform.family, version) {
            (_, PackageVersion::Pinned(wanted)) if before.as_deref() == Some(wanted.as_str()) => {
                tracing::debug!("{} {} already installed", name, wanted);
                return Ok(Change::Unchanged);
            }
            (PlatformFamily::Debian, PackageVersion::Latest) => {
                tracing::info!("Installing latest {}", name);
                run("apt-get", &["install", "-y", "-q", name]).await?;
            }
            (PlatformFamily::Debian, PackageVersion::Pinned(wanted)) => {
                tracing::info!("Installing {} version {}", name, wanted);
                let spec = format!("{}={}", name, wanted);
                run("apt-get", &["install", "-y", "-q", "--allow-downgrades", spec.as_str()]).await?;
            }
            (PlatformFamily::Rhel, PackageVersion::Latest) => {
                tracing::info!("Installing latest {}", name);
                let verb = if before.is_some() { "update" } else { "install" };
                run("yum", &["-y", verb, name]).await?;
            }
            (PlatformFamily::Rhel, PackageVersion::Pinned(wanted)) => {
                tracing::info!("Installing {} version {}", name, wanted);
                let spec = format!("{}-{}", name, wanted);
                run("yum", &["-y", "install", spec.as_str()]).await?;
            }
            (PlatformFamily::Other, _) => unreachable!("installed_version rejects other platforms"),
        }

        let after = self.installed_version(name).await?;
        Ok(Change::from_bool(before != after))
    }

    async fn manage_service(&self, name: &str, actions: &[ServiceAction]) -> Result<Change> {
        let systemd = self.uses_systemd().await;
        let mut change = Change::Unchanged;

        for action in actions {
            let acted = match (action, systemd) {
                (ServiceAction::Enable, true) => {
                    if succeeds("systemctl", &["is-enabled", "--quiet", name]).await {
                        false
                    } else {
                        run("systemctl", &["enable", name]).await?;
                        true
                    }
                }
                (ServiceAction::Enable, false) => {
                    match self.platform.family {
                        PlatformFamily::Rhel => run("chkconfig", &[name, "on"]).await?,
                        _ => run("update-rc.d", &[name, "defaults"]).await?,
                    }
                    false
                }
                (ServiceAction::Start, true) => {
                    if succeeds("systemctl", &["is-active", "--quiet", name]).await {
                        false
                    } else {
                        run("systemctl", &["start", name]).await?;
                        true
                    }
                }
                (ServiceAction::Start, false) => {
                    if succeeds("service", &[name, "status"]).await {
                        false
                    } else {
                        run("service", &[name, "start"]).await?;
                        true
                    }
                }
                (ServiceAction::Restart, true) => {
                    run("systemctl", &["restart", name]).await?;
                    true
                }
                (ServiceAction::Restart, false) => {
                    run("service", &[name, "restart"]).await?;
                    true
                }
            };

            if acted {
                tracing::info!("Service {}: {}", name, action.as_str());
            }
            change = change.or(Change::from_bool(acted));
        }

        Ok(change)
    }

    async fn render_template(&self, request: &TemplateRequest) -> Result<Change> {
        if request.owner != "root" || request.group != "root" {
            anyhow::bail!(
                "Only root ownership is supported, got {}:{}",
                request.owner,
                request.group
            );
        }

        let text = template::load(&request.source)?;
        let rendered = template::render(&text, &request.variables)?;
        self.write_file(&self.resolve(&request.destination), rendered.as_bytes(), request.mode)
    }

    async fn ensure_directory(&self, path: &Path, mode: u32) -> Result<Change> {
        let path = self.resolve(path);
        let created = !path.is_dir();
        if created {
            fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create directory {:?}", path))?;
            tracing::info!("Created directory {:?}", path);
        }
        self.chown_root(&path)?;
        Ok(Change::from_bool(created).or(self.set_mode(&path, mode)?))
    }

    async fn sync_directory(&self, source: &Path, destination: &Path, file_mode: u32) -> Result<Change> {
        if !source.is_dir() {
            anyhow::bail!("Plugin source {:?} is not a directory", source);
        }

        let destination = self.resolve(destination);
        let mut change = Change::Unchanged;

        for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk {:?}", source))?;
            let relative = entry.path().strip_prefix(source)?;
            let target = destination.join(relative);

            if entry.file_type().is_dir() {
                if !target.is_dir() {
                    fs::create_dir_all(&target)
                        .with_context(|| format!("Failed to create directory {:?}", target))?;
                    self.chown_root(&target)?;
                    change = Change::Changed;
                }
                change = change.or(self.set_mode(&target, 0o755)?);
            } else if entry.file_type().is_file() {
                let content = fs::read(entry.path())
                    .with_context(|| format!("Failed to read {:?}", entry.path()))?;
                change = change.or(self.write_file(&target, &content, file_mode)?);
            }
        }

        Ok(change)
    }
}

/// Run a command, failing unless it exits successfully
async fn run(program: &str, args: &[&str]) -> Result<()> {
    tracing::debug!("Running {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .env("DEBIAN_FRONTEND", "noninteractive")
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", program))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "{} {} failed with exit code {}: {}",
            program,
            args.join(" "),
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// Whether a command exits successfully; missing programs count as failure
async fn succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Trimmed stdout of a successful, non-empty command
async fn capture(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!stdout.is_empty()).then_some(stdout)
}
