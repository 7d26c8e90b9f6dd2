//! Platform detection and package repository selection

use std::collections::HashMap;
use std::path::Path;

const PACKAGE_HOST: &str = "http://stable.packages.cloudmonitoring.rackspace.com";
const KEY_BASE: &str = "https://monitoring.api.rackspacecloud.com/pki/agent";

pub const REPOSITORY_NAME: &str = "cloud-monitoring";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformFamily {
    Debian,
    Rhel,
    Other,
}

/// Operating system identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// Distribution name: `ubuntu`, `debian`, `centos`, `redhat`, ...
    pub name: String,
    pub family: PlatformFamily,
    pub version: String,
    /// Release codename, e.g. `bookworm`
    pub codename: Option<String>,
    /// Kernel machine, e.g. `x86_64`
    pub machine: String,
}

impl Platform {
    /// Detect the running platform from `/etc/os-release`
    pub fn detect() -> Self {
        let content = ["/etc/os-release", "/usr/lib/os-release"]
            .iter()
            .map(Path::new)
            .find_map(|p| std::fs::read_to_string(p).ok())
            .unwrap_or_default();

        let platform = Self::from_os_release(&content, std::env::consts::ARCH);
        tracing::debug!("Detected platform: {:?}", platform);
        platform
    }

    /// Parse `os-release` contents
    pub fn from_os_release(content: &str, machine: &str) -> Self {
        let fields: HashMap<&str, String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim().trim_matches('"').trim_matches('\'').to_string()))
            .collect();

        let id = fields.get("ID").map(String::as_str).unwrap_or("unknown");
        let name = match id {
            "rhel" => "redhat",
            other => other,
        }
        .to_string();

        let like = fields.get("ID_LIKE").map(String::as_str).unwrap_or("");
        let is = |candidates: &[&str]| {
            candidates.contains(&id) || like.split_whitespace().any(|l| candidates.contains(&l))
        };
        let family = if is(&["debian", "ubuntu"]) {
            PlatformFamily::Debian
        } else if is(&["rhel", "centos", "fedora"]) {
            PlatformFamily::Rhel
        } else {
            PlatformFamily::Other
        };

        Self {
            name,
            family,
            version: fields.get("VERSION_ID").cloned().unwrap_or_default(),
            codename: fields
                .get("VERSION_CODENAME")
                .or_else(|| fields.get("UBUNTU_CODENAME"))
                .filter(|c| !c.is_empty())
                .cloned(),
            machine: machine.to_string(),
        }
    }

    /// Major release, e.g. `7` for `7.9`
    pub fn major_version(&self) -> &str {
        self.version.split('.').next().unwrap_or("")
    }
}

/// Package repository for the monitoring agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repository {
    Apt {
        name: String,
        uri: String,
        distribution: String,
        components: Vec<String>,
        key_url: String,
    },
    Yum {
        name: String,
        description: String,
        baseurl: String,
        key_url: String,
    },
}

impl Repository {
    /// Repository serving the agent on `platform`, if there is one
    pub fn for_platform(platform: &Platform) -> Option<Self> {
        match platform.family {
            PlatformFamily::Debian => {
                let release = if platform.name == "ubuntu" {
                    format!("ubuntu-{}", platform.version)
                } else {
                    format!("debian-{}", platform.codename.as_deref()?)
                };
                Some(Repository::Apt {
                    name: REPOSITORY_NAME.to_string(),
                    uri: format!("{}/{}-{}", PACKAGE_HOST, release, platform.machine),
                    distribution: "cloudmonitoring".to_string(),
                    components: vec!["main".to_string()],
                    key_url: format!("{}/linux.asc", KEY_BASE),
                })
            }
            PlatformFamily::Rhel => {
                let major = platform.major_version();
                // Release 5 of CentOS and RHEL are signed with their own keys
                let key = match (platform.name.as_str(), major) {
                    ("centos", "5") => "centos-5.asc",
                    ("redhat", "5") => "redhat-5.asc",
                    _ => "linux.asc",
                };
                Some(Repository::Yum {
                    name: REPOSITORY_NAME.to_string(),
                    description: "Rackspace Monitoring".to_string(),
                    baseurl: format!("{}/{}-{}-{}", PACKAGE_HOST, platform.name, major, platform.machine),
                    key_url: format!("{}/{}", KEY_BASE, key),
                })
            }
            PlatformFamily::Other => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Repository::Apt { name, .. } | Repository::Yum { name, .. } => name,
        }
    }

    pub fn key_url(&self) -> &str {
        match self {
            Repository::Apt { key_url, .. } | Repository::Yum { key_url, .. } => key_url,
        }
    }

    /// Contents of the apt source list or yum repo file
    pub fn render(&self) -> String {
        match self {
            Repository::Apt {
                uri,
                distribution,
                components,
                ..
            } => format!("deb {} {} {}\n", uri, distribution, components.join(" ")),
            Repository::Yum {
                name,
                description,
                baseurl,
                key_url,
            } => format!(
                "[{}]\nname={}\nbaseurl={}\nenabled=1\ngpgcheck=1\ngpgkey={}\n",
                name, description, baseurl, key_url
            ),
        }
    }
}
