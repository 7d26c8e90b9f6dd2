//! Node Attributes
//!
//! The hierarchical key/value store a convergence run reads its inputs from
//! and writes the resolved agent token and id back to. Stored on disk as
//! JSON (or YAML when the file name ends in `.yaml`/`.yml`).

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Attribute paths used by the agent workflow
pub mod keys {
    pub const AGENT_TOKEN: &str = "rackspace_cloudmonitoring.config.agent.token";
    pub const AGENT_ID: &str = "rackspace_cloudmonitoring.config.agent.id";
    pub const AGENT_VERSION: &str = "rackspace_cloudmonitoring.agent.version";
    pub const PLUGIN_PATH: &str = "rackspace_cloudmonitoring.agent.plugin_path";
    pub const PLUGINS: &str = "rackspace_cloudmonitoring.agent.plugins";
    pub const TEMPLATES: &str = "rackspace_cloudmonitoring.templates_cookbook";
    pub const MOCK: &str = "rackspace_cloudmonitoring.mock";
    pub const AUTH_URL: &str = "rackspace_cloudmonitoring.auth.url";
    pub const USERNAME: &str = "rackspace.cloud_credentials.username";
    pub const API_KEY: &str = "rackspace.cloud_credentials.api_key";
    pub const HOSTNAME: &str = "hostname";
}

pub const DEFAULT_AGENT_VERSION: &str = "latest";
pub const DEFAULT_PLUGIN_PATH: &str = "/usr/lib/rackspace-monitoring-agent/plugins";

/// Node attribute store
#[derive(Debug, Clone, Default)]
pub struct NodeAttributes {
    root: Map<String, Value>,
    /// Where `save` writes to; `None` for in-memory attributes
    path: Option<PathBuf>,
}

impl NodeAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build attributes from a JSON document. Non-object documents yield an empty store.
    pub fn from_value(value: Value) -> Self {
        let root = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { root, path: None }
    }

    /// Default attributes file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("cmagent").join("node.json"))
    }

    /// Load attributes from disk. A missing file yields an empty store bound to `path`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No attributes file at {:?}, starting empty", path);
            return Ok(Self {
                root: Map::new(),
                path: Some(path.to_path_buf()),
            });
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read attributes file {:?}", path))?;

        let value: Value = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML attributes in {:?}", path))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON attributes in {:?}", path))?
        };

        let Value::Object(root) = value else {
            anyhow::bail!("Attributes file {:?} must contain a mapping at the top level", path);
        };

        Ok(Self {
            root,
            path: Some(path.to_path_buf()),
        })
    }

    /// Save attributes back to the file they were loaded from
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let root = Value::Object(self.root.clone());
        let content = if is_yaml(path) {
            serde_yaml::to_string(&root)?
        } else {
            serde_json::to_string_pretty(&root)?
        };
        // Holds the agent token and possibly the API key: owner-only (0600)
        let mut staging = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temporary file in {:?}", parent))?;
        staging
            .write_all(content.as_bytes())
            .with_context(|| format!("Failed to write attributes file {:?}", path))?;
        staging
            .persist(path)
            .with_context(|| format!("Failed to write attributes file {:?}", path))?;

        tracing::debug!("Saved node attributes to {:?}", path);
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Look up a dotted attribute path
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.root.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// String attribute; null, missing and empty values all read as `None`
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn get_bool(&self, path: &str) -> bool {
        self.get(path).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Set a dotted attribute path, creating intermediate mappings as needed
    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        let parts: Vec<&str> = path.split('.').collect();
        let Some((last, parents)) = parts.split_last() else {
            return;
        };

        let mut current = &mut self.root;
        for part in parents {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => unreachable!("entry was just replaced with an object"),
            };
        }
        current.insert(last.to_string(), value.into());
    }

    // =========================================================================
    // Agent attributes
    // =========================================================================

    pub fn agent_token(&self) -> Option<&str> {
        self.get_str(keys::AGENT_TOKEN)
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.get_str(keys::AGENT_ID)
    }

    pub fn set_agent_token(&mut self, token: &str) {
        self.set(keys::AGENT_TOKEN, token);
    }

    pub fn set_agent_id(&mut self, id: &str) {
        self.set(keys::AGENT_ID, id);
    }

    /// Pinned package version, or `latest`
    pub fn agent_version(&self) -> &str {
        self.get_str(keys::AGENT_VERSION)
            .unwrap_or(DEFAULT_AGENT_VERSION)
    }

    pub fn plugin_path(&self) -> PathBuf {
        PathBuf::from(self.get_str(keys::PLUGIN_PATH).unwrap_or(DEFAULT_PLUGIN_PATH))
    }

    /// Plugin sources (source identifier -> path), sorted by source
    pub fn plugins(&self) -> BTreeMap<String, String> {
        self.get(keys::PLUGINS)
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(source, path)| {
                        path.as_str().map(|p| (source.clone(), p.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Template file overriding the built-in template called `name`
    pub fn template_override(&self, name: &str) -> Option<PathBuf> {
        self.get(keys::TEMPLATES)
            .and_then(|v| v.get(name))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
    }

    /// Node hostname: the `hostname` attribute, else the system hostname
    pub fn hostname(&self) -> Option<String> {
        if let Some(name) = self.get_str(keys::HOSTNAME) {
            return Some(name.to_string());
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
