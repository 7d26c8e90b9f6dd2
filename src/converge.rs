//! Convergence run
//!
//! Brings a host to the configured state: package repository, agent token
//! and id, agent config file, package, service, and plugin directory.
//! The agent itself is only configured once a token and id are known; when
//! they cannot be obtained the run carries on without touching the agent.

use crate::config::NodeAttributes;
use crate::error::ProvisionError;
use crate::host::template::{AGENT_CONFIG_TEMPLATE, AGENT_TEMPLATE_NAME};
use crate::host::{
    Host, PackageVersion, Platform, Repository, ServiceAction, TemplateRequest, TemplateSource,
};
use crate::monitoring::MonitoringClient;
use crate::provision;
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const AGENT_PACKAGE: &str = "rackspace-monitoring-agent";
pub const AGENT_SERVICE: &str = "rackspace-monitoring-agent";
pub const AGENT_CONFIG_PATH: &str = "/etc/rackspace-monitoring-agent.cfg";

const CONFIG_MODE: u32 = 0o600;
const PLUGIN_MODE: u32 = 0o755;

/// Where the agent token and id stand for this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionState {
    /// Both token and id are known
    Resolved { token: String, id: String },
    /// Token or id is missing and no attempt has been made yet
    NeedsProvisioning,
    /// Provisioning ran but token or id is still missing
    Failed,
}

impl ProvisionState {
    /// State as recorded in node attributes
    pub fn of(node: &NodeAttributes) -> Self {
        match (node.agent_token(), node.agent_id()) {
            (Some(token), Some(id)) => ProvisionState::Resolved {
                token: token.to_string(),
                id: id.to_string(),
            },
            _ => ProvisionState::NeedsProvisioning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentStatus {
    Configured { id: String },
    /// Token or id unavailable; nothing agent-related was touched
    Skipped { reason: String },
}

/// Summary of a convergence run
#[derive(Debug, Clone)]
pub struct ConvergeReport {
    pub agent: AgentStatus,
    /// Whether the monitoring API was consulted
    pub provisioned: bool,
    /// Resources that changed, e.g. `service[rackspace-monitoring-agent]`
    pub changes: Vec<String>,
}

/// Drives one convergence run against a monitoring client and a host
pub struct Converger<'a, H: Host> {
    client: &'a MonitoringClient,
    host: &'a H,
    platform: Platform,
}

impl<'a, H: Host> Converger<'a, H> {
    pub fn new(client: &'a MonitoringClient, host: &'a H, platform: Platform) -> Self {
        Self {
            client,
            host,
            platform,
        }
    }

    /// Resolve the agent token and id, calling the API only when one is missing.
    ///
    /// Results are written back to `node`: the token's secret as the agent
    /// token and the token's label as the agent id.
    pub async fn provision(&self, node: &mut NodeAttributes) -> Result<ProvisionState, ProvisionError> {
        if let state @ ProvisionState::Resolved { .. } = ProvisionState::of(node) {
            tracing::debug!("Agent token and id already set, skipping provisioning");
            return Ok(state);
        }

        let label = node.hostname().ok_or_else(|| {
            ProvisionError::Configuration("cannot determine node hostname".to_string())
        })?;
        let existing_token = node.agent_token().map(str::to_string);

        tracing::info!("Agent token or id missing, provisioning token for {}", label);
        let token =
            provision::find_or_create_token(self.client, existing_token.as_deref(), &label).await?;

        // The API calls it label, the agent config calls it id
        node.set_agent_token(token.secret());
        node.set_agent_id(&token.label);

        match ProvisionState::of(node) {
            resolved @ ProvisionState::Resolved { .. } => Ok(resolved),
            _ => Ok(ProvisionState::Failed),
        }
    }

    /// Run the full convergence
    pub async fn converge(&self, node: &mut NodeAttributes) -> Result<ConvergeReport> {
        let mut changes = Vec::new();

        match Repository::for_platform(&self.platform) {
            Some(repository) => {
                if self.host.add_repository(&repository).await?.is_changed() {
                    changes.push(format!("repository[{}]", repository.name()));
                }
            }
            None => tracing::warn!(
                "No agent package repository for platform {}, relying on system repositories",
                self.platform.name
            ),
        }

        let provisioned = ProvisionState::of(node) == ProvisionState::NeedsProvisioning;
        let agent = match self.provision(node).await? {
            ProvisionState::Resolved { token, id } => {
                self.configure_agent(node, &token, &id, &mut changes).await?;
                AgentStatus::Configured { id }
            }
            _ => {
                tracing::warn!("Unable to determine agent token and id: Not configuring agent");
                AgentStatus::Skipped {
                    reason: "Unable to determine agent token and id".to_string(),
                }
            }
        };

        self.sync_plugins(node, &mut changes).await?;

        Ok(ConvergeReport {
            agent,
            provisioned,
            changes,
        })
    }

    async fn configure_agent(
        &self,
        node: &NodeAttributes,
        token: &str,
        id: &str,
        changes: &mut Vec<String>,
    ) -> Result<()> {
        let source = match node.template_override(AGENT_TEMPLATE_NAME) {
            Some(path) => TemplateSource::File(path),
            None => TemplateSource::Builtin {
                name: AGENT_TEMPLATE_NAME,
                source: AGENT_CONFIG_TEMPLATE,
            },
        };

        let request = TemplateRequest {
            source,
            destination: PathBuf::from(AGENT_CONFIG_PATH),
            owner: "root".to_string(),
            group: "root".to_string(),
            mode: CONFIG_MODE,
            variables: BTreeMap::from([
                ("monitoring_id".to_string(), id.to_string()),
                ("monitoring_token".to_string(), token.to_string()),
            ]),
        };

        let config_changed = self.host.render_template(&request).await?;
        if config_changed.is_changed() {
            changes.push(format!("template[{}]", AGENT_CONFIG_PATH));
        }

        let version = PackageVersion::parse(node.agent_version());
        match &version {
            PackageVersion::Latest => tracing::info!("Installing latest agent"),
            PackageVersion::Pinned(v) => tracing::info!("Installing agent version {}", v),
        }
        let package_changed = self.host.install_package(AGENT_PACKAGE, &version).await?;
        if package_changed.is_changed() {
            changes.push(format!("package[{}]", AGENT_PACKAGE));
        }

        let mut actions = vec![ServiceAction::Enable, ServiceAction::Start];
        if config_changed.or(package_changed).is_changed() {
            actions.push(ServiceAction::Restart);
        }
        if self.host.manage_service(AGENT_SERVICE, &actions).await?.is_changed() {
            changes.push(format!("service[{}]", AGENT_SERVICE));
        }

        Ok(())
    }

    /// The plugin directory is managed even when the agent is not
    async fn sync_plugins(&self, node: &NodeAttributes, changes: &mut Vec<String>) -> Result<()> {
        let plugin_path = node.plugin_path();

        if self.host.ensure_directory(&plugin_path, PLUGIN_MODE).await?.is_changed() {
            changes.push(format!("directory[{}]", plugin_path.display()));
        }

        for (source, path) in node.plugins() {
            let from = Path::new(&source).join(&path);
            tracing::debug!("Syncing plugins from {} ({:?})", source, from);
            if self
                .host
                .sync_directory(&from, &plugin_path, PLUGIN_MODE)
                .await?
                .is_changed()
            {
                changes.push(format!("plugins[{}]", source));
            }
        }

        Ok(())
    }
}
