//! Dry-run host: logs each operation instead of performing it

use super::platform::Repository;
use super::{template, Change, Host, PackageVersion, ServiceAction, TemplateRequest};
use anyhow::Result;
use std::path::Path;

#[derive(Debug, Default)]
pub struct DryRunHost;

impl Host for DryRunHost {
    async fn add_repository(&self, repository: &Repository) -> Result<Change> {
        tracing::info!(
            "[dry-run] would add repository {}: {}",
            repository.name(),
            repository.render().trim()
        );
        Ok(Change::Unchanged)
    }

    async fn install_package(&self, name: &str, version: &PackageVersion) -> Result<Change> {
        tracing::info!("[dry-run] would install {} ({})", name, version);
        Ok(Change::Unchanged)
    }

    async fn manage_service(&self, name: &str, actions: &[ServiceAction]) -> Result<Change> {
        let actions: Vec<&str> = actions.iter().map(ServiceAction::as_str).collect();
        tracing::info!("[dry-run] would {} service {}", actions.join(", "), name);
        Ok(Change::Unchanged)
    }

    async fn render_template(&self, request: &TemplateRequest) -> Result<Change> {
        // Render anyway so template errors still surface
        let text = template::load(&request.source)?;
        template::render(&text, &request.variables)?;
        tracing::info!(
            "[dry-run] would render {:?} ({}:{} {:o})",
            request.destination,
            request.owner,
            request.group,
            request.mode
        );
        Ok(Change::Unchanged)
    }

    async fn ensure_directory(&self, path: &Path, mode: u32) -> Result<Change> {
        tracing::info!("[dry-run] would ensure directory {:?} ({:o})", path, mode);
        Ok(Change::Unchanged)
    }

    async fn sync_directory(&self, source: &Path, destination: &Path, file_mode: u32) -> Result<Change> {
        tracing::info!(
            "[dry-run] would copy {:?} into {:?} (files {:o})",
            source,
            destination,
            file_mode
        );
        Ok(Change::Unchanged)
    }
}
