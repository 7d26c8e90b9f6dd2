//! Config file templates

use super::TemplateSource;
use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior};
use std::collections::BTreeMap;

/// Built-in agent configuration template
pub const AGENT_CONFIG_TEMPLATE: &str = "monitoring_id {{ monitoring_id }}\nmonitoring_token {{ monitoring_token }}\n";

pub const AGENT_TEMPLATE_NAME: &str = "rackspace-monitoring-agent";

/// Load the template text for `source`
pub fn load(source: &TemplateSource) -> Result<String> {
    match source {
        TemplateSource::Builtin { source, .. } => Ok(source.to_string()),
        TemplateSource::File(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template {:?}", path)),
    }
}

/// Render `template`. Undefined variables are an error so a config file is
/// never written with blanks in it.
pub fn render(template: &str, variables: &BTreeMap<String, String>) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);

    let tmpl = env
        .template_from_str(template)
        .context("Failed to parse template")?;
    tmpl.render(minijinja::Value::from_serialize(variables))
        .context("Failed to render template")
}
