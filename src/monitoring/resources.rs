//! Monitoring API resource types

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// A resource living in one of the API's collections
pub trait Resource: DeserializeOwned + Clone + Send + Sync + 'static {
    /// Attributes needed to create the resource
    type Draft: Serialize + Send + Sync;

    /// Collection path segment, e.g. `agent_tokens`
    const COLLECTION: &'static str;

    fn id(&self) -> &str;

    /// Natural key
    fn label(&self) -> &str;

    /// Record the parent object of a scoped collection
    fn attach_parent(&mut self, _parent_id: &str) {}
}

/// Agent authentication token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentToken {
    pub id: String,
    /// Optional in the API; unlabelled tokens read as `""`
    #[serde(default, deserialize_with = "nullable_string")]
    pub label: String,
    /// Secret value; the API hands back the id here
    #[serde(default, deserialize_with = "nullable_string")]
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewAgentToken {
    pub label: String,
}

impl Resource for AgentToken {
    type Draft = NewAgentToken;
    const COLLECTION: &'static str = "agent_tokens";

    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }
}

impl AgentToken {
    /// The secret, falling back to the id for responses that omit it
    pub fn secret(&self) -> &str {
        if self.token.is_empty() {
            &self.id
        } else {
            &self.token
        }
    }
}

/// Monitored entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub label: String,
    #[serde(default, deserialize_with = "nullable_map")]
    pub ip_addresses: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "nullable_map")]
    pub metadata: BTreeMap<String, String>,
}

/// The API sends `null` rather than `{}` for unset maps
fn nullable_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NewEntity {
    pub label: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub ip_addresses: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Resource for Entity {
    type Draft = NewEntity;
    const COLLECTION: &'static str = "entities";

    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Alarm attached to an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub label: String,
    pub check_id: String,
    pub notification_plan_id: String,
    /// Owning entity; not part of the API payload
    #[serde(skip)]
    pub entity_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewAlarm {
    pub label: String,
    pub check_id: String,
    pub notification_plan_id: String,
}

impl Resource for Alarm {
    type Draft = NewAlarm;
    const COLLECTION: &'static str = "alarms";

    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn attach_parent(&mut self, parent_id: &str) {
        self.entity_id = parent_id.to_string();
    }
}
