//! Cloud Monitoring Client
//!
//! Main client for the monitoring API, combining credentials, the identity
//! session and the HTTP client behind the token, entity and alarm
//! collections. In mock mode the same collections are served from an
//! in-memory fixture.

use super::auth::{Credentials, IdentitySession};
use super::collection::Collection;
use super::http::MonitoringHttpClient;
use super::mock::MockFixture;
use super::resources::{AgentToken, Alarm, Entity, Resource};
use crate::error::{ProvisionError, Result};
use serde_json::Value;
use std::collections::HashSet;

/// Where collection calls are served from
#[derive(Clone)]
pub enum Backend {
    Live(LiveBackend),
    Mock(MockFixture),
}

impl Backend {
    pub(crate) async fn list(&self, path: &str) -> Result<Vec<Value>> {
        match self {
            Backend::Live(live) => live.list(path).await,
            Backend::Mock(fixture) => fixture.list(path),
        }
    }

    pub(crate) async fn create(&self, path: &str, attributes: Value) -> Result<Value> {
        match self {
            Backend::Live(live) => live.create(path, attributes).await,
            Backend::Mock(fixture) => fixture.create(path, attributes),
        }
    }
}

/// REST backend talking to the real API
#[derive(Clone)]
pub struct LiveBackend {
    http: MonitoringHttpClient,
    session: IdentitySession,
}

impl LiveBackend {
    pub fn new(credentials: Credentials) -> Result<Self> {
        let http = MonitoringHttpClient::new()?;
        let session = IdentitySession::new(credentials, http.clone());
        Ok(Self { http, session })
    }

    /// List a collection, following `next_marker` through every page
    async fn list(&self, path: &str) -> Result<Vec<Value>> {
        let session = self.session.session().await?;
        let url = format!("{}/{}", session.endpoint, path);

        let mut all_items = Vec::new();
        let mut marker: Option<String> = None;
        let mut seen_markers = HashSet::new();

        loop {
            let query: Vec<(&str, &str)> = match marker.as_deref() {
                Some(m) => vec![("marker", m)],
                None => Vec::new(),
            };
            let response = self.http.get(&url, &session.token, &query).await?;

            if let Some(values) = response.get("values").and_then(|v| v.as_array()) {
                all_items.extend(values.iter().cloned());
            }

            let next = response
                .pointer("/metadata/next_marker")
                .and_then(|v| v.as_str())
                .filter(|m| !m.is_empty())
                .map(str::to_string);

            match next {
                Some(next) if seen_markers.insert(next.clone()) => marker = Some(next),
                Some(next) => {
                    tracing::warn!("Pagination of {} revisited marker {}, stopping", path, next);
                    break;
                }
                None => break,
            }
        }

        Ok(all_items)
    }

    /// Create an object, then fetch it back to pick up server-assigned fields
    async fn create(&self, path: &str, attributes: Value) -> Result<Value> {
        let session = self.session.session().await?;
        let url = format!("{}/{}", session.endpoint, path);

        let created = self.http.post(&url, Some(&session.token), &attributes).await?;

        if created.body.get("id").is_some() {
            return Ok(created.body);
        }

        let object_url = match (created.object_id, created.location) {
            (Some(id), _) => format!("{}/{}", url, urlencoding::encode(&id)),
            (None, Some(location)) => location,
            (None, None) => {
                return Err(ProvisionError::transport(format!(
                    "create on {} returned no object id",
                    path
                )))
            }
        };

        self.http.get(&object_url, &session.token, &[]).await
    }
}

/// Monitoring API client
pub struct MonitoringClient {
    credentials: Credentials,
    backend: Backend,
    agent_tokens: Collection<AgentToken>,
    entities: Collection<Entity>,
}

impl MonitoringClient {
    /// Create a client. Nothing is sent until a collection is used; mock
    /// credentials select the shared fixture for their username.
    pub fn new(credentials: Credentials) -> Result<Self> {
        let backend = if credentials.is_mock() {
            let username = credentials.username().unwrap_or("mock");
            tracing::info!("Mock mode: serving monitoring API from fixture {:?}", username);
            Backend::Mock(MockFixture::shared(username))
        } else {
            Backend::Live(LiveBackend::new(credentials.clone())?)
        };

        Ok(Self::with_backend(credentials, backend))
    }

    /// Create a mock-mode client over a specific fixture
    pub fn with_fixture(credentials: Credentials, fixture: MockFixture) -> Self {
        Self::with_backend(credentials, Backend::Mock(fixture))
    }

    fn with_backend(credentials: Credentials, backend: Backend) -> Self {
        Self {
            agent_tokens: Collection::new(backend.clone()),
            entities: Collection::new(backend.clone()),
            credentials,
            backend,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn is_mock(&self) -> bool {
        matches!(self.backend, Backend::Mock(_))
    }

    pub fn agent_tokens(&self) -> &Collection<AgentToken> {
        &self.agent_tokens
    }

    pub fn entities(&self) -> &Collection<Entity> {
        &self.entities
    }

    /// Alarms belonging to `entity`
    pub fn alarms(&self, entity: &Entity) -> Collection<Alarm> {
        Collection::scoped(self.backend.clone(), Entity::COLLECTION, &entity.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_credentials_select_mock_backend() {
        let client = MonitoringClient::new(Credentials::mock("client-test")).unwrap();
        assert!(client.is_mock());
        assert_eq!(client.agent_tokens().path(), "agent_tokens");
    }

    #[test]
    fn test_live_client_construction_does_not_need_credentials() {
        let creds = Credentials::mock("unused").with_mock(false);
        let client = MonitoringClient::new(creds).unwrap();
        assert!(!client.is_mock());
    }

    #[test]
    fn test_alarm_collection_is_scoped() {
        let client = MonitoringClient::with_fixture(Credentials::mock("scoped"), MockFixture::new());
        let entity = Entity {
            id: "enAB".to_string(),
            label: "web01".to_string(),
            ip_addresses: Default::default(),
            metadata: Default::default(),
        };
        assert_eq!(client.alarms(&entity).path(), "entities/enAB/alarms");
    }
}
