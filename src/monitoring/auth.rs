//! Cloud Monitoring Authentication
//!
//! Resolves API credentials from node attributes, the environment, or an
//! explicit override, and exchanges username/API key for an auth token
//! through the identity service.

use super::http::MonitoringHttpClient;
use crate::config::{keys, NodeAttributes};
use crate::error::{ProvisionError, Result};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Production identity endpoint
pub const DEFAULT_AUTH_URL: &str = "https://identity.api.rackspacecloud.com/v2.0";

/// Monitoring endpoint used when the service catalog has none
pub const DEFAULT_MONITORING_URL: &str = "https://monitoring.api.rackspacecloud.com/v1.0";

/// Service catalog entry for Cloud Monitoring
const MONITORING_SERVICE_NAME: &str = "cloudMonitoring";

/// Refresh tokens this much before they actually expire
const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// TTL used when the identity response carries no usable expiry
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

const ENV_USERNAME: &str = "RACKSPACE_USERNAME";
const ENV_API_KEY: &str = "RACKSPACE_API_KEY";
const ENV_AUTH_URL: &str = "RACKSPACE_AUTH_URL";

/// API credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: Option<String>,
    api_key: Option<String>,
    auth_url: String,
    mock: bool,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("auth_url", &self.auth_url)
            .field("mock", &self.mock)
            .finish()
    }
}

impl Credentials {
    /// Credentials for the live API
    pub fn new(username: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            api_key: Some(api_key.into()),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            mock: false,
        }
    }

    /// Mock-mode credentials. The username selects which in-memory fixture is used.
    pub fn mock(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            api_key: None,
            auth_url: DEFAULT_AUTH_URL.to_string(),
            mock: true,
        }
    }

    /// Resolve credentials for a run.
    ///
    /// An explicit override wins outright. Otherwise each field comes from the
    /// environment (`RACKSPACE_USERNAME`, `RACKSPACE_API_KEY`,
    /// `RACKSPACE_AUTH_URL`) and falls back to node attributes.
    pub fn resolve(node: &NodeAttributes, override_credentials: Option<&Credentials>) -> Result<Self> {
        Self::resolve_with_env(node, override_credentials, |name| std::env::var(name).ok())
    }

    pub(crate) fn resolve_with_env<F>(
        node: &NodeAttributes,
        override_credentials: Option<&Credentials>,
        env: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(credentials) = override_credentials {
            return Ok(credentials.clone());
        }

        let lookup = |var: &str, key: &str| {
            env(var)
                .filter(|v| !v.is_empty())
                .or_else(|| node.get_str(key).map(str::to_string))
        };

        let auth_url = lookup(ENV_AUTH_URL, keys::AUTH_URL)
            .unwrap_or_else(|| DEFAULT_AUTH_URL.to_string());
        validate_auth_url(&auth_url)?;

        let credentials = Self {
            username: lookup(ENV_USERNAME, keys::USERNAME),
            api_key: lookup(ENV_API_KEY, keys::API_KEY),
            auth_url,
            mock: node.get_bool(keys::MOCK),
        };

        tracing::debug!("Resolved credentials: {:?}", credentials);
        Ok(credentials)
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_auth_url(mut self, auth_url: impl Into<String>) -> Result<Self> {
        let auth_url = auth_url.into();
        validate_auth_url(&auth_url)?;
        self.auth_url = auth_url;
        Ok(self)
    }

    pub fn with_mock(mut self, mock: bool) -> Self {
        self.mock = mock;
        self
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    pub fn is_mock(&self) -> bool {
        self.mock
    }

    /// Username and API key for a real API call
    pub fn require_live(&self) -> Result<(&str, &str)> {
        match (self.username.as_deref(), self.api_key.as_deref()) {
            (Some(username), Some(api_key)) if !username.is_empty() && !api_key.is_empty() => {
                Ok((username, api_key))
            }
            _ => Err(ProvisionError::Configuration(
                "either mock mode or both username and api_key must be set".to_string(),
            )),
        }
    }
}

fn validate_auth_url(auth_url: &str) -> Result<()> {
    let parsed = url::Url::parse(auth_url).map_err(|e| {
        ProvisionError::Configuration(format!("invalid auth_url {:?}: {}", auth_url, e))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ProvisionError::Configuration(format!(
            "auth_url must be http or https, got {}",
            scheme
        ))),
    }
}

/// Authenticated API session, cached until shortly before it expires
#[derive(Clone)]
pub struct IdentitySession {
    credentials: Credentials,
    http: MonitoringHttpClient,
    cache: Arc<RwLock<Option<CachedSession>>>,
}

#[derive(Clone)]
struct CachedSession {
    token: String,
    endpoint: String,
    /// When this token expires (with buffer applied)
    expires_at: Instant,
}

impl CachedSession {
    fn is_valid(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Auth token and monitoring endpoint for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub endpoint: String,
}

impl IdentitySession {
    pub fn new(credentials: Credentials, http: MonitoringHttpClient) -> Self {
        Self {
            credentials,
            http,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Current auth token and endpoint, authenticating if needed
    pub async fn session(&self) -> Result<Session> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.is_valid() {
                    return Ok(Session {
                        token: cached.token.clone(),
                        endpoint: cached.endpoint.clone(),
                    });
                }
                tracing::debug!("Cached auth token expired, re-authenticating");
            }
        }

        let fresh = self.authenticate().await?;
        let session = Session {
            token: fresh.token.clone(),
            endpoint: fresh.endpoint.clone(),
        };

        *self.cache.write().await = Some(fresh);
        Ok(session)
    }

    /// Drop the cached token and authenticate again
    pub async fn refresh(&self) -> Result<Session> {
        *self.cache.write().await = None;
        self.session().await
    }

    async fn authenticate(&self) -> Result<CachedSession> {
        let (username, api_key) = self.credentials.require_live()?;

        let url = format!("{}/tokens", self.credentials.auth_url.trim_end_matches('/'));
        let body = json!({
            "auth": {
                "RAX-KSKEY:apiKeyCredentials": {
                    "username": username,
                    "apiKey": api_key,
                }
            }
        });

        tracing::info!("Authenticating as {} against {}", username, self.credentials.auth_url);
        let response = self.http.post(&url, None, &body).await?;
        let session = parse_identity_response(&response.body)?;

        tracing::debug!(
            "Authenticated, monitoring endpoint {}, token valid for ~{} minutes",
            session.endpoint,
            session.expires_at.saturating_duration_since(Instant::now()).as_secs() / 60
        );
        Ok(session)
    }
}

fn parse_identity_response(body: &Value) -> Result<CachedSession> {
    let access = body.get("access").ok_or_else(|| {
        ProvisionError::transport("identity response has no access section")
    })?;

    let token = access
        .pointer("/token/id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProvisionError::transport("identity response has no token id"))?
        .to_string();

    let ttl = access
        .pointer("/token/expires")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .and_then(|expires| (expires.with_timezone(&chrono::Utc) - chrono::Utc::now()).to_std().ok())
        .unwrap_or(DEFAULT_TOKEN_TTL);

    let endpoint = monitoring_endpoint(access)
        .or_else(|| {
            access
                .pointer("/token/tenant/id")
                .and_then(|v| v.as_str())
                .map(|tenant| format!("{}/{}", DEFAULT_MONITORING_URL, tenant))
        })
        .ok_or_else(|| {
            ProvisionError::transport("identity response has neither a monitoring endpoint nor a tenant")
        })?;

    Ok(CachedSession {
        token,
        endpoint: endpoint.trim_end_matches('/').to_string(),
        expires_at: Instant::now() + ttl.saturating_sub(TOKEN_EXPIRY_BUFFER),
    })
}

fn monitoring_endpoint(access: &Value) -> Option<String> {
    access
        .get("serviceCatalog")?
        .as_array()?
        .iter()
        .find(|service| service.get("name").and_then(|n| n.as_str()) == Some(MONITORING_SERVICE_NAME))?
        .get("endpoints")?
        .as_array()?
        .first()?
        .get("publicURL")?
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_resolve_from_attributes() {
        let node = NodeAttributes::from_value(json!({
            "rackspace": {"cloud_credentials": {"username": "Mr. Mockson", "api_key": "Woodruff"}},
            "rackspace_cloudmonitoring": {"mock": true}
        }));

        let creds = Credentials::resolve_with_env(&node, None, no_env).unwrap();
        assert!(creds.is_mock());
        assert_eq!(creds.username(), Some("Mr. Mockson"));
        assert_eq!(creds.auth_url(), DEFAULT_AUTH_URL);
        assert_eq!(creds.require_live().unwrap(), ("Mr. Mockson", "Woodruff"));
    }

    #[test]
    fn test_environment_beats_attributes() {
        let node = NodeAttributes::from_value(json!({
            "rackspace": {"cloud_credentials": {"username": "from-node", "api_key": "node-key"}}
        }));
        let env = |name: &str| match name {
            "RACKSPACE_USERNAME" => Some("from-env".to_string()),
            _ => None,
        };

        let creds = Credentials::resolve_with_env(&node, None, env).unwrap();
        assert_eq!(creds.username(), Some("from-env"));
        assert_eq!(creds.require_live().unwrap().1, "node-key");
    }

    #[test]
    fn test_override_wins() {
        let node = NodeAttributes::from_value(json!({"rackspace_cloudmonitoring": {"mock": true}}));
        let explicit = Credentials::new("explicit", "key");

        let creds = Credentials::resolve_with_env(&node, Some(&explicit), no_env).unwrap();
        assert_eq!(creds, explicit);
        assert!(!creds.is_mock());
    }

    #[test]
    fn test_missing_credentials_fail_only_when_live_call_needed() {
        let creds = Credentials::resolve_with_env(&NodeAttributes::new(), None, no_env).unwrap();
        assert!(matches!(
            creds.require_live(),
            Err(ProvisionError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_auth_url_rejected() {
        let node = NodeAttributes::from_value(json!({
            "rackspace_cloudmonitoring": {"auth": {"url": "ftp://identity.example.com"}}
        }));
        assert!(matches!(
            Credentials::resolve_with_env(&node, None, no_env),
            Err(ProvisionError::Configuration(_))
        ));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let creds = Credentials::new("user", "super-secret");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_parse_identity_response_prefers_catalog() {
        let body = json!({
            "access": {
                "token": {"id": "auth-tok", "expires": "2999-01-01T00:00:00Z", "tenant": {"id": "123"}},
                "serviceCatalog": [
                    {"name": "cloudFiles", "endpoints": [{"publicURL": "https://files"}]},
                    {"name": "cloudMonitoring", "endpoints": [{"publicURL": "https://mon.example/v1.0/123/"}]}
                ]
            }
        });

        let session = parse_identity_response(&body).unwrap();
        assert_eq!(session.token, "auth-tok");
        assert_eq!(session.endpoint, "https://mon.example/v1.0/123");
        assert!(session.is_valid());
    }

    #[test]
    fn test_parse_identity_response_falls_back_to_tenant() {
        let body = json!({"access": {"token": {"id": "t", "tenant": {"id": "987"}}}});
        let session = parse_identity_response(&body).unwrap();
        assert_eq!(session.endpoint, format!("{}/987", DEFAULT_MONITORING_URL));
    }
}
