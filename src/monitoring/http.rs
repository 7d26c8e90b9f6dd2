//! HTTP utilities for Cloud Monitoring REST API calls

use crate::error::{ProvisionError, Result};
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const OBJECT_ID_HEADER: &str = "X-Object-ID";

/// Sanitize response body for logging.
/// Truncates long responses and strips control characters.
fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let cut = (0..=MAX_LOG_BODY_LENGTH)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}... [truncated, {} bytes total]", &body[..cut], body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| c.is_control(), "")
}

/// Pull a human-readable message out of an API error body
fn error_detail(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.pointer("/unauthorized/message"))
                .or_else(|| v.pointer("/badRequest/message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string()
        })
}

/// Result of a POST that created an object
#[derive(Debug, Clone)]
pub struct Created {
    /// Value of the `X-Object-ID` header
    pub object_id: Option<String>,
    /// Value of the `Location` header
    pub location: Option<String>,
    /// Parsed body, `Null` when empty
    pub body: Value,
}

/// HTTP client wrapper for monitoring API calls
#[derive(Clone)]
pub struct MonitoringHttpClient {
    client: Client,
}

impl MonitoringHttpClient {
    /// Create a new HTTP client
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(format!("cmagent/{}", crate::VERSION))
            .build()
            .map_err(|e| ProvisionError::Configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Make a GET request
    pub async fn get(&self, url: &str, token: &str, query: &[(&str, &str)]) -> Result<Value> {
        tracing::debug!("GET {}", url);

        let request = self
            .client
            .get(url)
            .header(AUTH_TOKEN_HEADER, token)
            .query(query);
        let (_, body) = send(request).await?;

        if body.is_empty() {
            return Ok(Value::Null);
        }
        parse_json(&body)
    }

    /// Make a POST request with a JSON body
    pub async fn post(&self, url: &str, token: Option<&str>, body: &Value) -> Result<Created> {
        tracing::debug!("POST {}", url);

        let mut request = self.client.post(url).json(body);
        if let Some(token) = token {
            request = request.header(AUTH_TOKEN_HEADER, token);
        }

        let (headers, response_body) = send(request).await?;

        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Ok(Created {
            object_id: header(OBJECT_ID_HEADER),
            location: header(LOCATION.as_str()),
            body: if response_body.is_empty() {
                Value::Null
            } else {
                parse_json(&response_body)?
            },
        })
    }
}

async fn send(request: RequestBuilder) -> Result<(HeaderMap, String)> {
    let response = request
        .send()
        .await
        .map_err(|e| ProvisionError::transport(format!("failed to send request: {}", e)))?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .text()
        .await
        .map_err(|e| ProvisionError::transport(format!("failed to read response body: {}", e)))?;

    if !status.is_success() {
        // Only log sanitized/truncated error body to avoid leaking sensitive data
        tracing::error!("API error: {} - {}", status, sanitize_for_log(&body));
        return Err(ProvisionError::remote(status.as_u16(), error_detail(status, &body)));
    }

    Ok((headers, body))
}

fn parse_json(body: &str) -> Result<Value> {
    serde_json::from_str(body)
        .map_err(|e| ProvisionError::transport(format!("failed to parse response JSON: {}", e)))
}
