//! Error types for provisioning against the Cloud Monitoring API.

use thiserror::Error;

/// Errors raised while resolving credentials or talking to the monitoring API.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A required option is missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No credentials were handed to a provisioning call.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Transport failure or non-2xx response from the API.
    #[error("{}", format_remote(.status, .detail))]
    RemoteApi {
        /// HTTP status code, absent for connection-level failures.
        status: Option<u16>,
        /// Sanitised detail from the response or transport.
        detail: String,
    },
}

fn format_remote(status: &Option<u16>, detail: &str) -> String {
    match status {
        Some(code) => format!("monitoring API request failed: HTTP {}: {}", code, detail),
        None => format!("monitoring API request failed: {}", detail),
    }
}

impl ProvisionError {
    pub fn remote(status: u16, detail: impl Into<String>) -> Self {
        Self::RemoteApi {
            status: Some(status),
            detail: detail.into(),
        }
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::RemoteApi {
            status: None,
            detail: detail.into(),
        }
    }

    /// HTTP status of a remote failure, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RemoteApi { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProvisionError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::remote(status.as_u16(), err.to_string()),
            None => Self::transport(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display_includes_status() {
        let err = ProvisionError::remote(503, "service unavailable");
        assert_eq!(
            err.to_string(),
            "monitoring API request failed: HTTP 503: service unavailable"
        );
        assert_eq!(err.status(), Some(503));
    }

    #[test]
    fn test_transport_error_has_no_status() {
        let err = ProvisionError::transport("connection refused");
        assert_eq!(err.status(), None);
        assert!(err.to_string().contains("connection refused"));
    }
}
