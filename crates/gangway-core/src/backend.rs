//! HTTP client for the backend control endpoints.
//!
//! The backend owns token validation and session cookies. Gangway talks to
//! it on four fixed endpoints under [`PROXY_PREFIX`]:
//!
//! - `POST {prefix}/authenticate` - exchange a token for a session cookie
//! - `GET  {prefix}/status`       - token validity check (bearer header)
//! - `DELETE {prefix}/logout`     - drop the backend-side session
//! - `GET  /health`               - service health probe

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::session::SessionCookie;

/// Fixed sub-path prefix all proxied traffic and control calls live under.
pub const PROXY_PREFIX: &str = "/api/v1/proxy";

/// Bearer-style token header sent to the backend in application mode.
pub const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";

/// Device identifier header sent to the backend in application mode.
pub const DEVICE_ID_HEADER: &str = "X-Device-Id";

/// Result of a successful authenticate call.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub user_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Session cookie the backend issued, if any.
    pub cookie: Option<SessionCookie>,
}

#[derive(Debug, Deserialize)]
struct AuthenticateBody {
    user_id: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<String>,
}

/// Token validity payload from the status endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenStatus {
    pub valid: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Backend health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    /// Probe could not reach the backend at all.
    Unreachable,
}

/// Outcome of one health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn unreachable(error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unreachable,
            timestamp: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Client for the backend control endpoints.
#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
}

impl BackendClient {
    /// Creates a client for the given backend base URL.
    ///
    /// The backend may sit behind the same self-signed certificate setup as
    /// the proxy itself, so certificate verification is disabled for these
    /// local control calls.
    pub fn new(backend_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| CoreError::Config(format!("failed to build backend client: {e}")))?;

        Ok(Self {
            base_url: backend_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn prefixed(&self, endpoint: &str) -> String {
        format!("{}{}{}", self.base_url, PROXY_PREFIX, endpoint)
    }

    /// Exchanges an access token for a backend session cookie.
    pub async fn authenticate(&self, token: &str) -> Result<AuthGrant> {
        let resp = self
            .client
            .post(self.prefixed("/authenticate"))
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(connect_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(|b| b.detail)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(CoreError::Auth(detail));
        }

        let cookie = resp
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(parse_set_cookie);

        let body: AuthenticateBody = resp
            .json()
            .await
            .map_err(|e| CoreError::InvalidResponse(e.to_string()))?;

        tracing::info!(user_id = %body.user_id, "backend authentication successful");

        Ok(AuthGrant {
            user_id: body.user_id,
            expires_at: body.expires_at,
            cookie,
        })
    }

    /// Checks token validity on the backend.
    pub async fn check_status(&self, token: &str) -> Result<TokenStatus> {
        let resp = self
            .client
            .get(self.prefixed("/status"))
            .header(ACCESS_TOKEN_HEADER, token)
            .send()
            .await
            .map_err(connect_error)?;

        if !resp.status().is_success() {
            return Err(CoreError::Auth(format!("HTTP {}", resp.status())));
        }

        resp.json()
            .await
            .map_err(|e| CoreError::InvalidResponse(e.to_string()))
    }

    /// Drops the backend-side session. Best effort: callers treat failure
    /// as non-fatal.
    pub async fn logout(&self) -> Result<()> {
        let resp = self
            .client
            .delete(self.prefixed("/logout"))
            .send()
            .await
            .map_err(connect_error)?;

        if resp.status().is_success() {
            tracing::info!("backend logout successful");
            Ok(())
        } else {
            Err(CoreError::Request(format!(
                "logout failed: HTTP {}",
                resp.status()
            )))
        }
    }

    /// Probes the backend health endpoint.
    ///
    /// Connection failures are a report, not an error: the health watcher
    /// keeps running whatever the backend does.
    pub async fn check_health(&self) -> HealthReport {
        let url = format!("{}/health", self.base_url);
        let resp = match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return HealthReport::unreachable(e.to_string()),
        };

        if !resp.status().is_success() {
            return HealthReport {
                status: HealthStatus::Unhealthy,
                timestamp: None,
                error: Some(format!("HTTP {}", resp.status())),
            };
        }

        match resp.json::<HealthBody>().await {
            Ok(body) => HealthReport {
                status: parse_health_status(&body.status),
                timestamp: body.timestamp,
                error: None,
            },
            Err(e) => HealthReport {
                status: HealthStatus::Unhealthy,
                timestamp: None,
                error: Some(format!("malformed health payload: {e}")),
            },
        }
    }
}

fn connect_error(e: reqwest::Error) -> CoreError {
    if e.is_connect() || e.is_timeout() {
        CoreError::BackendUnreachable(e.to_string())
    } else {
        CoreError::Request(e.to_string())
    }
}

fn parse_health_status(status: &str) -> HealthStatus {
    match status.to_ascii_lowercase().as_str() {
        "healthy" | "ok" => HealthStatus::Healthy,
        "degraded" => HealthStatus::Degraded,
        _ => HealthStatus::Unhealthy,
    }
}

/// Parses a `Set-Cookie` header value into the fields Gangway cares about.
pub fn parse_set_cookie(header: &str) -> Option<SessionCookie> {
    let mut parts = header.split(';').map(str::trim);

    let (name, value) = parts.next()?.split_once('=')?;
    if name.is_empty() {
        return None;
    }

    let mut max_age = None;
    let mut path = "/".to_string();
    for attr in parts {
        let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
        match key.to_ascii_lowercase().as_str() {
            "max-age" => max_age = val.parse().ok(),
            "path" if !val.is_empty() => path = val.to_string(),
            _ => {}
        }
    }

    Some(SessionCookie {
        name: name.to_string(),
        value: value.to_string(),
        max_age,
        path,
    })
}
