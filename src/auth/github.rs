use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{AuthError, DeviceCode, PollOutcome, TokenIssuer};
use crate::config::Config;
use crate::models::token::{mask, CopilotToken};
use crate::proxy::transform::COPILOT_USER_AGENT;

const SCOPE: &str = "read:user";
const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// [`TokenIssuer`] backed by github.com and api.github.com.
#[derive(Clone)]
pub struct GitHubAuth {
    http: reqwest::Client,
    github_url: String,
    api_url: String,
    client_id: String,
}

/// Body of `login/oauth/access_token`. GitHub answers 200 for pending polls
/// too, with `error` set instead of `access_token`.
#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: Option<String>,
}

impl GitHubAuth {
    pub fn new(
        github_url: impl Into<String>,
        api_url: impl Into<String>,
        client_id: impl Into<String>,
        connect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(connect_timeout)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            github_url: github_url.into().trim_end_matches('/').to_string(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(
            config.github_url.clone(),
            config.github_api_url.clone(),
            config.client_id.clone(),
            config.connect_timeout,
        )
    }
}

async fn rejected(resp: reqwest::Response) -> AuthError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .ok()
        .and_then(|e| e.message)
        .filter(|m| !m.is_empty())
        .unwrap_or(body);
    AuthError::Rejected { status, message }
}

#[async_trait]
impl TokenIssuer for GitHubAuth {
    async fn request_device_code(&self) -> Result<DeviceCode, AuthError> {
        let resp = self
            .http
            .post(format!("{}/login/device/code", self.github_url))
            .header("accept", "application/json")
            .json(&json!({ "client_id": self.client_id, "scope": SCOPE }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(rejected(resp).await);
        }

        let code: DeviceCode = resp
            .json()
            .await
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        tracing::info!(
            user_code = %code.user_code,
            verification_uri = %code.verification_uri,
            "device code issued"
        );
        Ok(code)
    }

    async fn poll_access_token(&self, device_code: &str) -> Result<PollOutcome, AuthError> {
        let resp = self
            .http
            .post(format!("{}/login/oauth/access_token", self.github_url))
            .header("accept", "application/json")
            .json(&json!({
                "client_id": self.client_id,
                "device_code": device_code,
                "grant_type": DEVICE_GRANT,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(rejected(resp).await);
        }

        let body: AccessTokenResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Malformed(e.to_string()))?;

        if let Some(token) = body.access_token.filter(|t| !t.is_empty()) {
            tracing::info!(credential = %mask(&token), "device flow authorized");
            return Ok(PollOutcome::Authorized(token));
        }

        match body.error.as_deref() {
            Some("authorization_pending") => Ok(PollOutcome::Pending),
            Some("slow_down") => Ok(PollOutcome::SlowDown),
            Some("expired_token") => Err(AuthError::Expired),
            Some(other) => Ok(PollOutcome::Denied(
                body.error_description.unwrap_or_else(|| other.to_string()),
            )),
            None => Err(AuthError::Malformed(
                "neither access_token nor error in response".to_string(),
            )),
        }
    }

    async fn issue_token(&self, credential: &str) -> Result<CopilotToken, AuthError> {
        let resp = self
            .http
            .get(format!("{}/copilot_internal/v2/token", self.api_url))
            .header("authorization", format!("token {}", credential))
            .header("user-agent", COPILOT_USER_AGENT)
            .header("accept", "application/json")
            .send()
            .await?;

        if !resp.status().is_success() {
            let err = rejected(resp).await;
            tracing::warn!(credential = %mask(credential), "copilot token issuance failed: {}", err);
            return Err(err);
        }

        let token: CopilotToken = resp
            .json()
            .await
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        tracing::debug!(
            credential = %mask(credential),
            expires_at = token.expires_at,
            "copilot token issued"
        );
        Ok(token)
    }
}
