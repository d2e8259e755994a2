//! HTTP client for forwarding requests to the Copilot completion API.
//! No retries: a failed call is reported to the caller, who owns retry policy.

use std::time::Duration;

use axum::http::HeaderMap;
use bytes::Bytes;

use crate::errors::AppError;

#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        // No total timeout; callers bound the parts they wait on.
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(32)
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self { client })
    }

    /// Sends one request and returns as soon as response headers arrive.
    pub async fn forward(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, AppError> {
        let resp = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Upstream request failed: {}", e);
                AppError::Upstream(e.to_string())
            })?;

        Ok(resp)
    }
}
