//! GitHub authorization: the device-code login flow and the exchange of a
//! GitHub credential for a short-lived Copilot token.

pub mod device;
pub mod github;
pub mod resolver;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::token::CopilotToken;

pub use device::PendingLogins;
pub use github::GitHubAuth;
pub use resolver::TokenResolver;

/// Returned by `login/device/code` and handed to the caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    /// Minimum seconds between polls.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Seconds until the device code stops being accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

fn default_interval() -> u64 {
    5
}

/// One poll of the OAuth token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The user approved; carries the long-lived GitHub credential.
    Authorized(String),
    /// The user has not acted yet.
    Pending,
    /// Polling too fast; back off.
    SlowDown,
    Denied(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("github request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("github returned {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("authorization denied: {0}")]
    Denied(String),

    #[error("device code expired")]
    Expired,

    #[error("unexpected github response: {0}")]
    Malformed(String),
}

/// The three calls the gateway makes against GitHub.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn request_device_code(&self) -> Result<DeviceCode, AuthError>;

    async fn poll_access_token(&self, device_code: &str) -> Result<PollOutcome, AuthError>;

    /// Exchanges a GitHub credential for a Copilot token.
    async fn issue_token(&self, credential: &str) -> Result<CopilotToken, AuthError>;
}
