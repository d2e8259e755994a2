//! Copilot Gateway: OpenAI-compatible chat completions for callers holding a
//! GitHub Copilot login.
//!
//! The binary in `main.rs` wires these modules together; integration tests in
//! `tests/` drive them through [`api::router`].

use std::sync::Arc;

pub mod api;
pub mod auth;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod models;
pub mod proxy;
pub mod store;

use auth::{PendingLogins, TokenIssuer, TokenResolver};
use cache::TokenCache;
use config::Config;
use proxy::model_router::DeliveryPolicy;
use proxy::upstream::UpstreamClient;

/// Shared application state passed to handlers.
pub struct AppState {
    pub config: Config,
    pub resolver: TokenResolver,
    pub issuer: Arc<dyn TokenIssuer>,
    pub logins: PendingLogins,
    pub upstream_client: UpstreamClient,
    pub delivery: DeliveryPolicy,
}

impl AppState {
    pub fn new(
        config: Config,
        tokens: TokenCache,
        issuer: Arc<dyn TokenIssuer>,
    ) -> anyhow::Result<Self> {
        let upstream_client = UpstreamClient::new(config.connect_timeout)?;
        let delivery = DeliveryPolicy::new(config.buffered_model_prefixes.clone());
        Ok(Self {
            resolver: TokenResolver::new(tokens, issuer.clone()),
            issuer,
            logins: PendingLogins::new(),
            upstream_client,
            delivery,
            config,
        })
    }

    pub fn tokens(&self) -> &TokenCache {
        self.resolver.cache()
    }
}
